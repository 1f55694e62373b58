//! Pin backend boundary: the component that actually registers memory with
//! the NIC.
//!
//! The cache never talks to hardware itself. It batches granule runs into
//! region lists and hands them to a [`PinBackend`], which may vectorize them
//! into a single registration call. A page-granularity bookkeeping
//! implementation, [`PageBackend`], is provided as the default flavor and as
//! the test double; real conduits wrap their verbs library instead.

use crate::region::Region;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::io;
use std::sync::Arc;

/// Hardware registration contract consumed by the cache.
///
/// Calls are made synchronously while the cache mutex is held; an
/// implementation must not call back into the cache and must not block
/// indefinitely. `pin`/`unpin` receive coalesced, granule-aligned runs.
pub trait PinBackend: Send + 'static {
    /// Fixed registration granule in bytes. Must be a power of two; page
    /// size for the default flavor.
    fn granularity(&self) -> u64;

    /// Register every region in the list. All-or-nothing: on error the
    /// backend must leave no region of the batch registered.
    fn pin(&mut self, regions: &[Region]) -> io::Result<()>;

    /// Deregister every region in the list.
    fn unpin(&mut self, regions: &[Region]) -> io::Result<()>;
}

/// Page-granularity bookkeeping backend.
///
/// Tracks registered granules in a set, enforces a byte capacity, and counts
/// calls. Cheaply clonable (shared interior) so a caller can keep a handle
/// for inspection after moving the backend into the cache, the same pattern
/// the registered slab pools use for their memory regions.
#[derive(Clone)]
pub struct PageBackend {
    inner: Arc<Mutex<PageInner>>,
    granularity: u64,
}

struct PageInner {
    registered: FxHashSet<u64>,
    max_granules: usize,
    pin_calls: u64,
    unpin_calls: u64,
    pinned_granules: u64,
    unpinned_granules: u64,
}

impl PageBackend {
    /// Default page size used when none is specified.
    pub const PAGE_SIZE: u64 = 4096;

    /// Create a backend with the given granule size and byte capacity.
    pub fn new(granularity: u64, max_pinnable_bytes: u64) -> Self {
        assert!(granularity.is_power_of_two());
        Self {
            inner: Arc::new(Mutex::new(PageInner {
                registered: FxHashSet::default(),
                max_granules: (max_pinnable_bytes / granularity) as usize,
                pin_calls: 0,
                unpin_calls: 0,
                pinned_granules: 0,
                unpinned_granules: 0,
            })),
            granularity,
        }
    }

    /// Mark regions as registered without counting a pin call, for memory
    /// that was pinned before the cache existed.
    pub fn preregister(&self, regions: &[Region]) {
        let mut inner = self.inner.lock();
        for region in regions {
            for base in region.granules(self.granularity) {
                inner.registered.insert(base);
            }
        }
    }

    /// Number of `pin` batches issued so far.
    pub fn pin_calls(&self) -> u64 {
        self.inner.lock().pin_calls
    }

    /// Number of `unpin` batches issued so far.
    pub fn unpin_calls(&self) -> u64 {
        self.inner.lock().unpin_calls
    }

    /// Total granules registered by `pin` so far (cumulative).
    pub fn pinned_granules(&self) -> u64 {
        self.inner.lock().pinned_granules
    }

    /// Total granules deregistered by `unpin` so far (cumulative).
    pub fn unpinned_granules(&self) -> u64 {
        self.inner.lock().unpinned_granules
    }

    /// Granules currently registered.
    pub fn resident_granules(&self) -> usize {
        self.inner.lock().registered.len()
    }

    fn check_aligned(&self, region: &Region) -> io::Result<()> {
        let mask = self.granularity - 1;
        if region.addr() & mask != 0 || region.len() & mask != 0 || region.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "region {:#x}+{:#x} not aligned to {:#x}-byte granules",
                    region.addr(),
                    region.len(),
                    self.granularity
                ),
            ));
        }
        Ok(())
    }
}

impl PinBackend for PageBackend {
    fn granularity(&self) -> u64 {
        self.granularity
    }

    fn pin(&mut self, regions: &[Region]) -> io::Result<()> {
        for region in regions {
            self.check_aligned(region)?;
        }
        let mut inner = self.inner.lock();
        let count: u64 = regions.iter().map(|r| r.len() / self.granularity).sum();
        if inner.registered.len() + count as usize > inner.max_granules {
            return Err(io::Error::other(format!(
                "pin capacity exceeded ({} granules max)",
                inner.max_granules
            )));
        }
        for region in regions {
            for base in region.granules(self.granularity) {
                if !inner.registered.insert(base) {
                    return Err(io::Error::other(format!(
                        "granule {base:#x} registered twice"
                    )));
                }
            }
        }
        inner.pin_calls += 1;
        inner.pinned_granules += count;
        Ok(())
    }

    fn unpin(&mut self, regions: &[Region]) -> io::Result<()> {
        for region in regions {
            self.check_aligned(region)?;
        }
        let mut inner = self.inner.lock();
        for region in regions {
            for base in region.granules(self.granularity) {
                if !inner.registered.remove(&base) {
                    return Err(io::Error::other(format!(
                        "granule {base:#x} was not registered"
                    )));
                }
                inner.unpinned_granules += 1;
            }
        }
        inner.unpin_calls += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_backend_roundtrip() {
        let mut backend = PageBackend::new(4096, 1 << 20);
        let handle = backend.clone();

        backend
            .pin(&[Region::new(0x1000, 0x3000), Region::new(0x8000, 0x1000)])
            .unwrap();
        assert_eq!(handle.pin_calls(), 1);
        assert_eq!(handle.resident_granules(), 4);

        backend.unpin(&[Region::new(0x2000, 0x1000)]).unwrap();
        assert_eq!(handle.resident_granules(), 3);

        // Double pin and unknown unpin are refused.
        assert!(backend.pin(&[Region::new(0x1000, 0x1000)]).is_err());
        assert!(backend.unpin(&[Region::new(0x2000, 0x1000)]).is_err());
    }

    #[test]
    fn test_page_backend_capacity() {
        let mut backend = PageBackend::new(4096, 2 * 4096);
        backend.pin(&[Region::new(0, 2 * 4096)]).unwrap();
        let err = backend.pin(&[Region::new(0x10000, 4096)]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn test_page_backend_alignment() {
        let mut backend = PageBackend::new(4096, 1 << 20);
        let err = backend.pin(&[Region::new(0x1010, 0x20)]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
