//! Request pool: caller-visible pin handles backed by a generation-checked
//! slot arena.
//!
//! A `Request` is released exactly once by value, and the generation stamp
//! means a handle that somehow outlives its slot can never alias a recycled
//! one. Slots grow in slabs up to a hard cap; the cap is a typed error.

use crate::error::{FirehoseError, Result};
use crate::region::{NodeId, Region};

/// Slots added to the arena per growth step.
const SLAB_REQUESTS: usize = 64;

/// Completion callback for an asynchronous remote pin. Receives the pinned
/// request, or the error that failed the round trip. Invoked exactly once,
/// never with the cache mutex held; it may re-enter the cache API.
pub type PinCallback = Box<dyn FnOnce(Result<Request>) + Send>;

/// Generation-stamped pool id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RequestId {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

/// Caller-visible handle for one pinned region.
///
/// Deliberately neither `Clone` nor `Copy`: handing it back through
/// [`release`](crate::Firehose::release) consumes it, so double release does
/// not typecheck.
#[derive(Debug)]
pub struct Request {
    pub(crate) id: RequestId,
    node: NodeId,
    addr: u64,
    len: u64,
}

impl Request {
    pub(crate) fn new(id: RequestId, node: NodeId, addr: u64, len: u64) -> Self {
        Self { id, node, addr, len }
    }

    /// Node owning the pinned memory.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Start of the pinned span (as requested, not granule-rounded).
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Length of the pinned span in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// The pinned span as a region.
    pub fn region(&self) -> Region {
        Region::new(self.addr, self.len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Local,
    Remote,
}

pub(crate) enum RequestState {
    /// Every covered bucket holds a reference for this request.
    Pinned,
    /// Waiting on `missing` buckets still in flight.
    Pending {
        missing: u32,
        callback: Option<PinCallback>,
    },
}

pub(crate) struct RequestRecord {
    pub(crate) node: NodeId,
    pub(crate) span: Region,
    pub(crate) kind: RequestKind,
    pub(crate) state: RequestState,
}

struct Slot {
    gen: u32,
    record: Option<RequestRecord>,
}

pub(crate) struct RequestPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    cap: usize,
    live: usize,
}

impl RequestPool {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            cap,
            live: 0,
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn has_room(&self) -> bool {
        self.live < self.cap
    }

    pub(crate) fn alloc(&mut self, record: RequestRecord) -> Result<RequestId> {
        if !self.has_room() {
            return Err(FirehoseError::RequestsExhausted(self.cap));
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => self.grow(),
        };
        let slot = &mut self.slots[index as usize];
        debug_assert!(slot.record.is_none());
        slot.record = Some(record);
        self.live += 1;
        Ok(RequestId {
            index,
            gen: slot.gen,
        })
    }

    /// Fetch the record for `id`, or `None` for a stale or foreign handle.
    pub(crate) fn get_mut(&mut self, id: RequestId) -> Option<&mut RequestRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.record.as_mut()
    }

    /// Retire `id`, bumping the slot generation so the handle goes stale.
    pub(crate) fn free(&mut self, id: RequestId) -> Option<RequestRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        let record = slot.record.take()?;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(record)
    }

    fn grow(&mut self) -> u32 {
        let base = self.slots.len();
        let grow_by = SLAB_REQUESTS.min(self.cap.saturating_sub(base)).max(1);
        self.slots
            .extend((0..grow_by).map(|_| Slot { gen: 0, record: None }));
        for index in (base + 1..base + grow_by).rev() {
            self.free.push(index as u32);
        }
        base as u32
    }
}
