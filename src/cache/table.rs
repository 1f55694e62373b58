//! Bucket table: hash index over a slab-grown descriptor arena.
//!
//! Descriptors are bulk-allocated a slab at a time and recycled through a
//! freelist, so the pin/unpin hot paths never touch the heap per bucket. The
//! hash index maps packed keys to arena slots.

use crate::cache::bucket::{Bucket, BucketKey, BucketState, UNLINKED};
use crate::error::FirehoseError;
use rustc_hash::FxHashMap;

/// Descriptors added to the arena per growth step.
const SLAB_BUCKETS: usize = 256;

pub(crate) struct BucketTable {
    index: FxHashMap<BucketKey, u32>,
    slots: Vec<Option<Bucket>>,
    free: Vec<u32>,
    cap: usize,
}

impl BucketTable {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            index: FxHashMap::default(),
            slots: Vec::new(),
            free: Vec::new(),
            cap,
        }
    }

    /// Number of live buckets.
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether `extra` more descriptors fit under the cap.
    pub(crate) fn has_room(&self, extra: usize) -> bool {
        self.len() + extra <= self.cap
    }

    pub(crate) fn lookup(&self, key: BucketKey) -> Option<u32> {
        self.index.get(&key).copied()
    }

    /// Insert a descriptor for `key`. Callers gate on [`has_room`] first so a
    /// multi-bucket operation can fail before mutating anything.
    pub(crate) fn insert(
        &mut self,
        key: BucketKey,
        state: BucketState,
    ) -> Result<u32, FirehoseError> {
        debug_assert!(!self.index.contains_key(&key));
        if !self.has_room(1) {
            return Err(FirehoseError::TableFull(self.cap));
        }
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => self.grow(),
        };
        self.slots[slot as usize] = Some(Bucket::new(key, state));
        self.index.insert(key, slot);
        Ok(slot)
    }

    /// Remove the bucket in `slot`, recycling the descriptor.
    pub(crate) fn remove(&mut self, slot: u32) -> Bucket {
        let bucket = self.slots[slot as usize].take().expect("empty table slot");
        debug_assert!(!bucket.is_linked());
        self.index.remove(&bucket.key);
        self.free.push(slot);
        bucket
    }

    pub(crate) fn get(&self, slot: u32) -> &Bucket {
        self.slots[slot as usize].as_ref().expect("empty table slot")
    }

    pub(crate) fn get_mut(&mut self, slot: u32) -> &mut Bucket {
        self.slots[slot as usize].as_mut().expect("empty table slot")
    }

    /// Iterate live buckets (shutdown sweep).
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Add one slab of descriptors, returning a fresh slot.
    fn grow(&mut self) -> u32 {
        let base = self.slots.len();
        let grow_by = SLAB_BUCKETS.min(self.cap.saturating_sub(base)).max(1);
        self.slots.extend((0..grow_by).map(|_| None));
        // Hand out the first new slot, freelist the rest.
        for slot in (base + 1..base + grow_by).rev() {
            self.free.push(slot as u32);
        }
        debug_assert!(base < UNLINKED as usize);
        base as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(node: u16, addr: u64) -> BucketKey {
        BucketKey::new(node, addr, 4096)
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut table = BucketTable::new(16);
        let slot = table
            .insert(key(1, 0x1000), BucketState::Evictable)
            .unwrap();
        assert_eq!(table.lookup(key(1, 0x1000)), Some(slot));
        assert_eq!(table.lookup(key(2, 0x1000)), None);
        assert_eq!(table.len(), 1);

        table.remove(slot);
        assert_eq!(table.lookup(key(1, 0x1000)), None);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_slot_recycling() {
        let mut table = BucketTable::new(16);
        let slot = table
            .insert(key(0, 0x1000), BucketState::Evictable)
            .unwrap();
        table.remove(slot);
        let again = table
            .insert(key(0, 0x2000), BucketState::Evictable)
            .unwrap();
        assert_eq!(slot, again);
    }

    #[test]
    fn test_cap_is_typed_error() {
        let mut table = BucketTable::new(2);
        table.insert(key(0, 0x1000), BucketState::Evictable).unwrap();
        table.insert(key(0, 0x2000), BucketState::Evictable).unwrap();
        assert!(!table.has_room(1));
        assert!(matches!(
            table.insert(key(0, 0x3000), BucketState::Evictable),
            Err(FirehoseError::TableFull(2))
        ));
    }
}
