//! Mutable cache state and the local pin manager.
//!
//! Everything here runs under the single cache mutex held by
//! [`Firehose`](crate::Firehose). Methods mutate the table, FIFOs, and
//! request pool directly; anything that must happen without the mutex
//! (messenger sends, user callbacks) is returned to the caller as data.

use crate::backend::PinBackend;
use crate::cache::bucket::{BucketKey, BucketState};
use crate::cache::fifo::VictimFifo;
use crate::cache::remote::{InflightPin, PeerState};
use crate::cache::request::{RequestId, RequestKind, RequestPool, RequestRecord, RequestState};
use crate::cache::table::BucketTable;
use crate::config::FirehoseConfig;
use crate::error::{FirehoseError, Result};
use crate::region::{coalesce, NodeId, Region};
use crate::transport::PinRequestId;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

pub(crate) struct CacheState<B: PinBackend> {
    pub(crate) backend: B,
    pub(crate) granularity: u64,
    pub(crate) local_node: NodeId,
    pub(crate) max_local_buckets: usize,
    pub(crate) per_peer_buckets: usize,
    pub(crate) table: BucketTable,
    pub(crate) requests: RequestPool,
    pub(crate) local_fifo: VictimFifo,
    pub(crate) peers: FxHashMap<NodeId, PeerState>,
    /// Buckets physically registered on this node (in use + victims).
    pub(crate) local_pinned: usize,
    pub(crate) next_pin_request: PinRequestId,
    pub(crate) inflight: FxHashMap<PinRequestId, InflightPin>,
    pub(crate) finished: bool,
}

/// Point-in-time counters for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStats {
    pub node: NodeId,
    /// Buckets firehosed to the peer: in use + pending + parked victims.
    pub tracked: usize,
    /// Of those, buckets parked in the peer's victim FIFO.
    pub victims: usize,
}

/// Point-in-time snapshot of cache occupancy.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub buckets: usize,
    pub live_requests: usize,
    pub local_pinned: usize,
    pub local_victims: usize,
    pub peers: Vec<PeerStats>,
}

impl<B: PinBackend> CacheState<B> {
    pub(crate) fn new(config: &FirehoseConfig, backend: B, granularity: u64) -> Result<Self> {
        let mut state = Self {
            backend,
            granularity,
            local_node: config.local_node,
            max_local_buckets: config.max_local_buckets,
            per_peer_buckets: config.per_peer_buckets,
            table: BucketTable::new(config.max_buckets),
            requests: RequestPool::new(config.max_requests),
            local_fifo: VictimFifo::new(),
            peers: FxHashMap::default(),
            local_pinned: 0,
            next_pin_request: 1,
            inflight: FxHashMap::default(),
            finished: false,
        };
        state.seed_prepinned(&config.prepinned)?;
        Ok(state)
    }

    /// Seed regions registered before the cache existed: evictable from the
    /// start, reclaimable for free, no backend call.
    fn seed_prepinned(&mut self, regions: &[Region]) -> Result<()> {
        for region in regions {
            for base in region.granules(self.granularity) {
                if self.local_pinned >= self.max_local_buckets {
                    return Err(FirehoseError::Config(
                        "pre-pinned regions exceed local pin capacity".into(),
                    ));
                }
                let key = self.key(self.local_node, base);
                if self.table.lookup(key).is_some() {
                    continue;
                }
                let slot = self.table.insert(key, BucketState::Evictable)?;
                self.local_fifo.push_tail(&mut self.table, slot);
                self.local_pinned += 1;
            }
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn key(&self, node: NodeId, base: u64) -> BucketKey {
        BucketKey::new(node, base, self.granularity)
    }

    // ---- local pin manager ----

    /// Pin every bucket covering `span`, creating pins as needed.
    pub(crate) fn local_pin(&mut self, span: Region) -> Result<RequestId> {
        let mut resident = Vec::new();
        let mut misses = Vec::new();
        for base in span.granules(self.granularity) {
            match self.table.lookup(self.key(self.local_node, base)) {
                Some(slot) => resident.push(slot),
                None => misses.push(base),
            }
        }

        // Fail before mutating: handle slot, descriptor room.
        if !self.requests.has_room() {
            return Err(FirehoseError::RequestsExhausted(self.requests.live()));
        }
        if !self.table.has_room(misses.len()) {
            return Err(FirehoseError::TableFull(misses.len()));
        }

        // Reference the resident buckets before making room, so the victim
        // sweep cannot evict a bucket this very request covers.
        for &slot in &resident {
            self.acquire_local_bucket(slot);
        }

        if !misses.is_empty() {
            let pinned = self.make_local_room(misses.len()).and_then(|()| {
                let runs = coalesce(&misses, self.granularity);
                self.backend.pin(&runs).map_err(FirehoseError::Backend)
            });
            if let Err(e) = pinned {
                for &slot in &resident {
                    self.release_bucket_ref(slot, RequestKind::Local, self.local_node);
                }
                return Err(e);
            }
            debug!("pinned {} new local buckets", misses.len());
            for &base in &misses {
                let key = self.key(self.local_node, base);
                self.table
                    .insert(key, BucketState::Pinned { local: 1, remote: 0 })?;
                self.local_pinned += 1;
            }
        }

        self.requests.alloc(RequestRecord {
            node: self.local_node,
            span,
            kind: RequestKind::Local,
            state: RequestState::Pinned,
        })
    }

    /// Pin `span` only if every covering bucket is already resident.
    pub(crate) fn try_local_pin(&mut self, span: Region) -> Result<Option<RequestId>> {
        let all_resident = span
            .granules(self.granularity)
            .all(|base| self.table.lookup(self.key(self.local_node, base)).is_some());
        if !all_resident {
            return Ok(None);
        }
        if !self.requests.has_room() {
            return Err(FirehoseError::RequestsExhausted(self.requests.live()));
        }
        for base in span.granules(self.granularity) {
            let slot = self
                .table
                .lookup(self.key(self.local_node, base))
                .expect("resident bucket vanished");
            self.acquire_local_bucket(slot);
        }
        Ok(Some(self.requests.alloc(RequestRecord {
            node: self.local_node,
            span,
            kind: RequestKind::Local,
            state: RequestState::Pinned,
        })?))
    }

    /// Pin the longest already-resident prefix of `span`, if any.
    pub(crate) fn partial_local_pin(&mut self, span: Region) -> Result<Option<(RequestId, Region)>> {
        let mut resident = Vec::new();
        for base in span.granules(self.granularity) {
            match self.table.lookup(self.key(self.local_node, base)) {
                Some(slot) => resident.push(slot),
                None => break,
            }
        }
        if resident.is_empty() {
            return Ok(None);
        }
        if !self.requests.has_room() {
            return Err(FirehoseError::RequestsExhausted(self.requests.live()));
        }
        for &slot in &resident {
            self.acquire_local_bucket(slot);
        }
        let aligned = span.aligned(self.granularity);
        let prefix_end = aligned.addr() + resident.len() as u64 * self.granularity;
        let clipped = span.clipped(prefix_end);
        let id = self.requests.alloc(RequestRecord {
            node: self.local_node,
            span: clipped,
            kind: RequestKind::Local,
            state: RequestState::Pinned,
        })?;
        Ok(Some((id, clipped)))
    }

    /// Take one local reference on a resident bucket, reclaiming it from the
    /// victim FIFO if parked there.
    fn acquire_local_bucket(&mut self, slot: u32) {
        if matches!(self.table.get(slot).state, BucketState::Evictable) {
            self.local_fifo.unlink(&mut self.table, slot);
            self.table.get_mut(slot).state = BucketState::Pinned { local: 1, remote: 0 };
            return;
        }
        match &mut self.table.get_mut(slot).state {
            BucketState::Pinned { local, .. } => *local += 1,
            // Local buckets never await a round trip.
            _ => unreachable!("local bucket pending"),
        }
    }

    /// Evict from the local victim FIFO until `need` more pins fit, then
    /// deregister the victims in one vectorized call.
    fn make_local_room(&mut self, need: usize) -> Result<()> {
        let over = (self.local_pinned + need).saturating_sub(self.max_local_buckets);
        if over == 0 {
            return Ok(());
        }
        if over > self.local_fifo.len() {
            return Err(FirehoseError::CachePressure);
        }
        let mut victims = Vec::with_capacity(over);
        for _ in 0..over {
            let slot = self
                .local_fifo
                .pop_head(&mut self.table)
                .expect("victim count checked");
            let bucket = self.table.remove(slot);
            debug_assert!(matches!(bucket.state, BucketState::Evictable));
            victims.push(bucket.key.addr(self.granularity));
            self.local_pinned -= 1;
        }
        let runs = coalesce(&victims, self.granularity);
        debug!("evicted {} local victims", victims.len());
        self.backend.unpin(&runs).map_err(FirehoseError::Backend)
    }

    // ---- release ----

    /// Retire a caller's handle, dropping one reference per covered bucket.
    /// Zero-ref buckets park in the appropriate victim FIFO; nothing is
    /// unpinned and no message is sent.
    pub(crate) fn release(&mut self, id: RequestId) {
        let Some(record) = self.requests.free(id) else {
            debug_assert!(false, "stale or foreign request handle");
            warn!("released a stale request handle, ignoring");
            return;
        };
        debug_assert!(
            matches!(record.state, RequestState::Pinned),
            "released a pending request"
        );
        for base in record.span.granules(self.granularity) {
            let key = self.key(record.node, base);
            let Some(slot) = self.table.lookup(key) else {
                debug_assert!(false, "released bucket missing from table");
                continue;
            };
            self.release_bucket_ref(slot, record.kind, record.node);
        }
    }

    pub(crate) fn release_bucket_ref(&mut self, slot: u32, kind: RequestKind, node: NodeId) {
        let state = &mut self.table.get_mut(slot).state;
        let BucketState::Pinned { local, remote } = state else {
            debug_assert!(false, "released bucket not pinned");
            return;
        };
        match kind {
            RequestKind::Local => {
                debug_assert!(*local > 0);
                *local = local.saturating_sub(1);
            }
            RequestKind::Remote => {
                debug_assert!(*remote > 0);
                *remote = remote.saturating_sub(1);
            }
        }
        if *local == 0 && *remote == 0 {
            *state = BucketState::Evictable;
            if node == self.local_node {
                self.local_fifo.push_tail(&mut self.table, slot);
            } else {
                let peer = self.peers.entry(node).or_insert_with(PeerState::new);
                peer.fifo.push_tail(&mut self.table, slot);
            }
        }
    }

    // ---- serving peers (this node as pinning target) ----

    /// Pin `pins` on behalf of a peer, returning the regions actually
    /// pinned. Under pin pressure the grant is a greedy subset; the
    /// shortfall is the peer's signal to fall back.
    pub(crate) fn pin_for_peer(&mut self, from: NodeId, pins: &[Region]) -> Result<Vec<Region>> {
        // Reference the resident buckets first, so the victim sweep below
        // cannot evict a bucket this very request covers.
        let mut granted = Vec::new();
        let mut acquired = Vec::new();
        let mut misses = Vec::new();
        for region in pins {
            for base in region.granules(self.granularity) {
                match self.table.lookup(self.key(self.local_node, base)) {
                    Some(slot) => {
                        self.acquire_peer_ref(slot);
                        acquired.push(slot);
                        granted.push(base);
                    }
                    None => misses.push(base),
                }
            }
        }

        // Plan the misses: each needs a descriptor and a pin slot, evicting
        // local victims as required. Whatever does not fit is declined.
        // Descriptors are reserved up front so has_room stays accurate.
        let mut to_evict = Vec::new();
        let mut to_pin = Vec::new();
        for &base in &misses {
            if self.local_pinned >= self.max_local_buckets {
                let Some(slot) = self.local_fifo.pop_head(&mut self.table) else {
                    continue; // declined
                };
                let bucket = self.table.remove(slot);
                to_evict.push(bucket.key.addr(self.granularity));
                self.local_pinned -= 1;
            }
            if !self.table.has_room(1) {
                continue; // declined
            }
            let key = self.key(self.local_node, base);
            self.table.insert(key, BucketState::Pinned { local: 0, remote: 1 })?;
            self.local_pinned += 1;
            to_pin.push(base);
        }

        let backend_result: std::io::Result<()> = (|| {
            if !to_evict.is_empty() {
                self.backend.unpin(&coalesce(&to_evict, self.granularity))?;
            }
            if !to_pin.is_empty() {
                self.backend.pin(&coalesce(&to_pin, self.granularity))?;
            }
            Ok(())
        })();
        if let Err(e) = backend_result {
            // Walk back the reserved descriptors and the references taken
            // above before reporting.
            for &base in &to_pin {
                let key = self.key(self.local_node, base);
                if let Some(slot) = self.table.lookup(key) {
                    self.table.remove(slot);
                    self.local_pinned -= 1;
                }
            }
            for &slot in &acquired {
                self.release_bucket_ref(slot, RequestKind::Remote, self.local_node);
            }
            return Err(FirehoseError::Backend(e));
        }
        granted.extend_from_slice(&to_pin);

        let declined = misses.len() - to_pin.len();
        if declined > 0 {
            warn!("declined {declined} buckets of a pin request from node {from} under pin pressure");
        }
        Ok(coalesce(&granted, self.granularity))
    }

    /// Take one peer-held reference on a resident local bucket.
    fn acquire_peer_ref(&mut self, slot: u32) {
        if matches!(self.table.get(slot).state, BucketState::Evictable) {
            self.local_fifo.unlink(&mut self.table, slot);
            self.table.get_mut(slot).state = BucketState::Pinned { local: 0, remote: 1 };
            return;
        }
        match &mut self.table.get_mut(slot).state {
            BucketState::Pinned { remote, .. } => *remote += 1,
            _ => unreachable!("local bucket pending"),
        }
    }

    /// Drop the references a peer held on our buckets (piggybacked unpins or
    /// an explicit notify).
    pub(crate) fn unpin_for_peer(&mut self, from: NodeId, regions: &[Region]) {
        for region in regions {
            for base in region.granules(self.granularity) {
                let key = self.key(self.local_node, base);
                let Some(slot) = self.table.lookup(key) else {
                    debug_assert!(false, "peer unpinned an unknown bucket");
                    warn!("unpin notify from node {from} for unknown bucket {base:#x}");
                    continue;
                };
                self.release_bucket_ref(slot, RequestKind::Remote, self.local_node);
            }
        }
    }

    // ---- observability ----

    pub(crate) fn stats(&self) -> CacheStats {
        let mut peers: Vec<PeerStats> = self
            .peers
            .iter()
            .map(|(&node, peer)| PeerStats {
                node,
                tracked: peer.tracked,
                victims: peer.fifo.len(),
            })
            .collect();
        peers.sort_by_key(|p| p.node);
        CacheStats {
            buckets: self.table.len(),
            live_requests: self.requests.live(),
            local_pinned: self.local_pinned,
            local_victims: self.local_fifo.len(),
            peers,
        }
    }

    /// Debug-build sweep of the core invariant: refcount > 0 iff unlinked.
    pub(crate) fn debug_validate(&self) {
        #[cfg(debug_assertions)]
        for bucket in self.table.iter() {
            match &bucket.state {
                BucketState::Pinned { .. } => {
                    debug_assert!(bucket.state.total_refs() > 0);
                    debug_assert!(!bucket.is_linked(), "referenced bucket in a victim FIFO");
                }
                BucketState::Evictable => {
                    // Linked unless mid-eviction, which never crosses the mutex.
                    debug_assert!(bucket.is_linked(), "evictable bucket not in a FIFO");
                }
                BucketState::Pending { .. } => {
                    debug_assert!(!bucket.is_linked(), "pending bucket in a victim FIFO");
                }
            }
        }
    }

    // ---- shutdown ----

    /// Tear the cache down: collect per-peer unpin notifications for the
    /// caller to send, deregister every local bucket, and go inert.
    pub(crate) fn teardown(&mut self) -> (Vec<(NodeId, Vec<Region>)>, Result<()>) {
        if self.finished {
            return (Vec::new(), Ok(()));
        }
        self.finished = true;

        if self.requests.live() > 0 {
            warn!("shutting down with {} live requests", self.requests.live());
        }
        if !self.inflight.is_empty() {
            warn!("shutting down with {} pin round trips in flight", self.inflight.len());
        }

        let mut notifies: Vec<(NodeId, Vec<u64>)> = Vec::new();
        let mut local = Vec::new();
        for bucket in self.table.iter() {
            let node = bucket.key.node(self.granularity);
            let base = bucket.key.addr(self.granularity);
            if node == self.local_node {
                local.push(base);
            } else if !matches!(bucket.state, BucketState::Pending { .. }) {
                match notifies.iter_mut().find(|(n, _)| *n == node) {
                    Some((_, bases)) => bases.push(base),
                    None => notifies.push((node, vec![base])),
                }
            }
        }

        let result = if local.is_empty() {
            Ok(())
        } else {
            let runs = coalesce(&local, self.granularity);
            self.backend.unpin(&runs).map_err(FirehoseError::Backend)
        };
        self.local_pinned = 0;

        let notifies = notifies
            .into_iter()
            .map(|(node, bases)| (node, coalesce(&bases, self.granularity)))
            .collect();
        (notifies, result)
    }
}
