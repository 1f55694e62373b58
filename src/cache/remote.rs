//! Remote pin manager: acquiring and retiring firehoses onto peers' memory.
//!
//! A remote pin is a network round trip, three orders of magnitude slower
//! than a local registration, so this side of the cache is the aggressive
//! one: unpin notifications are deferred until the per-peer budget actually
//! needs the slot back (and then piggyback on the outbound pin request), and
//! concurrent requests for an in-flight bucket queue on it instead of
//! double-requesting.
//!
//! Per-request state machine:
//! `REQUESTED -> (ALL-LOCAL-HIT | AWAITING-REMOTE) -> PINNED | FAILED`

use crate::backend::PinBackend;
use crate::cache::bucket::BucketState;
use crate::cache::fifo::VictimFifo;
use crate::cache::request::{
    PinCallback, Request, RequestId, RequestKind, RequestRecord, RequestState,
};
use crate::cache::state::CacheState;
use crate::error::{FirehoseError, Result};
use crate::region::{coalesce, NodeId, Region};
use crate::transport::PinRequestId;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

/// Per-peer firehose accounting.
pub(crate) struct PeerState {
    /// Zero-ref buckets still pinned on the peer, oldest first.
    pub(crate) fifo: VictimFifo,
    /// Buckets firehosed to the peer: in use + pending + parked victims.
    /// Bounded by the configured budget.
    pub(crate) tracked: usize,
}

impl PeerState {
    pub(crate) fn new() -> Self {
        Self {
            fifo: VictimFifo::new(),
            tracked: 0,
        }
    }
}

/// An outstanding pin round trip, keyed by the wire id.
pub(crate) struct InflightPin {
    pub(crate) node: NodeId,
    /// The missed sub-regions asked of the peer, coalesced.
    pub(crate) pins: Vec<Region>,
}

/// What `remote_pin` decided under the mutex; the facade acts on it after
/// the mutex drops.
pub(crate) enum RemoteOutcome {
    /// Every bucket was resident: the request is already pinned. The
    /// callback comes back unused; the facade either returns the request or
    /// feeds it through the callback, per the caller's flags.
    Hit {
        request: Request,
        callback: PinCallback,
    },
    /// Every missing bucket was already in flight under some other round
    /// trip; the request queued on those and completes via `poll`.
    Joined,
    /// A round trip must be dispatched (with piggybacked unpins for the
    /// victims evicted to make budget room).
    Dispatched {
        id: PinRequestId,
        origin: RequestId,
        pins: Vec<Region>,
        unpins: Vec<Region>,
    },
}

/// A completion ready to hand to its callback, outside the mutex.
pub(crate) type Completion = (PinCallback, std::result::Result<Request, FirehoseError>);

impl<B: PinBackend> CacheState<B> {
    /// Acquire firehoses covering `span` on `node`.
    pub(crate) fn remote_pin(
        &mut self,
        node: NodeId,
        span: Region,
        callback: PinCallback,
    ) -> Result<RemoteOutcome> {
        let mut hits = Vec::new();
        let mut joins = Vec::new();
        let mut misses = Vec::new();
        for base in span.granules(self.granularity) {
            match self.table.lookup(self.key(node, base)) {
                Some(slot) => {
                    if matches!(self.table.get(slot).state, BucketState::Pending { .. }) {
                        joins.push(slot);
                    } else {
                        hits.push(slot);
                    }
                }
                None => misses.push(base),
            }
        }

        if !self.requests.has_room() {
            return Err(FirehoseError::RequestsExhausted(self.requests.live()));
        }
        if !self.table.has_room(misses.len()) {
            return Err(FirehoseError::TableFull(misses.len()));
        }

        // Reference the resident buckets first: a hit parked in the peer's
        // victim FIFO must not be evicted by the budget sweep below.
        for &slot in &hits {
            self.acquire_remote_bucket(slot, node);
        }

        if misses.is_empty() && joins.is_empty() {
            let id = self.requests.alloc(RequestRecord {
                node,
                span,
                kind: RequestKind::Remote,
                state: RequestState::Pinned,
            })?;
            let request = Request::new(id, node, span.addr(), span.len());
            return Ok(RemoteOutcome::Hit { request, callback });
        }

        // Make budget room for the misses before anything is marked pending,
        // so the operation fails cleanly when the peer is saturated with
        // in-use firehoses. Victims evicted here ride the outbound message.
        let peer = self.peers.entry(node).or_insert_with(PeerState::new);
        let over = (peer.tracked + misses.len()).saturating_sub(self.per_peer_buckets);
        if over > peer.fifo.len() {
            for &slot in &hits {
                self.release_bucket_ref(slot, RequestKind::Remote, node);
            }
            return Err(FirehoseError::PeerBudget { node });
        }
        let mut evicted = Vec::with_capacity(over);
        for _ in 0..over {
            let peer = self.peers.get_mut(&node).expect("peer exists");
            let slot = peer
                .fifo
                .pop_head(&mut self.table)
                .expect("victim count checked");
            let bucket = self.table.remove(slot);
            debug_assert!(matches!(bucket.state, BucketState::Evictable));
            peer.tracked -= 1;
            evicted.push(bucket.key.addr(self.granularity));
        }

        let id = self.requests.alloc(RequestRecord {
            node,
            span,
            kind: RequestKind::Remote,
            state: RequestState::Pending {
                missing: (misses.len() + joins.len()) as u32,
                callback: Some(callback),
            },
        })?;
        for &slot in &joins {
            match &mut self.table.get_mut(slot).state {
                BucketState::Pending { waiters } => waiters.push(id),
                _ => unreachable!("join target not pending"),
            }
        }
        for &base in &misses {
            let key = self.key(node, base);
            self.table
                .insert(key, BucketState::Pending { waiters: vec![id] })?;
            self.peers.get_mut(&node).expect("peer exists").tracked += 1;
        }

        if misses.is_empty() {
            debug!("request on node {node} joined in-flight round trips");
            return Ok(RemoteOutcome::Joined);
        }

        let wire_id = self.next_pin_request;
        self.next_pin_request += 1;
        let pins = coalesce(&misses, self.granularity);
        self.inflight.insert(
            wire_id,
            InflightPin {
                node,
                pins: pins.clone(),
            },
        );
        debug!(
            "dispatching pin round trip {wire_id} to node {node}: {} buckets, {} evicted",
            misses.len(),
            evicted.len()
        );
        Ok(RemoteOutcome::Dispatched {
            id: wire_id,
            origin: id,
            pins,
            unpins: coalesce(&evicted, self.granularity),
        })
    }

    /// Probe-only acquire: succeeds iff every covering bucket is resident
    /// (pending does not count). Never triggers a round trip.
    pub(crate) fn try_remote_pin(&mut self, node: NodeId, span: Region) -> Result<Option<RequestId>> {
        let mut slots = Vec::new();
        for base in span.granules(self.granularity) {
            match self.table.lookup(self.key(node, base)) {
                Some(slot) if !matches!(self.table.get(slot).state, BucketState::Pending { .. }) => {
                    slots.push(slot)
                }
                _ => return Ok(None),
            }
        }
        if !self.requests.has_room() {
            return Err(FirehoseError::RequestsExhausted(self.requests.live()));
        }
        for &slot in &slots {
            self.acquire_remote_bucket(slot, node);
        }
        Ok(Some(self.requests.alloc(RequestRecord {
            node,
            span,
            kind: RequestKind::Remote,
            state: RequestState::Pinned,
        })?))
    }

    /// Probe-only acquire of the longest resident prefix.
    pub(crate) fn partial_remote_pin(
        &mut self,
        node: NodeId,
        span: Region,
    ) -> Result<Option<(RequestId, Region)>> {
        let mut slots = Vec::new();
        for base in span.granules(self.granularity) {
            match self.table.lookup(self.key(node, base)) {
                Some(slot) if !matches!(self.table.get(slot).state, BucketState::Pending { .. }) => {
                    slots.push(slot)
                }
                _ => break,
            }
        }
        if slots.is_empty() {
            return Ok(None);
        }
        if !self.requests.has_room() {
            return Err(FirehoseError::RequestsExhausted(self.requests.live()));
        }
        for &slot in &slots {
            self.acquire_remote_bucket(slot, node);
        }
        let aligned = span.aligned(self.granularity);
        let prefix_end = aligned.addr() + slots.len() as u64 * self.granularity;
        let clipped = span.clipped(prefix_end);
        let id = self.requests.alloc(RequestRecord {
            node,
            span: clipped,
            kind: RequestKind::Remote,
            state: RequestState::Pinned,
        })?;
        Ok(Some((id, clipped)))
    }

    /// Take one remote reference on a resident firehose, reclaiming it from
    /// the peer's victim FIFO if parked there. Budget accounting is
    /// untouched: the bucket was already tracked.
    fn acquire_remote_bucket(&mut self, slot: u32, node: NodeId) {
        if matches!(self.table.get(slot).state, BucketState::Evictable) {
            let peer = self.peers.get_mut(&node).expect("peer with victims");
            peer.fifo.unlink(&mut self.table, slot);
            self.table.get_mut(slot).state = BucketState::Pinned { local: 0, remote: 1 };
            return;
        }
        match &mut self.table.get_mut(slot).state {
            BucketState::Pinned { remote, .. } => *remote += 1,
            _ => unreachable!("acquire of a pending bucket"),
        }
    }

    /// Apply a peer's pin reply: granted buckets go live and wake their
    /// waiters; declined buckets fail every request queued on them.
    /// Returns the completions to deliver once the mutex drops.
    pub(crate) fn resolve_reply(
        &mut self,
        from: NodeId,
        id: PinRequestId,
        pinned: &[Region],
    ) -> Vec<Completion> {
        let Some(inflight) = self.inflight.remove(&id) else {
            warn!("pin reply from node {from} for unknown round trip {id}");
            return Vec::new();
        };
        debug_assert_eq!(inflight.node, from);

        let granted: FxHashSet<u64> = pinned
            .iter()
            .flat_map(|r| r.granules(self.granularity))
            .collect();

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for region in &inflight.pins {
            for base in region.granules(self.granularity) {
                let key = self.key(from, base);
                let Some(slot) = self.table.lookup(key) else {
                    debug_assert!(false, "in-flight bucket missing from table");
                    continue;
                };
                let waiters = match &mut self.table.get_mut(slot).state {
                    BucketState::Pending { waiters } => std::mem::take(waiters),
                    _ => {
                        debug_assert!(false, "in-flight bucket not pending");
                        continue;
                    }
                };
                if granted.contains(&base) {
                    self.table.get_mut(slot).state = BucketState::Pinned {
                        local: 0,
                        remote: waiters.len() as u32,
                    };
                    for waiter in waiters {
                        let record = self.requests.get_mut(waiter).expect("waiter record");
                        let RequestState::Pending { missing, .. } = &mut record.state else {
                            debug_assert!(false, "waiter not pending");
                            continue;
                        };
                        *missing -= 1;
                        if *missing == 0 {
                            completed.push(waiter);
                        }
                    }
                } else {
                    // Peer declined under its own pin pressure.
                    self.table.remove(slot);
                    let peer = self.peers.get_mut(&from).expect("peer exists");
                    peer.tracked -= 1;
                    failed.extend(waiters);
                }
            }
        }

        let mut out = Vec::new();
        for waiter in failed {
            // A request with several declined buckets shows up repeatedly;
            // the first failure retires the record and the rest are no-ops.
            if let Some(callback) = self.fail_request(waiter) {
                out.push((callback, Err(FirehoseError::PeerDeclined { node: from })));
            }
        }
        for waiter in completed {
            // Skip requests a declined bucket already failed.
            let Some(record) = self.requests.get_mut(waiter) else {
                continue;
            };
            let callback = match &mut record.state {
                RequestState::Pending { callback, .. } => {
                    callback.take().expect("completion callback")
                }
                _ => continue,
            };
            record.state = RequestState::Pinned;
            let request = Request::new(waiter, record.node, record.span.addr(), record.span.len());
            out.push((callback, Ok(request)));
        }
        out
    }

    /// Fail a pending request: drop the references it holds, dequeue it from
    /// buckets still in flight, and retire the record. Returns its callback,
    /// or `None` if the record was already retired.
    pub(crate) fn fail_request(&mut self, id: RequestId) -> Option<PinCallback> {
        let record = self.requests.free(id)?;
        let callback = match record.state {
            RequestState::Pending { callback, .. } => callback,
            RequestState::Pinned => {
                debug_assert!(false, "failing a pinned request");
                None
            }
        };
        for base in record.span.granules(self.granularity) {
            let key = self.key(record.node, base);
            let Some(slot) = self.table.lookup(key) else {
                continue; // declined and removed
            };
            if matches!(self.table.get(slot).state, BucketState::Pinned { .. }) {
                self.release_bucket_ref(slot, RequestKind::Remote, record.node);
                continue;
            }
            match &mut self.table.get_mut(slot).state {
                BucketState::Pending { waiters } => waiters.retain(|w| *w != id),
                _ => debug_assert!(false, "pending request ref on a victim"),
            }
        }
        callback
    }

    /// Roll back a dispatch whose send failed: the origin request dies
    /// silently (its caller sees the transport error), concurrent joiners
    /// fail through their callbacks.
    pub(crate) fn abort_dispatch(&mut self, id: PinRequestId, origin: RequestId) -> Vec<Completion> {
        let Some(inflight) = self.inflight.remove(&id) else {
            return Vec::new();
        };
        let node = inflight.node;
        warn!("rolling back failed pin dispatch {id} to node {node}");

        let mut waiters_all = Vec::new();
        for region in &inflight.pins {
            for base in region.granules(self.granularity) {
                let key = self.key(node, base);
                let Some(slot) = self.table.lookup(key) else {
                    continue;
                };
                let waiters = match &mut self.table.get_mut(slot).state {
                    BucketState::Pending { waiters } => std::mem::take(waiters),
                    _ => continue,
                };
                self.table.remove(slot);
                self.peers.get_mut(&node).expect("peer exists").tracked -= 1;
                waiters_all.extend(waiters);
            }
        }

        let mut out = Vec::new();
        for waiter in waiters_all {
            if waiter == origin {
                continue;
            }
            if let Some(callback) = self.fail_request(waiter) {
                let err = FirehoseError::Transport(std::io::Error::other(
                    "pin request dispatch failed",
                ));
                out.push((callback, Err(err)));
            }
        }
        // The origin last: its callback is dropped unused.
        let _ = self.fail_request(origin);
        out
    }
}
