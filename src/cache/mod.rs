//! The firehose cache: a distributed, self-managing cache of pinned memory.
//!
//! RDMA transfers need both endpoints registered with the NIC, and
//! registration is slow and capacity-limited, worst of all on the remote
//! side, where acquiring a pin costs a network round trip. The cache keeps
//! registrations alive past their last use and reference-counts them:
//!
//! - **Local pins** (`local_pin` and friends) register this process's own
//!   memory, reclaiming released buckets from a victim FIFO for free.
//! - **Remote pins** (`remote_pin` and friends) acquire *firehoses* (pins
//!   held on a peer's memory) asynchronously, under a per-peer budget,
//!   with released firehoses parked per peer until the budget needs them.
//! - **Release is lazy**: dropping the last reference parks the bucket; the
//!   backend unpin (and the peer notification) happens only under capacity
//!   pressure, oldest victim first.
//!
//! # Module Structure
//!
//! - `bucket` - packed keys and per-granule descriptors
//! - `table` - hash index over the slab-grown descriptor arena
//! - `fifo` - intrusive victim FIFOs
//! - `request` - caller handles and the generation-checked pool
//! - `state` - locked cache state and the local pin manager
//! - `remote` - remote pin manager and round-trip bookkeeping
//! - `poll` - deferred callback/work queue
//!
//! # Concurrency
//!
//! One mutex owns all cache state; it is never held across a messenger send
//! or a user callback, so completion code may re-enter the cache freely.
//! Progress is driven by explicit [`poll`](Firehose::poll) calls; there is
//! no background thread and nothing here blocks on the network.

pub(crate) mod bucket;
pub(crate) mod fifo;
pub(crate) mod poll;
pub(crate) mod remote;
pub(crate) mod request;
pub(crate) mod state;
pub(crate) mod table;

pub use request::{PinCallback, Request};
pub use state::{CacheStats, PeerStats};

use crate::backend::PinBackend;
use crate::config::FirehoseConfig;
use crate::error::{FirehoseError, Result};
use crate::region::{NodeId, Region};
use crate::transport::{Messenger, PinRequestId};
use parking_lot::Mutex;
use poll::{PollEvent, PollQueue};
use remote::RemoteOutcome;
use state::CacheState;
use tracing::warn;

/// Options for [`Firehose::remote_pin`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RemotePinFlags {
    /// On a full cache hit, hand the pinned request back as the return value
    /// instead of running the completion callback.
    pub return_if_pinned: bool,
}

impl RemotePinFlags {
    /// Flags requesting the return-value fast path on a full hit.
    #[inline]
    pub fn return_if_pinned() -> Self {
        Self {
            return_if_pinned: true,
        }
    }
}

/// A memory-registration cache instance.
///
/// Generic over the [`PinBackend`] doing the hardware registration and the
/// [`Messenger`] carrying pin traffic between nodes. All methods take
/// `&self`; the cache is `Sync` and any thread may call in, including from
/// completion callbacks.
pub struct Firehose<B: PinBackend, M: Messenger> {
    state: Mutex<CacheState<B>>,
    queue: PollQueue,
    messenger: M,
    local_node: NodeId,
    nodes: u16,
    granularity: u64,
}

impl<B: PinBackend, M: Messenger> Firehose<B, M> {
    /// Build a cache over `backend` and `messenger`.
    ///
    /// The backend fixes the bucket granularity; `config.prepinned` regions
    /// are seeded as evictable victims without a backend call.
    pub fn new(config: FirehoseConfig, backend: B, messenger: M) -> Result<Self> {
        let granularity = backend.granularity();
        config.validate(granularity)?;
        let local_node = config.local_node;
        let nodes = config.nodes;
        let state = CacheState::new(&config, backend, granularity)?;
        Ok(Self {
            state: Mutex::new(state),
            queue: PollQueue::new(),
            messenger,
            local_node,
            nodes,
            granularity,
        })
    }

    /// This process's node id.
    #[inline]
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    /// Bucket granularity in bytes, as fixed by the backend.
    #[inline]
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    fn span(&self, addr: u64, len: u64) -> Result<Region> {
        if len == 0 || addr.checked_add(len).is_none() {
            return Err(FirehoseError::EmptyRegion);
        }
        Ok(Region::new(addr, len))
    }

    fn check_peer(&self, node: NodeId) -> Result<()> {
        if node == self.local_node {
            return Err(FirehoseError::LocalNode);
        }
        if node >= self.nodes {
            return Err(FirehoseError::UnknownNode { node });
        }
        Ok(())
    }

    // ---- local pins ----

    /// Pin `[addr, addr + len)` in local memory, registering whatever is not
    /// already resident. Blocks only on the backend call, never the network.
    pub fn local_pin(&self, addr: u64, len: u64) -> Result<Request> {
        let span = self.span(addr, len)?;
        let mut state = self.state.lock();
        let id = state.local_pin(span)?;
        state.debug_validate();
        Ok(Request::new(id, self.local_node, addr, len))
    }

    /// Pin `[addr, addr + len)` only if every covering bucket is already
    /// resident; `Ok(None)` otherwise, with no side effects.
    pub fn try_local_pin(&self, addr: u64, len: u64) -> Result<Option<Request>> {
        let span = self.span(addr, len)?;
        let mut state = self.state.lock();
        let id = state.try_local_pin(span)?;
        state.debug_validate();
        Ok(id.map(|id| Request::new(id, self.local_node, addr, len)))
    }

    /// Pin the longest already-resident prefix of `[addr, addr + len)`;
    /// `Ok(None)` if not even the first bucket is resident.
    pub fn partial_local_pin(&self, addr: u64, len: u64) -> Result<Option<Request>> {
        let span = self.span(addr, len)?;
        let mut state = self.state.lock();
        let out = state.partial_local_pin(span)?;
        state.debug_validate();
        Ok(out.map(|(id, clipped)| {
            Request::new(id, self.local_node, clipped.addr(), clipped.len())
        }))
    }

    // ---- remote pins ----

    /// Acquire firehoses covering `[addr, addr + len)` on `node`.
    ///
    /// Full cache hit: with `return_if_pinned` set the pinned request comes
    /// back as `Ok(Some(_))`; otherwise `callback` runs synchronously (the
    /// mutex already dropped) and the call returns `Ok(None)`.
    ///
    /// Any miss: `Ok(None)` immediately, a pin round trip is dispatched
    /// (evicting that peer's oldest victims if the budget is full, the
    /// unpins piggybacked on the request), and `callback` fires from a later
    /// [`poll`](Self::poll) exactly once, with the pinned request or with
    /// the error that failed the round trip.
    pub fn remote_pin<F>(
        &self,
        node: NodeId,
        addr: u64,
        len: u64,
        flags: RemotePinFlags,
        callback: F,
    ) -> Result<Option<Request>>
    where
        F: FnOnce(Result<Request>) + Send + 'static,
    {
        let span = self.span(addr, len)?;
        self.check_peer(node)?;
        let outcome = {
            let mut state = self.state.lock();
            let outcome = state.remote_pin(node, span, Box::new(callback))?;
            state.debug_validate();
            outcome
        };
        match outcome {
            RemoteOutcome::Hit { request, callback } => {
                if flags.return_if_pinned {
                    Ok(Some(request))
                } else {
                    callback(Ok(request));
                    Ok(None)
                }
            }
            RemoteOutcome::Joined => Ok(None),
            RemoteOutcome::Dispatched {
                id,
                origin,
                pins,
                unpins,
            } => {
                match self.messenger.send_pin_request(node, id, &pins, &unpins) {
                    Ok(()) => Ok(None),
                    Err(e) => {
                        let completions = {
                            let mut state = self.state.lock();
                            let completions = state.abort_dispatch(id, origin);
                            state.debug_validate();
                            completions
                        };
                        for (callback, result) in completions {
                            self.queue.push(PollEvent::Completion { result, callback });
                        }
                        Err(FirehoseError::Transport(e))
                    }
                }
            }
        }
    }

    /// Acquire firehoses on `node` only if every covering bucket is already
    /// resident (in-flight buckets do not count); never sends.
    pub fn try_remote_pin(&self, node: NodeId, addr: u64, len: u64) -> Result<Option<Request>> {
        let span = self.span(addr, len)?;
        self.check_peer(node)?;
        let mut state = self.state.lock();
        let id = state.try_remote_pin(node, span)?;
        state.debug_validate();
        Ok(id.map(|id| Request::new(id, node, addr, len)))
    }

    /// Acquire the longest resident prefix of firehoses on `node`; never
    /// sends.
    pub fn partial_remote_pin(&self, node: NodeId, addr: u64, len: u64) -> Result<Option<Request>> {
        let span = self.span(addr, len)?;
        self.check_peer(node)?;
        let mut state = self.state.lock();
        let out = state.partial_remote_pin(node, span)?;
        state.debug_validate();
        Ok(out.map(|(id, clipped)| Request::new(id, node, clipped.addr(), clipped.len())))
    }

    // ---- release ----

    /// Retire a pin handle. Buckets dropping to zero references park in the
    /// appropriate victim FIFO; nothing is unpinned and nothing is sent
    /// until capacity pressure demands it.
    pub fn release(&self, request: Request) {
        let mut state = self.state.lock();
        state.release(request.id);
        state.debug_validate();
    }

    /// Retire a batch of handles under one lock acquisition.
    pub fn release_all<I>(&self, requests: I)
    where
        I: IntoIterator<Item = Request>,
    {
        let mut state = self.state.lock();
        for request in requests {
            state.release(request.id);
        }
        state.debug_validate();
    }

    // ---- progress ----

    /// Drain deferred work: run completion callbacks and service queued peer
    /// pin requests. Callbacks run with no cache lock held and may re-enter
    /// the API. Returns once the queue is empty.
    pub fn poll(&self) -> Result<()> {
        while let Some(event) = self.queue.pop() {
            match event {
                PollEvent::Completion { result, callback } => callback(result),
                PollEvent::PinForPeer {
                    from,
                    id,
                    pins,
                    unpins,
                } => {
                    let pinned = {
                        let mut state = self.state.lock();
                        state.unpin_for_peer(from, &unpins);
                        let pinned = state.pin_for_peer(from, &pins)?;
                        state.debug_validate();
                        pinned
                    };
                    self.messenger
                        .send_pin_reply(from, id, &pinned)
                        .map_err(FirehoseError::Transport)?;
                }
            }
        }
        Ok(())
    }

    // ---- inbound handlers (called by the transport glue) ----

    /// A peer asked us to pin `pins` (and to drop `unpins` it evicted).
    /// Queued and serviced on the next [`poll`](Self::poll); safe to call
    /// from any context, including an AM handler.
    pub fn handle_pin_request(
        &self,
        from: NodeId,
        id: PinRequestId,
        pins: Vec<Region>,
        unpins: Vec<Region>,
    ) {
        self.queue.push(PollEvent::PinForPeer {
            from,
            id,
            pins,
            unpins,
        });
    }

    /// A peer answered one of our pin requests. Buckets go live (or fail)
    /// immediately; completion callbacks fire on the next
    /// [`poll`](Self::poll).
    pub fn handle_pin_reply(&self, from: NodeId, id: PinRequestId, pinned: &[Region]) {
        let completions = {
            let mut state = self.state.lock();
            let completions = state.resolve_reply(from, id, pinned);
            state.debug_validate();
            completions
        };
        for (callback, result) in completions {
            self.queue.push(PollEvent::Completion { result, callback });
        }
    }

    /// A peer no longer holds firehoses on `regions` of our memory.
    pub fn handle_unpin_notify(&self, from: NodeId, regions: &[Region]) {
        let mut state = self.state.lock();
        state.unpin_for_peer(from, regions);
        state.debug_validate();
    }

    // ---- observability & shutdown ----

    /// Snapshot of cache occupancy.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats()
    }

    /// Whether deferred work is waiting for [`poll`](Self::poll).
    pub fn has_pending_work(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Tear the cache down: notify every peer of the firehoses we drop and
    /// deregister all local buckets. Consumes the cache; `Drop` does the
    /// same best-effort for a cache that was not explicitly finished.
    pub fn fini(self) -> Result<()> {
        let (notifies, result) = self.state.lock().teardown();
        for (node, regions) in &notifies {
            self.messenger
                .send_unpin_notify(*node, regions)
                .map_err(FirehoseError::Transport)?;
        }
        result
    }
}

impl<B: PinBackend, M: Messenger> Drop for Firehose<B, M> {
    fn drop(&mut self) {
        let (notifies, result) = self.state.lock().teardown();
        for (node, regions) in &notifies {
            if let Err(e) = self.messenger.send_unpin_notify(*node, regions) {
                warn!("unpin notify to node {node} failed during teardown: {e}");
            }
        }
        if let Err(e) = result {
            warn!("backend deregistration failed during teardown: {e}");
        }
    }
}
