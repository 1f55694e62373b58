//! Callback/poll queue: work deferred out of locked and handler contexts.
//!
//! Lock-free MPMC queue drained only by an explicit `poll()` call. Keeping
//! callback execution off the cache mutex is what lets user code re-enter
//! the pin API from inside a completion.

use crate::cache::request::{PinCallback, Request};
use crate::error::FirehoseError;
use crate::region::{NodeId, Region};
use crate::transport::PinRequestId;
use crossbeam::queue::SegQueue;

pub(crate) enum PollEvent {
    /// A finished (or failed) remote pin ready to deliver to its caller.
    Completion {
        result: Result<Request, FirehoseError>,
        callback: PinCallback,
    },
    /// A peer asked us to pin memory: service it and reply.
    PinForPeer {
        from: NodeId,
        id: PinRequestId,
        pins: Vec<Region>,
        unpins: Vec<Region>,
    },
}

pub(crate) struct PollQueue {
    events: SegQueue<PollEvent>,
}

impl PollQueue {
    pub(crate) fn new() -> Self {
        Self {
            events: SegQueue::new(),
        }
    }

    pub(crate) fn push(&self, event: PollEvent) {
        self.events.push(event);
    }

    pub(crate) fn pop(&self) -> Option<PollEvent> {
        self.events.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
