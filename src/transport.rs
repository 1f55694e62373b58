//! Active-message transport boundary.
//!
//! The cache opens and closes firehoses with three outbound message kinds and
//! consumes the matching inbound events through the handlers on
//! [`Firehose`](crate::Firehose) (`handle_pin_request`, `handle_pin_reply`,
//! `handle_unpin_notify`). Wire encoding, delivery, and handler dispatch
//! belong to the conduit; this trait is the whole contract.
//!
//! Sends are always invoked without the cache mutex held, so an
//! implementation may deliver synchronously in-process (loopback) or queue
//! onto a real network. Delivery is assumed reliable and ordered per peer.

use crate::region::{NodeId, Region};
use std::io;

/// Correlates a pin request with its reply across the round trip.
pub type PinRequestId = u64;

/// Outbound message dispatch implemented by the conduit.
pub trait Messenger: Send + Sync + 'static {
    /// Ask `node` to pin `pins` on our behalf. `unpins` piggybacks the
    /// regions we just evicted from that peer's victim FIFO to make budget
    /// room, so the peer can drop its pins in the same exchange.
    fn send_pin_request(
        &self,
        node: NodeId,
        id: PinRequestId,
        pins: &[Region],
        unpins: &[Region],
    ) -> io::Result<()>;

    /// Answer a peer's pin request with the regions actually pinned. Under
    /// pin pressure this may be a subset of what was asked.
    fn send_pin_reply(&self, node: NodeId, id: PinRequestId, pinned: &[Region])
        -> io::Result<()>;

    /// Tell `node` we no longer hold firehoses on `regions` (shutdown path;
    /// steady-state unpins piggyback on pin requests instead).
    fn send_unpin_notify(&self, node: NodeId, regions: &[Region]) -> io::Result<()>;
}
