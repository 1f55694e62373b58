//! firehose - a distributed memory-registration cache for RDMA transports.
//!
//! Zero-copy transfers require pinned (NIC-registered) memory at both ends,
//! and pinning is expensive and capacity-limited. This crate keeps a
//! reference-counted cache of pinned buckets, local ones and *firehoses*
//! held on peers, with lazy FIFO eviction, a bounded per-peer flow of
//! outstanding remote pins, and asynchronous remote acquisition driven by
//! explicit polling.
//!
//! The hardware and the wire stay outside: registration goes through the
//! [`PinBackend`] trait (a page-granularity bookkeeping [`PageBackend`] is
//! provided) and pin traffic through the [`Messenger`] trait.
//!
//! ```no_run
//! use firehose::{Firehose, FirehoseConfig, PageBackend};
//! # use firehose::{Messenger, NodeId, PinRequestId, Region};
//! # struct Am;
//! # impl Messenger for Am {
//! #     fn send_pin_request(&self, _: NodeId, _: PinRequestId, _: &[Region], _: &[Region]) -> std::io::Result<()> { Ok(()) }
//! #     fn send_pin_reply(&self, _: NodeId, _: PinRequestId, _: &[Region]) -> std::io::Result<()> { Ok(()) }
//! #     fn send_unpin_notify(&self, _: NodeId, _: &[Region]) -> std::io::Result<()> { Ok(()) }
//! # }
//!
//! let backend = PageBackend::new(4096, 64 << 20);
//! let cache = Firehose::new(FirehoseConfig::new(0, 4), backend, Am)?;
//!
//! let pin = cache.local_pin(0x10_0000, 8192)?;
//! // ... use the pinned span as an RDMA source ...
//! cache.release(pin);
//! # Ok::<(), firehose::FirehoseError>(())
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod region;
pub mod transport;

pub use backend::{PageBackend, PinBackend};
pub use cache::{CacheStats, Firehose, PeerStats, PinCallback, RemotePinFlags, Request};
pub use config::FirehoseConfig;
pub use error::{FirehoseError, Result};
pub use region::{NodeId, Region};
pub use transport::{Messenger, PinRequestId};
