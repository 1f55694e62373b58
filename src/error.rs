//! Error types for cache operations.
//!
//! Resource exhaustion is deliberately recoverable: a caller that cannot get
//! a pin falls back to a copy-based transfer instead of dying. Backend and
//! transport failures carry the underlying `io::Error`.

use crate::region::NodeId;
use std::io;
use thiserror::Error;

/// Result alias for cache operations.
pub type Result<T> = std::result::Result<T, FirehoseError>;

#[derive(Debug, Error)]
pub enum FirehoseError {
    /// The bucket descriptor arena reached its configured cap.
    #[error("bucket table full ({0} descriptors)")]
    TableFull(usize),

    /// The request slot arena reached its configured cap.
    #[error("request pool exhausted ({0} slots)")]
    RequestsExhausted(usize),

    /// Local pin capacity is exhausted and the victim FIFO has nothing to
    /// evict; the caller should fall back to a bounce-buffer copy.
    #[error("local pin capacity exhausted with no evictable victims")]
    CachePressure,

    /// The per-peer outstanding-pin budget is exhausted with nothing
    /// evictable for that peer.
    #[error("firehose budget for node {node} exhausted with no evictable victims")]
    PeerBudget { node: NodeId },

    /// The peer declined to pin part of a requested region (its own pin
    /// capacity was exhausted); the waiting request fails.
    #[error("node {node} declined to pin the requested region")]
    PeerDeclined { node: NodeId },

    /// A remote operation named this process's own node; use the local pin
    /// calls for local memory.
    #[error("remote pin addressed to the local node")]
    LocalNode,

    /// A node id outside the configured job size.
    #[error("node {node} out of range")]
    UnknownNode { node: NodeId },

    /// A zero-length or overflowing span was passed.
    #[error("empty or out-of-range region")]
    EmptyRegion,

    /// The configuration does not fit the backend or itself.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The pin backend refused a registration or deregistration.
    #[error("pin backend failed: {0}")]
    Backend(#[source] io::Error),

    /// The message transport failed to dispatch.
    #[error("transport send failed: {0}")]
    Transport(#[source] io::Error),
}
