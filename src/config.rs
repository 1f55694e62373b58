//! Cache configuration: capacities, budgets, and node identity.

use crate::region::{NodeId, Region};

/// Configuration for a [`Firehose`](crate::Firehose) cache instance.
///
/// Capacities are in buckets (backend granules). Defaults are sized for
/// tests and small jobs; production callers size `max_local_buckets` from the
/// locked-memory limit and `per_peer_buckets` from the peer's pin capacity
/// divided by the job size.
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// This process's node id.
    pub local_node: NodeId,
    /// Number of nodes in the job. Must fit in the low bits of a
    /// granule-aligned address, i.e. `nodes <= granularity`.
    pub nodes: u16,
    /// Maximum buckets physically pinned on this node (in use + victims).
    pub max_local_buckets: usize,
    /// Maximum buckets firehosed to any single peer (in use + pending +
    /// parked in that peer's victim FIFO).
    pub per_peer_buckets: usize,
    /// Hard cap on bucket descriptors (metadata footprint bound).
    pub max_buckets: usize,
    /// Hard cap on live request handles.
    pub max_requests: usize,
    /// Regions already registered with the hardware at startup; seeded into
    /// the cache as evictable without a backend call.
    pub prepinned: Vec<Region>,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            local_node: 0,
            nodes: 1,
            max_local_buckets: 4096,
            per_peer_buckets: 256,
            max_buckets: 65536,
            max_requests: 4096,
            prepinned: Vec::new(),
        }
    }
}

impl FirehoseConfig {
    /// Create a configuration with default capacities for the given node.
    #[inline]
    pub fn new(local_node: NodeId, nodes: u16) -> Self {
        Self {
            local_node,
            nodes,
            ..Self::default()
        }
    }

    /// Set the local pin capacity in buckets.
    #[inline]
    pub fn with_max_local_buckets(mut self, n: usize) -> Self {
        self.max_local_buckets = n;
        self
    }

    /// Set the per-peer outstanding-firehose budget in buckets.
    #[inline]
    pub fn with_per_peer_buckets(mut self, n: usize) -> Self {
        self.per_peer_buckets = n;
        self
    }

    /// Set the bucket descriptor cap.
    #[inline]
    pub fn with_max_buckets(mut self, n: usize) -> Self {
        self.max_buckets = n;
        self
    }

    /// Set the request handle cap.
    #[inline]
    pub fn with_max_requests(mut self, n: usize) -> Self {
        self.max_requests = n;
        self
    }

    /// Seed regions that are already hardware-registered at startup.
    #[inline]
    pub fn with_prepinned(mut self, regions: Vec<Region>) -> Self {
        self.prepinned = regions;
        self
    }

    /// Validate against the backend's granule size.
    pub(crate) fn validate(&self, granularity: u64) -> crate::error::Result<()> {
        use crate::error::FirehoseError::Config;
        if granularity == 0 || !granularity.is_power_of_two() {
            return Err(Config(format!(
                "backend granularity {granularity} is not a power of two"
            )));
        }
        if u64::from(self.nodes) > granularity {
            return Err(Config(format!(
                "{} nodes do not fit in the low bits of a {granularity}-byte granule",
                self.nodes
            )));
        }
        if self.local_node >= self.nodes {
            return Err(Config(format!(
                "local node {} out of range 0..{}",
                self.local_node, self.nodes
            )));
        }
        if self.max_local_buckets == 0 || self.max_buckets == 0 || self.max_requests == 0 {
            return Err(Config("zero capacity".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = FirehoseConfig::new(2, 4)
            .with_max_local_buckets(16)
            .with_per_peer_buckets(4);
        assert_eq!(config.local_node, 2);
        assert_eq!(config.max_local_buckets, 16);
        assert_eq!(config.per_peer_buckets, 4);
        assert!(config.validate(4096).is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(FirehoseConfig::new(0, 1).validate(4095).is_err());
        assert!(FirehoseConfig::new(1, 1).validate(4096).is_err());
        assert!(FirehoseConfig::new(0, 8).validate(4).is_err());
        assert!(FirehoseConfig::new(0, 4).validate(4).is_ok());
    }
}
