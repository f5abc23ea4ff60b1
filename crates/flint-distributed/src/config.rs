//! Cluster configuration.

use crate::error::DistributedError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;

/// Static ring topology for a training cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// All nodes in the cluster (IP:port), in rank order. The order must be
    /// identical on every node.
    pub nodes: Vec<SocketAddr>,

    /// Rank of this node (index into `nodes`).
    pub rank: usize,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Maximum connection retry attempts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    50
}

impl ClusterConfig {
    /// Create a configuration with default timeouts.
    #[must_use]
    pub fn new(nodes: Vec<SocketAddr>, rank: usize) -> Self {
        Self {
            nodes,
            rank,
            connection_timeout_ms: default_connection_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(DistributedError::Config("nodes list cannot be empty".into()).into());
        }
        if self.rank >= self.nodes.len() {
            return Err(DistributedError::Config(format!(
                "rank {} is out of bounds for {} nodes",
                self.rank,
                self.nodes.len()
            ))
            .into());
        }
        let unique: HashSet<_> = self.nodes.iter().collect();
        if unique.len() != self.nodes.len() {
            return Err(
                DistributedError::Config("nodes list contains duplicate addresses".into()).into(),
            );
        }
        Ok(())
    }

    /// Number of nodes in the cluster.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_config() {
        let cfg = ClusterConfig::new(
            vec!["127.0.0.1:29500".parse().unwrap(), "127.0.0.1:29501".parse().unwrap()],
            1,
        );
        cfg.validate().unwrap();
        assert_eq!(cfg.world_size(), 2);
    }

    #[test]
    fn rejects_out_of_range_rank() {
        let cfg = ClusterConfig::new(vec!["127.0.0.1:29500".parse().unwrap()], 1);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let addr: SocketAddr = "127.0.0.1:29500".parse().unwrap();
        let cfg = ClusterConfig::new(vec![addr, addr], 0);
        assert!(cfg.validate().is_err());
    }
}
