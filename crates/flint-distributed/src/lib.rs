//! Distributed training backend for FLINT.
//!
//! Synchronizes gradients across multiple worker processes over TCP using a
//! bandwidth-optimal ring all-reduce. Cross-rank synchronization happens at
//! exactly two points in a training run: gradient aggregation after each
//! accumulated micro-batch group, and the barriers around checkpoint
//! save/resume. Both are blocking collectives, so every call carries a
//! deadline; a rank that misses it is treated as stuck and the run aborts.
//!
//! # Quick start
//!
//! ```ignore
//! use flint_distributed::{ClusterConfig, DistributedContext, RingBackend};
//! use std::time::Duration;
//!
//! let config = ClusterConfig::new(
//!     vec!["192.168.1.10:52416".parse()?, "192.168.1.11:52416".parse()?],
//!     0, // this node's rank
//! );
//! let backend = RingBackend::new(config).await?;
//! let ctx = DistributedContext::new(Box::new(backend));
//!
//! ctx.all_reduce_f32(&mut gradients, Duration::from_secs(60)).await?;
//! ```
//!
//! Single-process runs use [`LocalBackend`], which satisfies the same
//! interface with no-op collectives.

#![warn(missing_docs)]

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod config;
pub mod error;
pub mod ring;
pub mod transport;

pub use config::ClusterConfig;
pub use error::{DistributedError, DistributedResult};
pub use ring::RingBackend;

/// Interface for distributed operations.
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    /// Rank of this node (0 to `world_size - 1`).
    fn rank(&self) -> usize;

    /// Total number of nodes.
    fn world_size(&self) -> usize;

    /// All-reduce (sum) the buffer in place. The buffer holds
    /// little-endian f32 values; on return it contains the element-wise
    /// sum across all nodes.
    async fn all_reduce(&self, buffer: &mut [u8]) -> Result<()>;

    /// Barrier synchronization: no node proceeds until all have arrived.
    async fn barrier(&self) -> Result<()>;
}

/// No-op backend for single-process training.
pub struct LocalBackend;

#[async_trait]
impl DistributedBackend for LocalBackend {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    async fn all_reduce(&self, _buffer: &mut [u8]) -> Result<()> {
        Ok(())
    }

    async fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// A handle to the distributed runtime, adding deadlines to every
/// collective.
pub struct DistributedContext {
    backend: Box<dyn DistributedBackend>,
}

impl DistributedContext {
    /// Create a context over the given backend.
    #[must_use]
    pub fn new(backend: Box<dyn DistributedBackend>) -> Self {
        Self { backend }
    }

    /// Single-process context.
    #[must_use]
    pub fn local() -> Self {
        Self::new(Box::new(LocalBackend))
    }

    /// Rank of this node.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    /// Total number of nodes in the cluster.
    #[must_use]
    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    /// Whether this is the master node (rank 0).
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.rank() == 0
    }

    /// All-reduce (sum) a float buffer with a deadline.
    pub async fn all_reduce_f32(
        &self,
        data: &mut [f32],
        deadline: Duration,
    ) -> DistributedResult<()> {
        if self.world_size() == 1 {
            return Ok(());
        }
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(data);
        match tokio::time::timeout(deadline, self.backend.all_reduce(bytes)).await {
            Ok(result) => result.map_err(|e| DistributedError::Collective(e.to_string())),
            Err(_) => Err(DistributedError::CollectiveTimeout {
                operation: "all_reduce",
                elapsed: deadline,
            }),
        }
    }

    /// Synchronize all nodes at a barrier with a deadline.
    pub async fn barrier(&self, deadline: Duration) -> DistributedResult<()> {
        if self.world_size() == 1 {
            return Ok(());
        }
        match tokio::time::timeout(deadline, self.backend.barrier()).await {
            Ok(result) => result.map_err(|e| DistributedError::Collective(e.to_string())),
            Err(_) => Err(DistributedError::CollectiveTimeout {
                operation: "barrier",
                elapsed: deadline,
            }),
        }
    }
}
