//! Error types for distributed operations.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during distributed operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// I/O failure on the transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timed out waiting for a peer connection.
    #[error("connection timeout to peer at {0} after {1:?}")]
    ConnectionTimeout(SocketAddr, Duration),

    /// Gave up connecting to a peer.
    #[error("max retries ({max_retries}) exceeded connecting to {addr}")]
    MaxRetriesExceeded {
        /// Peer address.
        addr: SocketAddr,
        /// Retry budget that was exhausted.
        max_retries: u32,
    },

    /// Wire-format violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid cluster configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking collective did not complete within its deadline. Fatal:
    /// it indicates a stuck or crashed rank.
    #[error("{operation} timed out after {elapsed:?}; a rank is stuck or gone")]
    CollectiveTimeout {
        /// Which collective stalled.
        operation: &'static str,
        /// The deadline that elapsed.
        elapsed: Duration,
    },

    /// A collective failed for a non-timeout reason.
    #[error("collective failed: {0}")]
    Collective(String),
}

/// Result type alias for distributed operations.
pub type DistributedResult<T> = Result<T, DistributedError>;
