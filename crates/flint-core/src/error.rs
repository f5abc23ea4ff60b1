//! Error types for FLINT.

use thiserror::Error;

/// Result type alias for FLINT operations.
pub type Result<T> = std::result::Result<T, FlintError>;

/// Main error type for FLINT operations.
#[derive(Error, Debug)]
pub enum FlintError {
    /// Configuration rejected at startup.
    #[error("configuration error: {0}")]
    ConfigValidation(String),

    /// Corpus-level failure (missing split file, unreadable directory).
    /// Per-record corruption is absorbed by the reader, not surfaced here.
    #[error("corpus error: {0}")]
    Corpus(String),

    /// Tokenizer errors.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Resume path did not resolve to an existing checkpoint.
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Checkpoint exists but cannot be restored. Fatal; no partial restore.
    #[error("checkpoint corrupt at {path}: {reason}")]
    CheckpointCorrupt {
        /// Path of the offending snapshot.
        path: String,
        /// What failed while restoring it.
        reason: String,
    },

    /// Training-loop failure (e.g. loss scale exhausted after repeated
    /// gradient overflow).
    #[error("training error: {0}")]
    Training(String),

    /// Cross-rank synchronization failure.
    #[error("distributed error: {0}")]
    Distributed(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for FlintError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
