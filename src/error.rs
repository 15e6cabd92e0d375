//! Error types for the training pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for tessitura operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration contract violation (unknown optimizer/encoder name,
    /// unsupported sample rate, invalid hyperparameter). Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A metric window with no positive (or no negative) examples for a tag.
    /// Recoverable: callers substitute a NaN sentinel and keep going.
    #[error("Degenerate metric: {0}")]
    DegenerateMetric(String),

    /// Checkpoint read/write failure after the single retry. Fatal: a long
    /// run cannot safely continue without checkpoint durability.
    #[error("Checkpoint I/O error for {path}: {source}")]
    CheckpointIo {
        /// Checkpoint file involved
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: anyhow::Error,
    },

    /// A peer failed to reach the epoch barrier within the timeout. Fatal:
    /// the surviving processes must abort rather than proceed single-process.
    #[error("Distributed synchronization error: {0}")]
    DistributedSync(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for tessitura operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a degenerate-metric error
    pub fn degenerate_metric(msg: impl Into<String>) -> Self {
        Self::DegenerateMetric(msg.into())
    }

    /// Create a checkpoint I/O error
    pub fn checkpoint_io(path: impl Into<PathBuf>, source: impl Into<anyhow::Error>) -> Self {
        Self::CheckpointIo {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Create a distributed synchronization error
    pub fn distributed_sync(msg: impl Into<String>) -> Self {
        Self::DistributedSync(msg.into())
    }

    /// Whether training may continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::DegenerateMetric(_))
    }
}
