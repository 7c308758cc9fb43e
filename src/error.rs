//! Error types for training runs.
//!
//! Every failure in the library is fatal for the run: nothing here is retried.
//! The binary wraps these in `anyhow` with context and exits non-zero.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for library operations.
pub type TrainResult<T> = Result<T, TrainError>;

/// All failures the training pipeline can surface.
#[derive(Error, Debug)]
pub enum TrainError {
    // ========== Configuration ==========
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Two tensors or arrays that must agree on a dimension do not.
    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    // ========== Graph / dataset ==========
    /// The dataset file could not be read or is malformed.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// A node index outside `0..num_nodes`.
    #[error("node index {index} out of range for graph with {num_nodes} nodes")]
    IndexOutOfRange { index: usize, num_nodes: usize },

    /// A query set must hold at least one node and no duplicates.
    #[error("invalid query set: {0}")]
    InvalidQuery(String),

    /// Tokenizer could not be loaded or failed to encode a document.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    // ========== Numerical ==========
    /// Loss became NaN or infinite during a training step.
    #[error("non-finite loss {loss} at epoch {epoch}, step {step}")]
    NonFiniteLoss { epoch: usize, step: usize, loss: f32 },

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    // ========== Checkpoint I/O ==========
    /// Checkpoint could not be written or read.
    #[error("checkpoint error at {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },

    /// Filesystem failure outside of checkpoint handling.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrainError {
    pub(crate) fn checkpoint(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::Checkpoint {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
