//! Error taxonomy for training and evaluation runs.
//!
//! Every variant is fatal: nothing in the crate retries.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or contradictory run configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor shapes that cannot be combined, e.g. targets vs. logits.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Malformed dataset descriptor or unreadable image.
    #[error("data error in {path:?}: {reason}")]
    Data { path: PathBuf, reason: String },

    #[error("device error: {0}")]
    Device(String),

    #[error("checkpoint not found: {path:?}")]
    CheckpointNotFound { path: PathBuf },

    /// The parameter recorder failed to write or read a snapshot.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn data(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Data {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
