//! Error taxonomy for the training loop.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    /// A batch or feature row is malformed. Raised before any parameter update.
    #[error("data error: {0}")]
    Data(String),

    /// Failure inside the compute backend, including a non-finite loss.
    #[error("compute error: {0}")]
    Compute(#[from] candle::Error),

    /// Checkpoint read/write failure, or checkpoint contents that do not fit the live state.
    #[error("checkpoint storage error at {}: {message}", path.display())]
    Storage { path: PathBuf, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TrainError {
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn storage(path: impl AsRef<Path>, message: impl ToString) -> Self {
        Self::Storage {
            path: path.as_ref().to_path_buf(),
            message: message.to_string(),
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }

    pub fn is_compute(&self) -> bool {
        matches!(self, Self::Compute(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
