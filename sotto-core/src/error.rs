use std::path::PathBuf;

use thiserror::Error;

/// All errors produced by sotto-core.
#[derive(Debug, Error)]
pub enum SottoError {
    #[error("failed to load speech model at {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("no model path configured")]
    ModelPathUnset,

    #[error("invalid sample rate: {0}")]
    InvalidRate(u32),

    #[error("engine rejected waveform chunk: {0}")]
    EngineFeed(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("filter is already active")]
    AlreadyActive,

    #[error("filter is not active")]
    NotActive,

    #[error("filter is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SottoError>;
