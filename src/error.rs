use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort a run. Raised through `anyhow` so callers can
/// `downcast_ref::<TrainError>()` when they need to tell them apart.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("resume requested but no weight file was given (use --weight)")]
    MissingWeightFile,

    #[error("cannot load checkpoint {}: {reason}", path.display())]
    CheckpointLoad { path: PathBuf, reason: String },

    #[error("game returned malformed data: {0}")]
    Collaborator(String),
}

impl TrainError {
    pub fn checkpoint(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TrainError::CheckpointLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
