use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] pawtrack_core::Error),
    #[error(transparent)]
    Undo(#[from] pawtrack_core::UndoError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("ID cannot be empty")]
    EmptyId,
    #[error("Not a valid operation ID: {0}")]
    InvalidOperationId(String),
    #[error("Failed to resolve the local data directory")]
    NoDataDir,
    #[error("Sync is not configured. Set PAWTRACK_REMOTE_URL to the server's base URL.")]
    SyncNotConfigured,
}
