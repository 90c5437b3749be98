//! Error types shared by the library modules.

use std::path::PathBuf;
use thiserror::Error;

/// Failures that abort a sync run.
///
/// Per-item download failures, webhook failures and retention delete failures
/// never show up here: they are recorded in the run statistics or logged.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The archive file exists but is not a valid archive document.
    #[error("archive {} is corrupt", path.display())]
    CorruptArchive {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The archive could not be written and atomically moved into place.
    #[error("failed to persist archive {}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The fetch engine could not list or start downloading.
    #[error("fetch engine failed: {0}")]
    Engine(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
