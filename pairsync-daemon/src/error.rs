use std::path::PathBuf;

use thiserror::Error;

use pairsync_core::JobName;

/// Error surface for the daemon runtime, scheduler and control protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("config error: {0}")]
    Config(#[from] pairsync_core::ConfigError),

    #[error("sync error: {0}")]
    Sync(#[from] pairsync_sync::SyncError),

    #[error("storage error: {0}")]
    Store(#[from] pairsync_sync::StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no job named '{0}'")]
    UnknownJob(JobName),

    #[error("job '{0}' is stopping")]
    JobStopping(JobName),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
