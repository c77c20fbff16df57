//! Error types for pairsync-sync.

use std::path::PathBuf;

use thiserror::Error;

use pairsync_core::{RelPath, Sequence, Side, WorkspaceId};

/// Failures of the durable change-log storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error, with annotated path for context.
    #[error("storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The persisted log does not match what this process wrote or expects.
    #[error("change log for {workspace} is corrupt: {detail}")]
    Corrupt {
        workspace: WorkspaceId,
        detail: String,
    },

    #[error("change log for {workspace} expected sequence {expected}, got {got}")]
    OutOfOrder {
        workspace: WorkspaceId,
        expected: Sequence,
        got: Sequence,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// All errors that can arise from classification, planning and applying a merge.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `assert_ready` failed for one endpoint; the cycle is abandoned.
    #[error("workspace {workspace} is not ready: {source}")]
    NotReady {
        workspace: WorkspaceId,
        #[source]
        source: StoreError,
    },

    #[error("workspace {workspace} has lost its watch on {root}")]
    WatcherDown {
        workspace: WorkspaceId,
        root: PathBuf,
    },

    /// The target changed underneath the plan; retried next cycle.
    #[error("{side} copy of {path} changed since it was last observed")]
    Diverged { side: Side, path: RelPath },

    #[error("{side} source {path} vanished before it could be copied")]
    SourceMissing { side: Side, path: RelPath },

    #[error("failed to watch {path}: {message}")]
    Watch { path: PathBuf, message: String },

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
