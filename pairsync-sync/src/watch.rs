//! Raw filesystem events and the watcher/handler contracts.
//!
//! Raw events carry absolute paths; handlers translate them into workspace
//! terms. A concrete OS-backed watcher lives in the daemon crate.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawKind {
    Created(PathBuf),
    Removed(PathBuf),
    Modified(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
    /// The watch on `path` failed or the path became inaccessible.
    Error { path: PathBuf, message: String },
    /// Watching `path` works again after an `Error`.
    Resumed(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: RawKind,
    pub at: DateTime<Utc>,
}

impl RawEvent {
    pub fn now(kind: RawKind) -> Self {
        Self {
            kind,
            at: Utc::now(),
        }
    }

    /// Paths this event concerns, for routing to handlers.
    pub fn paths(&self) -> Vec<&Path> {
        match &self.kind {
            RawKind::Created(p)
            | RawKind::Removed(p)
            | RawKind::Modified(p)
            | RawKind::Resumed(p)
            | RawKind::Error { path: p, .. } => vec![p.as_path()],
            RawKind::Renamed { from, to } => vec![from.as_path(), to.as_path()],
        }
    }
}

/// Receiver of raw events. Called from the watcher's delivery thread, so
/// implementations must tolerate calls concurrent with their other methods.
pub trait EventHandler: Send + Sync {
    fn dispatch(&self, event: &RawEvent) {
        self.on_any_event(event);
        match &event.kind {
            RawKind::Created(path) => self.on_created(path, event.at),
            RawKind::Removed(path) => self.on_deleted(path, event.at),
            RawKind::Modified(path) => self.on_modified(path, event.at),
            RawKind::Renamed { from, to } => self.on_moved(from, to, event.at),
            RawKind::Error { path, message } => self.on_error(path, message),
            RawKind::Resumed(path) => self.on_resumed(path),
        }
    }

    fn on_any_event(&self, _event: &RawEvent) {}
    fn on_created(&self, _path: &Path, _at: DateTime<Utc>) {}
    fn on_deleted(&self, _path: &Path, _at: DateTime<Utc>) {}
    fn on_modified(&self, _path: &Path, _at: DateTime<Utc>) {}
    fn on_moved(&self, _from: &Path, _to: &Path, _at: DateTime<Utc>) {}
    fn on_error(&self, _path: &Path, _message: &str) {}
    fn on_resumed(&self, _path: &Path) {}
}

pub trait Watcher: Send {
    /// Deliver every event under `path` (and below it when `recursive`) to
    /// `handler`. Several handlers may watch overlapping paths.
    fn register(
        &mut self,
        path: &Path,
        handler: Arc<dyn EventHandler>,
        recursive: bool,
    ) -> Result<(), SyncError>;

    /// Retry watching any path whose watch has failed. Returns `true` when
    /// every registered path is being watched.
    fn resume(&mut self) -> bool;

    fn unwatch_all(&mut self);

    /// `false` when no events are ever delivered and callers must rescan.
    fn is_live(&self) -> bool {
        true
    }
}

/// A watcher that never delivers events. Workspaces using it rescan their
/// tree on every cycle, which is what one-shot runs want.
#[derive(Debug, Default)]
pub struct DetachedWatcher {
    roots: Vec<PathBuf>,
}

impl DetachedWatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Watcher for DetachedWatcher {
    fn register(
        &mut self,
        path: &Path,
        _handler: Arc<dyn EventHandler>,
        _recursive: bool,
    ) -> Result<(), SyncError> {
        self.roots.push(path.to_path_buf());
        Ok(())
    }

    fn resume(&mut self) -> bool {
        self.roots.iter().all(|root| root.is_dir())
    }

    fn unwatch_all(&mut self) {
        self.roots.clear();
    }

    fn is_live(&self) -> bool {
        false
    }
}
