//! One side of a sync relationship: a root directory, its change log, its
//! classifier and its watcher.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use pairsync_core::{ChangeRecord, GlobFilter, Inode, RelPath, Sequence, WorkspaceId};

use crate::change_log::ChangeLog;
use crate::classifier::{AppliedChange, DiffClassifier};
use crate::error::SyncError;
use crate::fingerprint::snapshot;
use crate::store::{LogStore, Watermark};
use crate::watch::{EventHandler, Watcher};

/// What a merger needs from each endpoint.
pub trait Synchronizable: Send + Sync {
    fn id(&self) -> &WorkspaceId;
    fn root(&self) -> &Path;

    /// Fails when the change log cannot be trusted. An empty log is fine.
    fn assert_ready(&self) -> Result<(), SyncError>;

    /// Unreconciled records relative to `watermark`: the deferred ones plus
    /// everything after `watermark.sequence`, ascending.
    fn get_changes(&self, watermark: &Watermark) -> Result<Vec<ChangeRecord>, SyncError>;

    /// What [`get_changes`](Self::get_changes) followed by
    /// [`known`](Self::known) would return, without logging anything.
    /// Pending changes get sequence numbers past the end of the log.
    fn preview_changes(
        &self,
        watermark: &Watermark,
    ) -> Result<(Vec<ChangeRecord>, BTreeMap<RelPath, Inode>), SyncError>;

    /// Tree as described by the change log.
    fn known(&self) -> Result<BTreeMap<RelPath, Inode>, SyncError>;

    /// Current on-disk state of `path`.
    fn probe(&self, path: &RelPath) -> Result<Option<Inode>, SyncError>;

    /// Record a change the merger made here.
    fn note_applied(&self, change: AppliedChange) -> Result<Option<ChangeRecord>, SyncError>;

    fn load_watermark(&self, peer: &WorkspaceId) -> Result<Watermark, SyncError>;
    fn save_watermark(&self, peer: &WorkspaceId, watermark: &Watermark) -> Result<(), SyncError>;

    /// The watcher lost its hold on the tree.
    fn degraded(&self) -> bool;

    /// Try to restore watching. Returns `true` when healthy again.
    fn resume(&self) -> bool;

    fn start(&self) -> Result<(), SyncError>;
    fn stop(&self);
}

pub struct Workspace {
    id: WorkspaceId,
    root: PathBuf,
    recursive: bool,
    log: Arc<ChangeLog>,
    classifier: Arc<DiffClassifier>,
    watcher: Mutex<Box<dyn Watcher>>,
}

impl Workspace {
    /// Bind `root` to the log `id` in `store`. The known tree is rebuilt from
    /// the log; nothing is watched until [`Synchronizable::start`].
    pub fn open(
        id: WorkspaceId,
        root: impl Into<PathBuf>,
        filter: GlobFilter,
        recursive: bool,
        move_window: Duration,
        store: Arc<dyn LogStore>,
        watcher: Box<dyn Watcher>,
    ) -> Result<Self, SyncError> {
        let root = root.into();
        let log = Arc::new(ChangeLog::new(id.clone(), store));
        let known = log.snapshot()?;
        let classifier = Arc::new(DiffClassifier::new(
            root.clone(),
            filter,
            recursive,
            move_window,
            Arc::clone(&log),
            known,
        ));
        Ok(Self {
            id,
            root,
            recursive,
            log,
            classifier,
            watcher: Mutex::new(watcher),
        })
    }

    pub fn log(&self) -> &ChangeLog {
        &self.log
    }

    pub fn classifier(&self) -> &Arc<DiffClassifier> {
        &self.classifier
    }

    fn logged_changes(&self, watermark: &Watermark) -> Result<Vec<ChangeRecord>, SyncError> {
        let mut records = Vec::new();
        let mut seen = BTreeSet::new();
        for sequence in &watermark.deferred {
            if let Some(record) = self.log.get(*sequence)? {
                seen.insert(record.sequence);
                records.push(record);
            }
        }
        for record in self.log.changes_since(watermark.sequence)? {
            let record = record?;
            if seen.insert(record.sequence) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    fn is_live(&self) -> Result<bool, SyncError> {
        Ok(self
            .watcher
            .lock()
            .map_err(|_| SyncError::Poisoned("watcher"))?
            .is_live())
    }
}

impl Synchronizable for Workspace {
    fn id(&self) -> &WorkspaceId {
        &self.id
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn assert_ready(&self) -> Result<(), SyncError> {
        if !self.root.is_dir() {
            return Err(SyncError::WatcherDown {
                workspace: self.id.clone(),
                root: self.root.clone(),
            });
        }
        self.log.assert_ready().map_err(|source| SyncError::NotReady {
            workspace: self.id.clone(),
            source,
        })
    }

    fn get_changes(&self, watermark: &Watermark) -> Result<Vec<ChangeRecord>, SyncError> {
        if self.is_live()? {
            self.classifier.flush(Utc::now())?;
        } else {
            self.classifier.rescan()?;
        }
        self.logged_changes(watermark)
    }

    fn preview_changes(
        &self,
        watermark: &Watermark,
    ) -> Result<(Vec<ChangeRecord>, BTreeMap<RelPath, Inode>), SyncError> {
        let mut records = self.logged_changes(watermark)?;
        let (pending, tree) = self.classifier.preview(self.log.last_sequence()?)?;
        records.extend(pending);
        Ok((records, tree))
    }

    fn known(&self) -> Result<BTreeMap<RelPath, Inode>, SyncError> {
        self.classifier.known()
    }

    fn probe(&self, path: &RelPath) -> Result<Option<Inode>, SyncError> {
        snapshot(&self.root, path)
    }

    fn note_applied(&self, change: AppliedChange) -> Result<Option<ChangeRecord>, SyncError> {
        self.classifier.note_applied(change)
    }

    fn load_watermark(&self, peer: &WorkspaceId) -> Result<Watermark, SyncError> {
        Ok(self.log.load_watermark(peer)?)
    }

    fn save_watermark(&self, peer: &WorkspaceId, watermark: &Watermark) -> Result<(), SyncError> {
        Ok(self.log.save_watermark(peer, watermark)?)
    }

    fn degraded(&self) -> bool {
        self.classifier.degraded()
    }

    fn resume(&self) -> bool {
        let healthy = match self.watcher.lock() {
            Ok(mut watcher) => watcher.resume(),
            Err(_) => false,
        };
        if healthy {
            self.classifier.mark_resumed();
        }
        healthy
    }

    /// Register the watcher first, then rescan, so nothing that happens in
    /// between is missed.
    fn start(&self) -> Result<(), SyncError> {
        {
            let mut watcher = self
                .watcher
                .lock()
                .map_err(|_| SyncError::Poisoned("watcher"))?;
            let handler: Arc<dyn EventHandler> = self.classifier.clone();
            watcher.register(&self.root, handler, self.recursive)?;
        }
        let found = self.classifier.rescan()?;
        tracing::info!(
            workspace = %self.id,
            root = %self.root.display(),
            changes = found.len(),
            last_sequence = %self.log.last_sequence().unwrap_or(Sequence::ZERO),
            "workspace started",
        );
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            watcher.unwatch_all();
        }
        tracing::info!(workspace = %self.id, "workspace stopped");
    }
}
