//! Turns raw watcher events into canonical change records.
//!
//! Events only mark paths dirty. At [`DiffClassifier::flush`] every dirty path
//! is snapshotted and compared with the known tree (the state the change log
//! describes), so bursts collapse to their net effect:
//!
//! | before → after          | record      |
//! |-------------------------|-------------|
//! | absent → present        | `Created`   |
//! | present → absent        | `Deleted`   |
//! | content changed         | `Modified`  |
//! | only mtime changed      | nothing     |
//! | absent → absent         | nothing     |
//!
//! A deletion and a creation observed together are joined into `Moved` when
//! the watcher reported the rename, or when both are files with the same
//! fingerprint. Deletions with no partner are held back for `move_window` so
//! the other half of a rename has time to arrive.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use pairsync_core::{ChangeOp, ChangeRecord, GlobFilter, Inode, RelPath, Sequence, WorkspaceId};

use crate::change_log::{apply_record, ChangeLog};
use crate::error::SyncError;
use crate::fingerprint::{snapshot_hinted, walk, walk_subtree};
use crate::watch::EventHandler;

/// A filesystem change made by the merger on this side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedChange {
    Present(Inode),
    Absent(RelPath),
    Moved { from: RelPath, to: Inode },
}

#[derive(Debug, Clone, Copy)]
struct Dirty {
    observed: DateTime<Utc>,
}

/// Where classified records go: the change log, or a scratch numbering for
/// previews.
type Append<'a> = dyn FnMut(ChangeOp, Inode, Option<RelPath>) -> Result<ChangeRecord, SyncError> + 'a;

#[derive(Default)]
struct State {
    /// Tree as described by the change log.
    known: BTreeMap<RelPath, Inode>,
    dirty: BTreeMap<RelPath, Dirty>,
    renames: Vec<(RelPath, RelPath)>,
    rescan_requested: bool,
}

#[derive(Debug, Clone)]
struct Gone {
    inode: Inode,
    observed: DateTime<Utc>,
    /// Kind changes are never held back waiting for a rename partner.
    holdable: bool,
}

#[derive(Default)]
struct Batch {
    gone: BTreeMap<RelPath, Gone>,
    present: BTreeMap<RelPath, Inode>,
}

impl Batch {
    fn gone(&mut self, inode: &Inode, observed: DateTime<Utc>, holdable: bool) {
        let entry = self.gone.entry(inode.path.clone()).or_insert(Gone {
            inode: inode.clone(),
            observed,
            holdable,
        });
        entry.observed = entry.observed.max(observed);
        entry.holdable &= holdable;
    }
}

pub struct DiffClassifier {
    id: WorkspaceId,
    root: PathBuf,
    filter: GlobFilter,
    recursive: bool,
    move_window: chrono::Duration,
    log: Arc<ChangeLog>,
    state: Mutex<State>,
    degraded: AtomicBool,
}

impl DiffClassifier {
    /// `known` is the tree the log currently describes, normally
    /// [`ChangeLog::snapshot`].
    pub fn new(
        root: impl Into<PathBuf>,
        filter: GlobFilter,
        recursive: bool,
        move_window: Duration,
        log: Arc<ChangeLog>,
        mut known: BTreeMap<RelPath, Inode>,
    ) -> Self {
        known.retain(|path, _| filter.matches(path));
        Self {
            id: log.id().clone(),
            root: root.into(),
            filter,
            recursive,
            move_window: chrono::Duration::from_std(move_window)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(500)),
            log,
            state: Mutex::new(State {
                known,
                ..State::default()
            }),
            degraded: AtomicBool::new(false),
        }
    }

    fn to_log(
        &self,
    ) -> impl FnMut(ChangeOp, Inode, Option<RelPath>) -> Result<ChangeRecord, SyncError> + '_ {
        move |op, subject, previous| {
            self.log
                .append(op, subject, previous)
                .map_err(SyncError::from)
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, SyncError> {
        self.state
            .lock()
            .map_err(|_| SyncError::Poisoned("classifier"))
    }

    pub fn known(&self) -> Result<BTreeMap<RelPath, Inode>, SyncError> {
        Ok(self.lock()?.known.clone())
    }

    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Clear the degraded flag and rescan on the next flush, since events
    /// were lost while the watch was down.
    pub fn mark_resumed(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            tracing::info!(workspace = %self.id, "watch resumed; rescan scheduled");
        }
        if let Ok(mut state) = self.lock() {
            state.rescan_requested = true;
        }
    }

    /// Workspace-relative path for an event path, or `None` when it is
    /// outside the tracked set.
    fn relative(&self, path: &Path) -> Option<RelPath> {
        let rel = RelPath::from_root(&self.root, path)?;
        if !self.recursive && rel.depth() > 1 {
            return None;
        }
        if self.filter.excludes(&rel) {
            return None;
        }
        Some(rel)
    }

    fn mark(&self, path: &Path, at: DateTime<Utc>) -> Option<RelPath> {
        let rel = self.relative(path)?;
        let Ok(mut state) = self.lock() else {
            tracing::error!(workspace = %self.id, "classifier lock poisoned; event dropped");
            return None;
        };
        state
            .dirty
            .entry(rel.clone())
            .and_modify(|d| d.observed = d.observed.max(at))
            .or_insert(Dirty { observed: at });
        Some(rel)
    }

    // -----------------------------------------------------------------------
    // Flush
    // -----------------------------------------------------------------------

    /// Classify every dirty path and append the results to the change log.
    ///
    /// Deletions younger than the move window at `now` stay dirty. On error
    /// nothing is lost: unprocessed paths remain dirty for the next flush.
    pub fn flush(&self, now: DateTime<Utc>) -> Result<Vec<ChangeRecord>, SyncError> {
        let mut state = self.lock()?;
        if state.rescan_requested {
            state.rescan_requested = false;
            return match self.rescan_locked(&mut state, now) {
                Ok(records) => Ok(records),
                Err(err) => {
                    state.rescan_requested = true;
                    Err(err)
                }
            };
        }

        let dirty = std::mem::take(&mut state.dirty);
        let renames = std::mem::take(&mut state.renames);
        match self.settle(&mut state, &dirty, &renames, now) {
            Ok(records) => Ok(records),
            Err(err) => {
                for (path, d) in dirty {
                    state.dirty.entry(path).or_insert(d);
                }
                state.renames.extend(renames);
                Err(err)
            }
        }
    }

    fn settle(
        &self,
        state: &mut State,
        dirty: &BTreeMap<RelPath, Dirty>,
        renames: &[(RelPath, RelPath)],
        now: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        let mut batch = Batch::default();
        for (path, d) in dirty {
            self.examine(&state.known, path, d.observed, &mut batch)?;
        }
        self.emit(state, batch, renames, Some(now), &mut self.to_log())
    }

    /// Compare the on-disk state at and below `path` with `known`.
    fn examine(
        &self,
        known: &BTreeMap<RelPath, Inode>,
        path: &RelPath,
        observed: DateTime<Utc>,
        batch: &mut Batch,
    ) -> Result<(), SyncError> {
        let disk = snapshot_hinted(&self.root, path, known.get(path))?;
        let Some(current) = disk else {
            for inode in subtree(known, path) {
                batch.gone(inode, observed, true);
            }
            return Ok(());
        };

        match known.get(path) {
            Some(old) if old.kind != current.kind => {
                for inode in subtree(known, path) {
                    batch.gone(inode, observed, false);
                }
                if self.filter.matches(path) {
                    batch.present.insert(path.clone(), current.clone());
                }
            }
            Some(old) if old.same_content(&current) => {}
            _ if self.filter.matches(path) => {
                batch.present.insert(path.clone(), current.clone());
            }
            _ => {}
        }

        if current.is_dir() && self.recursive {
            let below = walk_subtree(&self.root, path, &self.filter, known)?;
            for (rel, inode) in &below {
                match known.get(rel) {
                    Some(old) if old.kind != inode.kind => {
                        batch.gone(old, observed, false);
                        batch.present.insert(rel.clone(), inode.clone());
                    }
                    Some(old) if old.same_content(inode) => {}
                    _ => {
                        batch.present.insert(rel.clone(), inode.clone());
                    }
                }
            }
            for inode in subtree(known, path) {
                if inode.path != *path && !below.contains_key(&inode.path) {
                    batch.gone(inode, observed, true);
                }
            }
        }
        Ok(())
    }

    /// Pair, order and append a batch. `now` is `None` for rescans, which
    /// never hold deletions back.
    fn emit(
        &self,
        state: &mut State,
        mut batch: Batch,
        renames: &[(RelPath, RelPath)],
        now: Option<DateTime<Utc>>,
        append: &mut Append<'_>,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        let mut records = Vec::new();

        // Directory renames reported by the watcher.
        for (from, to) in renames {
            let from_is_dir = state.known.get(from).is_some_and(Inode::is_dir)
                && batch.gone.contains_key(from);
            let to_dir = match batch.present.get(to) {
                Some(inode) if inode.is_dir() && !state.known.contains_key(to) => inode.clone(),
                _ => continue,
            };
            if !from_is_dir {
                continue;
            }
            batch.gone.retain(|path, _| !path.is_within(from));
            let arrived: BTreeMap<RelPath, Inode> = batch
                .present
                .iter()
                .filter(|(path, _)| path.is_within(to) && *path != to)
                .map(|(p, i)| (p.clone(), i.clone()))
                .collect();
            batch.present.retain(|path, _| !path.is_within(to));

            let record = append(ChangeOp::Moved, to_dir, Some(from.clone()))?;
            apply_record(&mut state.known, &record);
            records.push(record);

            // Contents may have changed on the way.
            let observed = now.unwrap_or_else(Utc::now);
            for (path, inode) in &arrived {
                match state.known.get(path) {
                    Some(old) if old.same_content(inode) => {}
                    Some(old) if old.kind != inode.kind => {
                        batch.gone(old, observed, false);
                        batch.present.insert(path.clone(), inode.clone());
                    }
                    _ => {
                        batch.present.insert(path.clone(), inode.clone());
                    }
                }
            }
            for inode in subtree(&state.known, to) {
                if inode.path != *to && !arrived.contains_key(&inode.path) {
                    batch.gone(inode, observed, true);
                }
            }
        }

        // File renames: a reported rename first, then any fingerprint match.
        let creates: Vec<RelPath> = batch
            .present
            .iter()
            .filter(|(path, inode)| !inode.is_dir() && !state.known.contains_key(*path))
            .map(|(path, _)| path.clone())
            .collect();
        let mut paired = BTreeSet::new();
        for to in creates {
            let Some(inode) = batch.present.get(&to).cloned() else {
                continue;
            };
            let reported = renames
                .iter()
                .find(|(from, t)| *t == to && self.is_move_source(&batch, from, &inode, &paired))
                .map(|(from, _)| from.clone());
            let source = reported.or_else(|| {
                batch
                    .gone
                    .keys()
                    .find(|from| self.is_move_source(&batch, from, &inode, &paired))
                    .cloned()
            });
            let Some(from) = source else {
                continue;
            };
            paired.insert(from.clone());
            batch.gone.remove(&from);
            batch.present.remove(&to);
            let record = append(ChangeOp::Moved, inode, Some(from))?;
            apply_record(&mut state.known, &record);
            records.push(record);
        }

        // Deletions, deepest first.
        let mut gone: Vec<Gone> = batch.gone.into_values().collect();
        gone.sort_by(|a, b| {
            b.inode
                .path
                .depth()
                .cmp(&a.inode.path.depth())
                .then_with(|| a.inode.path.cmp(&b.inode.path))
        });
        for g in gone {
            if let Some(now) = now {
                if g.holdable && now - g.observed < self.move_window {
                    state
                        .dirty
                        .entry(g.inode.path.clone())
                        .or_insert(Dirty {
                            observed: g.observed,
                        });
                    continue;
                }
            }
            if !state.known.contains_key(&g.inode.path) {
                continue;
            }
            let subject = Inode {
                mod_time: g.observed,
                ..g.inode
            };
            let record = append(ChangeOp::Deleted, subject, None)?;
            apply_record(&mut state.known, &record);
            records.push(record);
        }

        // Creations and modifications, parents first.
        let mut present: Vec<Inode> = batch.present.into_values().collect();
        present.sort_by(|a, b| {
            a.path
                .depth()
                .cmp(&b.path.depth())
                .then_with(|| a.path.cmp(&b.path))
        });
        for inode in present {
            let op = match state.known.get(&inode.path) {
                None => ChangeOp::Created,
                Some(old) if old.kind == inode.kind && old.same_content(&inode) => continue,
                // Kind change whose deletion is still held.
                Some(old) if old.kind != inode.kind => continue,
                Some(_) => ChangeOp::Modified,
            };
            let record = append(op, inode, None)?;
            apply_record(&mut state.known, &record);
            records.push(record);
        }

        if !records.is_empty() {
            tracing::debug!(workspace = %self.id, count = records.len(), "changes classified");
        }
        Ok(records)
    }

    fn is_move_source(
        &self,
        batch: &Batch,
        from: &RelPath,
        inode: &Inode,
        paired: &BTreeSet<RelPath>,
    ) -> bool {
        !paired.contains(from)
            && batch.gone.get(from).is_some_and(|g| {
                g.holdable && !g.inode.is_dir() && g.inode.fingerprint == inode.fingerprint
            })
    }

    // -----------------------------------------------------------------------
    // Rescan
    // -----------------------------------------------------------------------

    /// Compare the whole tree on disk with the known tree and log every
    /// difference, including changes made while nothing was watching.
    pub fn rescan(&self) -> Result<Vec<ChangeRecord>, SyncError> {
        let mut state = self.lock()?;
        state.rescan_requested = false;
        self.rescan_locked(&mut state, Utc::now())
    }

    fn rescan_locked(
        &self,
        state: &mut State,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>, SyncError> {
        let batch = self.diff_tree(&state.known, now)?;
        state.dirty.clear();
        state.renames.clear();
        let records = self.emit(state, batch, &[], None, &mut self.to_log())?;
        tracing::info!(
            workspace = %self.id,
            root = %self.root.display(),
            changes = records.len(),
            "rescan complete",
        );
        Ok(records)
    }

    /// The records a rescan would log right now, numbered after `after`,
    /// and the tree they lead to. Neither the log nor the known tree changes.
    pub fn preview(
        &self,
        after: Sequence,
    ) -> Result<(Vec<ChangeRecord>, BTreeMap<RelPath, Inode>), SyncError> {
        let mut scratch = State {
            known: self.lock()?.known.clone(),
            ..State::default()
        };
        let batch = self.diff_tree(&scratch.known, Utc::now())?;
        let mut next = after;
        let mut number = |op: ChangeOp,
                          subject: Inode,
                          previous_path: Option<RelPath>|
         -> Result<ChangeRecord, SyncError> {
            next = next.next();
            Ok(ChangeRecord {
                sequence: next,
                op,
                subject,
                previous_path,
            })
        };
        let records = self.emit(&mut scratch, batch, &[], None, &mut number)?;
        Ok((records, scratch.known))
    }

    /// Differences between the whole tree on disk and `known`.
    fn diff_tree(
        &self,
        known: &BTreeMap<RelPath, Inode>,
        now: DateTime<Utc>,
    ) -> Result<Batch, SyncError> {
        let disk = walk(&self.root, &self.filter, self.recursive, known)?;
        let mut batch = Batch::default();
        for (path, old) in known {
            match disk.get(path) {
                None => batch.gone(old, now, true),
                Some(new) if new.kind != old.kind => {
                    batch.gone(old, now, false);
                    batch.present.insert(path.clone(), new.clone());
                }
                Some(new) if !old.same_content(new) => {
                    batch.present.insert(path.clone(), new.clone());
                }
                Some(_) => {}
            }
        }
        for (path, inode) in &disk {
            if !known.contains_key(path) {
                batch.present.insert(path.clone(), inode.clone());
            }
        }
        Ok(batch)
    }

    // -----------------------------------------------------------------------
    // Echo suppression
    // -----------------------------------------------------------------------

    /// Log a change the merger made on this side and fold it into the known
    /// tree, so the watcher echo of the same state is not logged again.
    pub fn note_applied(&self, change: AppliedChange) -> Result<Option<ChangeRecord>, SyncError> {
        let mut state = self.lock()?;
        let record = match change {
            AppliedChange::Present(inode) => {
                if !self.filter.matches(&inode.path) {
                    return Ok(None);
                }
                let op = match state.known.get(&inode.path) {
                    None => ChangeOp::Created,
                    Some(old) if old.kind == inode.kind && old.same_content(&inode) => {
                        return Ok(None)
                    }
                    Some(_) => ChangeOp::Modified,
                };
                self.log.append(op, inode, None)?
            }
            AppliedChange::Absent(path) => {
                let Some(old) = state.known.get(&path).cloned() else {
                    return Ok(None);
                };
                let subject = Inode {
                    mod_time: Utc::now(),
                    ..old
                };
                self.log.append(ChangeOp::Deleted, subject, None)?
            }
            AppliedChange::Moved { from, to } => {
                match (self.filter.matches(&from), self.filter.matches(&to.path)) {
                    (_, false) => {
                        drop(state);
                        return self.note_applied(AppliedChange::Absent(from));
                    }
                    (false, true) => self.log.append(ChangeOp::Created, to, None)?,
                    (true, true) => self.log.append(ChangeOp::Moved, to, Some(from))?,
                }
            }
        };
        apply_record(&mut state.known, &record);
        Ok(Some(record))
    }
}

/// Entries at or beneath `path`.
fn subtree<'a>(
    known: &'a BTreeMap<RelPath, Inode>,
    path: &'a RelPath,
) -> impl Iterator<Item = &'a Inode> + 'a {
    known
        .range(path.clone()..)
        .take_while(move |(p, _)| p.as_str().starts_with(path.as_str()))
        .filter(move |(p, _)| p.is_within(path))
        .map(|(_, inode)| inode)
}

impl EventHandler for DiffClassifier {
    fn on_created(&self, path: &Path, at: DateTime<Utc>) {
        self.mark(path, at);
    }

    fn on_modified(&self, path: &Path, at: DateTime<Utc>) {
        self.mark(path, at);
    }

    fn on_deleted(&self, path: &Path, at: DateTime<Utc>) {
        if path == self.root {
            self.on_error(path, "workspace root removed");
            return;
        }
        self.mark(path, at);
    }

    fn on_moved(&self, from: &Path, to: &Path, at: DateTime<Utc>) {
        let from = self.mark(from, at);
        let to = self.mark(to, at);
        if let (Some(from), Some(to)) = (from, to) {
            if let Ok(mut state) = self.lock() {
                state.renames.push((from, to));
            }
        }
    }

    fn on_error(&self, path: &Path, message: &str) {
        self.degraded.store(true, Ordering::SeqCst);
        tracing::warn!(
            workspace = %self.id,
            path = %path.display(),
            error = message,
            "watch failed; workspace degraded",
        );
    }

    fn on_resumed(&self, _path: &Path) {
        self.mark_resumed();
    }
}
