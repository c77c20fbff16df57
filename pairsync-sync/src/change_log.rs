//! Per-workspace ordered change log on top of a [`LogStore`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use pairsync_core::{ChangeOp, ChangeRecord, Inode, RelPath, Sequence, WorkspaceId};

use crate::error::StoreError;
use crate::store::{LogStore, Watermark};

/// Records fetched per storage round-trip by [`ChangeIter`].
const BATCH: usize = 256;

pub struct ChangeLog {
    id: WorkspaceId,
    store: Arc<dyn LogStore>,
    /// Serialises sequence assignment across the watcher thread and merger.
    append_lock: Mutex<()>,
}

impl ChangeLog {
    pub fn new(id: WorkspaceId, store: Arc<dyn LogStore>) -> Self {
        Self {
            id,
            store,
            append_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    /// Append a record with the next sequence. Durable once this returns.
    pub fn append(
        &self,
        op: ChangeOp,
        subject: Inode,
        previous_path: Option<RelPath>,
    ) -> Result<ChangeRecord, StoreError> {
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| StoreError::Unavailable(format!("append lock for {} poisoned", self.id)))?;
        let sequence = self.store.last_sequence(&self.id)?.next();
        let record = ChangeRecord {
            sequence,
            op,
            subject,
            previous_path,
        };
        self.store.append(&self.id, &record)?;
        tracing::debug!(
            workspace = %self.id,
            sequence = %record.sequence,
            op = %record.op,
            path = %record.subject.path,
            "change appended",
        );
        Ok(record)
    }

    /// Everything after `after`, up to the last record present right now.
    /// Records appended after this call are not observed by the iterator.
    pub fn changes_since(&self, after: Sequence) -> Result<ChangeIter, StoreError> {
        let upto = self.store.last_sequence(&self.id)?;
        Ok(ChangeIter {
            store: Arc::clone(&self.store),
            id: self.id.clone(),
            cursor: after,
            upto,
            buffer: VecDeque::new(),
            failed: false,
        })
    }

    pub fn get(&self, sequence: Sequence) -> Result<Option<ChangeRecord>, StoreError> {
        self.store.get(&self.id, sequence)
    }

    pub fn last_sequence(&self) -> Result<Sequence, StoreError> {
        self.store.last_sequence(&self.id)
    }

    pub fn assert_ready(&self) -> Result<(), StoreError> {
        self.store.check(&self.id)
    }

    pub fn load_watermark(&self, peer: &WorkspaceId) -> Result<Watermark, StoreError> {
        self.store.load_watermark(&self.id, peer)
    }

    pub fn save_watermark(&self, peer: &WorkspaceId, watermark: &Watermark) -> Result<(), StoreError> {
        self.store.save_watermark(&self.id, peer, watermark)?;
        tracing::debug!(
            workspace = %self.id,
            peer = %peer,
            sequence = %watermark.sequence,
            deferred = watermark.deferred.len(),
            "watermark saved",
        );
        Ok(())
    }

    /// Fold the whole log into the tree it describes.
    pub fn snapshot(&self) -> Result<BTreeMap<RelPath, Inode>, StoreError> {
        let mut tree = BTreeMap::new();
        for record in self.changes_since(Sequence::ZERO)? {
            apply_record(&mut tree, &record?);
        }
        Ok(tree)
    }
}

/// Replay one record onto a tree.
pub(crate) fn apply_record(tree: &mut BTreeMap<RelPath, Inode>, record: &ChangeRecord) {
    match record.op {
        ChangeOp::Created | ChangeOp::Modified => {
            tree.insert(record.subject.path.clone(), record.subject.clone());
        }
        ChangeOp::Deleted => {
            tree.retain(|path, _| !path.is_within(&record.subject.path));
        }
        ChangeOp::Moved => {
            if let Some(from) = &record.previous_path {
                rebase_subtree(tree, from, &record.subject.path);
            }
            tree.insert(record.subject.path.clone(), record.subject.clone());
        }
    }
}

/// Move every entry at or beneath `from` to the same place beneath `to`.
pub(crate) fn rebase_subtree(tree: &mut BTreeMap<RelPath, Inode>, from: &RelPath, to: &RelPath) {
    let moved: Vec<RelPath> = tree
        .keys()
        .filter(|path| path.is_within(from))
        .cloned()
        .collect();
    for old in moved {
        if let (Some(inode), Some(new)) = (tree.remove(&old), old.rebase(from, to)) {
            tree.insert(new.clone(), inode.relocated(new));
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeIter
// ---------------------------------------------------------------------------

/// Lazy, finite, single-pass iterator over a log range.
///
/// The upper bound is fixed when the iterator is created. After a storage
/// error the iterator yields that error once and then ends; callers must ask
/// the [`ChangeLog`] for a fresh iterator.
pub struct ChangeIter {
    store: Arc<dyn LogStore>,
    id: WorkspaceId,
    cursor: Sequence,
    upto: Sequence,
    buffer: VecDeque<ChangeRecord>,
    failed: bool,
}

impl ChangeIter {
    pub fn upto(&self) -> Sequence {
        self.upto
    }
}

impl Iterator for ChangeIter {
    type Item = Result<ChangeRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer.is_empty() && self.cursor < self.upto {
            match self.store.range(&self.id, self.cursor, self.upto, BATCH) {
                Ok(batch) if batch.is_empty() => {
                    self.cursor = self.upto;
                }
                Ok(batch) => self.buffer.extend(batch),
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        let record = self.buffer.pop_front()?;
        self.cursor = record.sequence;
        Some(Ok(record))
    }
}
