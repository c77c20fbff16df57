//! Storage boundary for change logs and watermarks.
//!
//! A [`LogStore`] is an ordered, append-only key-value log keyed by
//! `(WorkspaceId, Sequence)`, plus a small side table of per-peer
//! [`Watermark`]s. Two engines ship: [`MemoryStore`] (non-durable) and
//! [`FileStore`](crate::file_store::FileStore) (JSON lines on disk).

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use pairsync_core::{ChangeRecord, Sequence, WorkspaceId};

use crate::error::StoreError;

/// Per-(workspace, peer) reconciliation cursor.
///
/// Every record with `sequence <= self.sequence` has been reconciled with the
/// peer, except the ones listed in `deferred`, whose operations failed and are
/// retried on the next cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub sequence: Sequence,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub deferred: BTreeSet<Sequence>,
}

impl Watermark {
    pub fn is_reconciled(&self, sequence: Sequence) -> bool {
        sequence <= self.sequence && !self.deferred.contains(&sequence)
    }
}

/// Durable ordered log keyed by `(workspace, sequence)`.
///
/// Implementations must make `append` durable before returning and must
/// reject any record whose sequence is not exactly `last_sequence + 1`.
pub trait LogStore: Send + Sync {
    fn append(&self, workspace: &WorkspaceId, record: &ChangeRecord) -> Result<(), StoreError>;

    /// Records with `after < sequence <= upto`, ascending, at most `limit`.
    fn range(
        &self,
        workspace: &WorkspaceId,
        after: Sequence,
        upto: Sequence,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError>;

    fn get(
        &self,
        workspace: &WorkspaceId,
        sequence: Sequence,
    ) -> Result<Option<ChangeRecord>, StoreError>;

    /// Highest appended sequence, `Sequence::ZERO` for an empty log.
    fn last_sequence(&self, workspace: &WorkspaceId) -> Result<Sequence, StoreError>;

    /// Fails when the log cannot be trusted (unreachable, truncated, corrupt).
    /// An empty log is healthy.
    fn check(&self, workspace: &WorkspaceId) -> Result<(), StoreError>;

    fn load_watermark(
        &self,
        workspace: &WorkspaceId,
        peer: &WorkspaceId,
    ) -> Result<Watermark, StoreError>;

    fn save_watermark(
        &self,
        workspace: &WorkspaceId,
        peer: &WorkspaceId,
        watermark: &Watermark,
    ) -> Result<(), StoreError>;
}

/// Check that `record` is the next entry after `last`.
pub(crate) fn expect_next(
    workspace: &WorkspaceId,
    last: Sequence,
    record: &ChangeRecord,
) -> Result<(), StoreError> {
    if record.sequence != last.next() {
        return Err(StoreError::OutOfOrder {
            workspace: workspace.clone(),
            expected: last.next(),
            got: record.sequence,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryTables {
    logs: HashMap<WorkspaceId, Vec<ChangeRecord>>,
    watermarks: HashMap<(WorkspaceId, WorkspaceId), Watermark>,
}

/// In-process store. History disappears with the process.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

impl LogStore for MemoryStore {
    fn append(&self, workspace: &WorkspaceId, record: &ChangeRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let log = tables.logs.entry(workspace.clone()).or_default();
        let last = log.last().map(|r| r.sequence).unwrap_or(Sequence::ZERO);
        expect_next(workspace, last, record)?;
        log.push(record.clone());
        Ok(())
    }

    fn range(
        &self,
        workspace: &WorkspaceId,
        after: Sequence,
        upto: Sequence,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        let Some(log) = tables.logs.get(workspace) else {
            return Ok(Vec::new());
        };
        // Sequences are gap-free from 1, so index == sequence - 1.
        let start = usize::try_from(after.0).unwrap_or(usize::MAX).min(log.len());
        Ok(log[start..]
            .iter()
            .take_while(|r| r.sequence <= upto)
            .take(limit)
            .cloned()
            .collect())
    }

    fn get(
        &self,
        workspace: &WorkspaceId,
        sequence: Sequence,
    ) -> Result<Option<ChangeRecord>, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        if sequence == Sequence::ZERO {
            return Ok(None);
        }
        Ok(tables
            .logs
            .get(workspace)
            .and_then(|log| log.get((sequence.0 - 1) as usize))
            .cloned())
    }

    fn last_sequence(&self, workspace: &WorkspaceId) -> Result<Sequence, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .logs
            .get(workspace)
            .and_then(|log| log.last())
            .map(|r| r.sequence)
            .unwrap_or(Sequence::ZERO))
    }

    fn check(&self, _workspace: &WorkspaceId) -> Result<(), StoreError> {
        self.tables.read().map_err(|_| poisoned())?;
        Ok(())
    }

    fn load_watermark(
        &self,
        workspace: &WorkspaceId,
        peer: &WorkspaceId,
    ) -> Result<Watermark, StoreError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .watermarks
            .get(&(workspace.clone(), peer.clone()))
            .cloned()
            .unwrap_or_default())
    }

    fn save_watermark(
        &self,
        workspace: &WorkspaceId,
        peer: &WorkspaceId,
        watermark: &Watermark,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        tables
            .watermarks
            .insert((workspace.clone(), peer.clone()), watermark.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pairsync_core::{ChangeOp, Inode, RelPath};

    fn record(seq: u64, path: &str) -> ChangeRecord {
        ChangeRecord {
            sequence: Sequence(seq),
            op: ChangeOp::Created,
            subject: Inode::file(RelPath::new(path).unwrap(), "ff", Utc::now(), 1),
            previous_path: None,
        }
    }

    #[test]
    fn append_enforces_gap_free_sequences() {
        let store = MemoryStore::new();
        let ws = WorkspaceId::from("job.local");
        store.append(&ws, &record(1, "a")).unwrap();
        let err = store.append(&ws, &record(3, "b")).unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { .. }));
        store.append(&ws, &record(2, "b")).unwrap();
        assert_eq!(store.last_sequence(&ws).unwrap(), Sequence(2));
    }

    #[test]
    fn range_is_bounded_on_both_ends() {
        let store = MemoryStore::new();
        let ws = WorkspaceId::from("job.local");
        for seq in 1..=5 {
            store.append(&ws, &record(seq, &format!("f{seq}"))).unwrap();
        }
        let seqs: Vec<u64> = store
            .range(&ws, Sequence(1), Sequence(4), 10)
            .unwrap()
            .iter()
            .map(|r| r.sequence.0)
            .collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(store.range(&ws, Sequence(0), Sequence(5), 2).unwrap().len(), 2);
        assert!(store.range(&ws, Sequence(5), Sequence(5), 10).unwrap().is_empty());
        assert_eq!(store.get(&ws, Sequence(3)).unwrap().unwrap().sequence, Sequence(3));
        assert!(store.get(&ws, Sequence(9)).unwrap().is_none());
    }

    #[test]
    fn watermarks_are_per_peer() {
        let store = MemoryStore::new();
        let ws = WorkspaceId::from("job.local");
        let peer = WorkspaceId::from("job.remote");
        assert_eq!(store.load_watermark(&ws, &peer).unwrap(), Watermark::default());

        let mut wm = Watermark {
            sequence: Sequence(4),
            ..Default::default()
        };
        wm.deferred.insert(Sequence(2));
        store.save_watermark(&ws, &peer, &wm).unwrap();
        assert_eq!(store.load_watermark(&ws, &peer).unwrap(), wm);
        assert!(!wm.is_reconciled(Sequence(2)));
        assert!(wm.is_reconciled(Sequence(3)));
        assert!(!wm.is_reconciled(Sequence(5)));
    }
}
