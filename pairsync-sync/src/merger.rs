//! Two-way reconciliation of a pair of workspaces.
//!
//! ## Cycle
//!
//! 1. Resume degraded watchers; give up if either is still down.
//! 2. `assert_ready` on both sides. Any failure aborts before touching disk.
//! 3. Load both watermarks and fetch each side's unreconciled records.
//! 4. Build the [`MergePlan`] from the records and both known trees.
//! 5. Run every step. Changes made by a step are recorded on its target side.
//! 6. Advance each watermark over the records it settled. Records behind a
//!    failed step stay deferred and are fetched again next cycle.
//!
//! State machine: `Idle → Reconciling → Idle`, or `→ Degraded` when the cycle
//! aborts or any step fails. The next cycle starts from whatever was
//! committed.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pairsync_core::{ChangeRecord, JobName, RelPath, Sequence, Side};

use crate::apply::{self, Roots, StepResult};
use crate::error::SyncError;
use crate::plan::{self, Conflict, MergePlan, SideView};
use crate::store::Watermark;
use crate::workspace::Synchronizable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergerState {
    #[default]
    Idle,
    Reconciling,
    Degraded,
}

impl std::fmt::Display for MergerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergerState::Idle => write!(f, "idle"),
            MergerState::Reconciling => write!(f, "reconciling"),
            MergerState::Degraded => write!(f, "degraded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStep {
    pub op: String,
    pub path: RelPath,
    pub error: String,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub job: JobName,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub applied: usize,
    pub skipped: usize,
    pub failed: Vec<FailedStep>,
    pub conflicts: Vec<Conflict>,
    pub local_watermark: Watermark,
    pub remote_watermark: Watermark,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.applied == 0 && self.failed.is_empty() && self.conflicts.is_empty()
    }
}

pub trait Merger: Send + Sync {
    fn name(&self) -> &JobName;

    /// Run one reconciliation cycle.
    fn sync(&self) -> Result<SyncReport, SyncError>;

    /// Compute the plan a cycle would run without applying it, moving any
    /// watermark or appending to either change log.
    fn plan_only(&self) -> Result<MergePlan, SyncError>;

    fn state(&self) -> MergerState;

    /// Start watching both endpoints.
    fn start(&self) -> Result<(), SyncError>;

    fn stop(&self);
}

/// Everything a cycle decides before it touches disk.
struct Prepared {
    local_watermark: Watermark,
    remote_watermark: Watermark,
    local_changes: Vec<ChangeRecord>,
    remote_changes: Vec<ChangeRecord>,
    plan: MergePlan,
}

pub struct TwoWayMerger<L, R> {
    name: JobName,
    local: L,
    remote: R,
    state: Mutex<MergerState>,
    cycle: Mutex<()>,
}

impl<L: Synchronizable, R: Synchronizable> TwoWayMerger<L, R> {
    pub fn new(name: JobName, local: L, remote: R) -> Self {
        Self {
            name,
            local,
            remote,
            state: Mutex::new(MergerState::Idle),
            cycle: Mutex::new(()),
        }
    }

    pub fn local(&self) -> &L {
        &self.local
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    fn endpoint(&self, side: Side) -> &dyn Synchronizable {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    fn set_state(&self, next: MergerState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                tracing::debug!(job = %self.name, from = %*state, to = %next, "merger state");
            }
            *state = next;
        }
    }

    fn begin(&self) -> Result<MutexGuard<'_, ()>, SyncError> {
        self.cycle
            .lock()
            .map_err(|_| SyncError::Poisoned("merge cycle"))
    }

    /// `dry_run` plans from a preview of pending changes instead of logging
    /// them.
    fn prepare(&self, dry_run: bool) -> Result<Prepared, SyncError> {
        for side in [Side::Local, Side::Remote] {
            let endpoint = self.endpoint(side);
            if endpoint.degraded() && !endpoint.resume() {
                return Err(SyncError::WatcherDown {
                    workspace: endpoint.id().clone(),
                    root: endpoint.root().to_path_buf(),
                });
            }
        }
        self.local.assert_ready()?;
        self.remote.assert_ready()?;

        let local_watermark = self.local.load_watermark(self.remote.id())?;
        let remote_watermark = self.remote.load_watermark(self.local.id())?;
        let (local_changes, remote_changes, local_tree, remote_tree) = if dry_run {
            let (local_changes, local_tree) = self.local.preview_changes(&local_watermark)?;
            let (remote_changes, remote_tree) = self.remote.preview_changes(&remote_watermark)?;
            (local_changes, remote_changes, local_tree, remote_tree)
        } else {
            let local_changes = self.local.get_changes(&local_watermark)?;
            let remote_changes = self.remote.get_changes(&remote_watermark)?;
            (local_changes, remote_changes, self.local.known()?, self.remote.known()?)
        };

        let plan = plan::build(
            SideView {
                changes: &local_changes,
                tree: &local_tree,
            },
            SideView {
                changes: &remote_changes,
                tree: &remote_tree,
            },
        );
        tracing::debug!(
            job = %self.name,
            local_changes = local_changes.len(),
            remote_changes = remote_changes.len(),
            steps = plan.steps.len(),
            "plan built",
        );
        Ok(Prepared {
            local_watermark,
            remote_watermark,
            local_changes,
            remote_changes,
            plan,
        })
    }

    fn reconcile(&self, started_at: DateTime<Utc>) -> Result<SyncReport, SyncError> {
        let prepared = self.prepare(false)?;
        let roots = Roots {
            local: self.local.root(),
            remote: self.remote.root(),
        };

        let mut applied = 0;
        let mut skipped = 0;
        let mut failed = Vec::new();
        let mut unsettled: BTreeSet<(Side, Sequence)> = BTreeSet::new();
        let mut authored_local = BTreeSet::new();
        let mut authored_remote = BTreeSet::new();

        for step in &prepared.plan.steps {
            match apply::execute(&step.op, roots) {
                Ok(StepResult::Applied(changes)) => {
                    applied += 1;
                    let target = step.op.target();
                    for change in changes {
                        match self.endpoint(target).note_applied(change) {
                            Ok(Some(record)) => {
                                match target {
                                    Side::Local => authored_local.insert(record.sequence),
                                    Side::Remote => authored_remote.insert(record.sequence),
                                };
                            }
                            Ok(None) => {}
                            Err(err) => {
                                tracing::warn!(
                                    job = %self.name,
                                    op = %step.op,
                                    error = %err,
                                    "applied change could not be recorded",
                                );
                                unsettled.extend(step.consumes.iter().copied());
                            }
                        }
                    }
                }
                Ok(StepResult::Unchanged) => skipped += 1,
                Err(err) => {
                    tracing::warn!(
                        job = %self.name,
                        op = %step.op,
                        error = %err,
                        "operation failed; deferring its changes",
                    );
                    unsettled.extend(step.consumes.iter().copied());
                    failed.push(FailedStep {
                        op: step.op.to_string(),
                        path: step.op.path().clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let local_watermark = advance(
            &prepared.local_watermark,
            &prepared.local_changes,
            &authored_local,
            |s| unsettled.contains(&(Side::Local, s)),
        );
        let remote_watermark = advance(
            &prepared.remote_watermark,
            &prepared.remote_changes,
            &authored_remote,
            |s| unsettled.contains(&(Side::Remote, s)),
        );
        self.commit(Side::Local, &prepared.local_watermark, &local_watermark)?;
        self.commit(Side::Remote, &prepared.remote_watermark, &remote_watermark)?;

        Ok(SyncReport {
            job: self.name.clone(),
            started_at,
            finished_at: Utc::now(),
            applied,
            skipped,
            failed,
            conflicts: prepared.plan.conflicts,
            local_watermark,
            remote_watermark,
        })
    }

    fn commit(&self, side: Side, old: &Watermark, new: &Watermark) -> Result<(), SyncError> {
        if old == new {
            return Ok(());
        }
        let endpoint = self.endpoint(side);
        let peer = self.endpoint(side.other()).id();
        endpoint.save_watermark(peer, new)?;
        tracing::info!(
            job = %self.name,
            workspace = %endpoint.id(),
            from = %old.sequence,
            to = %new.sequence,
            deferred = new.deferred.len(),
            "watermark advanced",
        );
        Ok(())
    }
}

/// Watermark after a cycle that fetched `fetched` and appended `authored`.
///
/// Sequences in the advanced range that were neither fetched nor authored
/// were appended by the watcher mid-cycle and stay deferred.
fn advance(
    old: &Watermark,
    fetched: &[ChangeRecord],
    authored: &BTreeSet<Sequence>,
    unsettled: impl Fn(Sequence) -> bool,
) -> Watermark {
    let fetched: BTreeSet<Sequence> = fetched.iter().map(|r| r.sequence).collect();
    let top = fetched
        .iter()
        .chain(authored.iter())
        .copied()
        .fold(old.sequence, Sequence::max);

    let mut deferred: BTreeSet<Sequence> = old
        .deferred
        .iter()
        .copied()
        .filter(|s| !fetched.contains(s))
        .collect();
    deferred.extend(fetched.iter().copied().filter(|s| unsettled(*s)));
    for n in (old.sequence.0 + 1)..=top.0 {
        let s = Sequence(n);
        if !fetched.contains(&s) && !authored.contains(&s) {
            deferred.insert(s);
        }
    }
    Watermark {
        sequence: top,
        deferred,
    }
}

impl<L: Synchronizable, R: Synchronizable> Merger for TwoWayMerger<L, R> {
    fn name(&self) -> &JobName {
        &self.name
    }

    fn sync(&self) -> Result<SyncReport, SyncError> {
        let _cycle = self.begin()?;
        self.set_state(MergerState::Reconciling);
        tracing::info!(job = %self.name, "sync begin");

        match self.reconcile(Utc::now()) {
            Ok(report) => {
                tracing::info!(
                    job = %self.name,
                    applied = report.applied,
                    skipped = report.skipped,
                    failed = report.failed.len(),
                    conflicts = report.conflicts.len(),
                    local_watermark = %report.local_watermark.sequence,
                    remote_watermark = %report.remote_watermark.sequence,
                    "sync end",
                );
                if report.failed.is_empty() {
                    self.set_state(MergerState::Idle);
                } else {
                    tracing::warn!(
                        job = %self.name,
                        failed = report.failed.len(),
                        "sync degraded; failed operations retry next cycle",
                    );
                    self.set_state(MergerState::Degraded);
                }
                Ok(report)
            }
            Err(err) => {
                tracing::warn!(job = %self.name, error = %err, "sync degraded; cycle abandoned");
                self.set_state(MergerState::Degraded);
                Err(err)
            }
        }
    }

    fn plan_only(&self) -> Result<MergePlan, SyncError> {
        let _cycle = self.begin()?;
        Ok(self.prepare(true)?.plan)
    }

    fn state(&self) -> MergerState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(MergerState::Degraded)
    }

    fn start(&self) -> Result<(), SyncError> {
        self.local.start()?;
        self.remote.start()?;
        tracing::info!(job = %self.name, "merger started");
        Ok(())
    }

    fn stop(&self) {
        self.local.stop();
        self.remote.stop();
        tracing::info!(job = %self.name, "merger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pairsync_core::{ChangeOp, Inode};

    fn record(seq: u64) -> ChangeRecord {
        ChangeRecord {
            sequence: Sequence(seq),
            op: ChangeOp::Created,
            subject: Inode::file(RelPath::new(format!("f{seq}")).unwrap(), "x", Utc::now(), 1),
            previous_path: None,
        }
    }

    fn seqs(set: &BTreeSet<Sequence>) -> Vec<u64> {
        set.iter().map(|s| s.0).collect()
    }

    #[test]
    fn advance_moves_over_everything_settled() {
        let old = Watermark::default();
        let fetched = vec![record(1), record(2), record(3)];
        let wm = advance(&old, &fetched, &BTreeSet::new(), |_| false);
        assert_eq!(wm.sequence, Sequence(3));
        assert!(wm.deferred.is_empty());
    }

    #[test]
    fn failed_records_are_deferred_not_blocking() {
        let old = Watermark::default();
        let fetched = vec![record(1), record(2), record(3)];
        let wm = advance(&old, &fetched, &BTreeSet::new(), |s| s == Sequence(2));
        assert_eq!(wm.sequence, Sequence(3));
        assert_eq!(seqs(&wm.deferred), vec![2]);
    }

    #[test]
    fn authored_records_are_covered_and_gaps_deferred() {
        let old = Watermark {
            sequence: Sequence(2),
            deferred: BTreeSet::new(),
        };
        // 3 fetched, 4 appended by the watcher mid-cycle, 5 written by us.
        let authored: BTreeSet<Sequence> = [Sequence(5)].into_iter().collect();
        let wm = advance(&old, &[record(3)], &authored, |_| false);
        assert_eq!(wm.sequence, Sequence(5));
        assert_eq!(seqs(&wm.deferred), vec![4]);
    }

    #[test]
    fn retried_deferral_clears_once_settled() {
        let old = Watermark {
            sequence: Sequence(5),
            deferred: [Sequence(4)].into_iter().collect(),
        };
        let wm = advance(&old, &[record(4)], &BTreeSet::new(), |_| false);
        assert_eq!(wm.sequence, Sequence(5));
        assert!(wm.deferred.is_empty());
    }

    #[test]
    fn nothing_fetched_leaves_watermark_identical() {
        let old = Watermark {
            sequence: Sequence(9),
            deferred: [Sequence(3)].into_iter().collect(),
        };
        assert_eq!(advance(&old, &[], &BTreeSet::new(), |_| false), old);
    }
}
