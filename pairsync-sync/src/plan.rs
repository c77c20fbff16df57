//! Merge planning: two change slices in, an ordered list of guarded
//! filesystem operations out.
//!
//! Planning never touches disk. It works on each side's known tree (the
//! state its change log describes) and only emits an operation when the two
//! trees disagree at a touched path, so replaying an already converged slice
//! produces an empty plan.
//!
//! Every operation carries a [`Guard`] describing what the target must look
//! like when the operation runs. A guard mismatch means the target changed
//! after planning; the operation fails and its records are retried.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pairsync_core::{ChangeOp, ChangeRecord, Inode, RelPath, Sequence, Side};

use crate::change_log::rebase_subtree;
use crate::conflict::unique_conflict_name;

// ---------------------------------------------------------------------------
// Plan types
// ---------------------------------------------------------------------------

/// Expected state of an operation's target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    Absent,
    /// A file with this fingerprint.
    Content(String),
    Directory,
}

impl Guard {
    fn of(inode: &Inode) -> Guard {
        if inode.is_dir() {
            Guard::Directory
        } else {
            Guard::Content(inode.fingerprint.clone())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlannedOp {
    /// Move a conflict loser aside on its own side.
    Preserve {
        side: Side,
        path: RelPath,
        to: RelPath,
        guard: Guard,
    },
    Rename {
        side: Side,
        from: RelPath,
        to: RelPath,
        guard: Guard,
    },
    Remove {
        side: Side,
        path: RelPath,
        guard: Guard,
    },
    EnsureDir {
        side: Side,
        path: RelPath,
    },
    /// Copy `src` on the other side to `dst` on side `to`. The source must
    /// still have `fingerprint`.
    Copy {
        to: Side,
        src: RelPath,
        dst: RelPath,
        fingerprint: String,
        guard: Guard,
    },
}

impl PlannedOp {
    /// Side whose filesystem this operation mutates.
    pub fn target(&self) -> Side {
        match self {
            PlannedOp::Preserve { side, .. }
            | PlannedOp::Rename { side, .. }
            | PlannedOp::Remove { side, .. }
            | PlannedOp::EnsureDir { side, .. } => *side,
            PlannedOp::Copy { to, .. } => *to,
        }
    }

    /// Path the operation is reported under.
    pub fn path(&self) -> &RelPath {
        match self {
            PlannedOp::Preserve { path, .. }
            | PlannedOp::Remove { path, .. }
            | PlannedOp::EnsureDir { path, .. } => path,
            PlannedOp::Rename { to, .. } => to,
            PlannedOp::Copy { dst, .. } => dst,
        }
    }

    fn rank(&self) -> (u8, i64) {
        let depth = self.path().depth() as i64;
        match self {
            PlannedOp::Preserve { .. } => (0, 0),
            PlannedOp::Rename { .. } => (1, 0),
            PlannedOp::Remove { .. } => (2, -depth),
            PlannedOp::EnsureDir { .. } => (3, depth),
            PlannedOp::Copy { .. } => (4, depth),
        }
    }
}

impl fmt::Display for PlannedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedOp::Preserve { side, path, to, .. } => {
                write!(f, "preserve {side}:{path} as {to}")
            }
            PlannedOp::Rename { side, from, to, .. } => write!(f, "rename {side}:{from} -> {to}"),
            PlannedOp::Remove { side, path, .. } => write!(f, "remove {side}:{path}"),
            PlannedOp::EnsureDir { side, path } => write!(f, "mkdir {side}:{path}"),
            PlannedOp::Copy { to, src, dst, .. } => {
                write!(f, "copy {}:{src} -> {to}:{dst}", to.other())
            }
        }
    }
}

/// One operation plus the change records it settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(flatten)]
    pub op: PlannedOp,
    pub consumes: Vec<(Side, Sequence)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// The later modification time won.
    Newer,
    /// Identical times; the local side wins.
    Tie,
    /// A directory always beats a file or a deletion.
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: RelPath,
    pub winner: Side,
    pub reason: ConflictReason,
    /// Where the losing file was kept, on both sides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserved_as: Option<RelPath>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    pub steps: Vec<PlanStep>,
    pub conflicts: Vec<Conflict>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// One side's input to planning.
pub struct SideView<'a> {
    /// Unreconciled records, any order.
    pub changes: &'a [ChangeRecord],
    /// Current known tree of that side.
    pub tree: &'a BTreeMap<RelPath, Inode>,
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Touch {
    seqs: Vec<Sequence>,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Move {
    sequence: Sequence,
    from: RelPath,
    to: RelPath,
    subject: Inode,
}

struct Endpoint {
    touched: BTreeMap<RelPath, Touch>,
    moves: Vec<Move>,
    /// Tree as it will be once the steps planned so far have run.
    view: BTreeMap<RelPath, Inode>,
}

impl Endpoint {
    fn new(input: &SideView<'_>) -> Self {
        let mut records: Vec<&ChangeRecord> = input.changes.iter().collect();
        records.sort_by_key(|r| r.sequence);
        let mut endpoint = Endpoint {
            touched: BTreeMap::new(),
            moves: Vec::new(),
            view: input.tree.clone(),
        };
        for record in records {
            endpoint.touch(&record.subject.path, record.sequence, record.subject.mod_time);
            if record.op == ChangeOp::Moved {
                if let Some(from) = &record.previous_path {
                    endpoint.touch(from, record.sequence, record.subject.mod_time);
                    endpoint.moves.push(Move {
                        sequence: record.sequence,
                        from: from.clone(),
                        to: record.subject.path.clone(),
                        subject: record.subject.clone(),
                    });
                }
            }
        }
        endpoint
    }

    fn touch(&mut self, path: &RelPath, sequence: Sequence, at: DateTime<Utc>) {
        let touch = self.touched.entry(path.clone()).or_insert(Touch {
            seqs: Vec::new(),
            at,
        });
        if !touch.seqs.contains(&sequence) {
            touch.seqs.push(sequence);
        }
        touch.at = touch.at.max(at);
    }

    /// Forget `sequence` at `path`; the entry goes once nothing else touched it.
    fn settle(&mut self, path: &RelPath, sequence: Sequence) {
        if let Some(touch) = self.touched.get_mut(path) {
            touch.seqs.retain(|s| *s != sequence);
            if touch.seqs.is_empty() {
                self.touched.remove(path);
            }
        }
    }
}

struct Planner {
    local: Endpoint,
    remote: Endpoint,
    steps: Vec<PlanStep>,
    conflicts: Vec<Conflict>,
    reserved: BTreeSet<RelPath>,
}

/// Reconcile two slices into a plan.
pub fn build(local: SideView<'_>, remote: SideView<'_>) -> MergePlan {
    let mut planner = Planner {
        local: Endpoint::new(&local),
        remote: Endpoint::new(&remote),
        steps: Vec::new(),
        conflicts: Vec::new(),
        reserved: BTreeSet::new(),
    };
    planner.plan_moves(Side::Local);
    planner.plan_moves(Side::Remote);
    planner.plan_paths();
    planner.keep_occupied_dirs();

    let mut steps = planner.steps;
    steps.sort_by_key(|step| step.op.rank());
    MergePlan {
        steps,
        conflicts: planner.conflicts,
    }
}

impl Planner {
    fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    fn endpoint_mut(&mut self, side: Side) -> &mut Endpoint {
        match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        }
    }

    fn push(&mut self, op: PlannedOp, consumes: &[(Side, Sequence)]) {
        tracing::trace!(%op, "planned");
        self.steps.push(PlanStep {
            op,
            consumes: consumes.to_vec(),
        });
    }

    /// Replay moves as renames when the other side still holds the moved
    /// entry untouched; otherwise fall back to per-path replay.
    fn plan_moves(&mut self, side: Side) {
        let other = side.other();
        let moves = std::mem::take(&mut self.endpoint_mut(side).moves);
        for m in moves {
            let dir = m.subject.is_dir();
            let src = self.endpoint(side);
            let dst = self.endpoint(other);

            let untouched = !dst
                .touched
                .keys()
                .any(|p| p.is_within(&m.from) || p.is_within(&m.to));
            let still_moved = src
                .view
                .get(&m.to)
                .is_some_and(|i| i.kind == m.subject.kind)
                && !src.view.contains_key(&m.from);
            let target_matches = match dst.view.get(&m.from) {
                Some(i) if dir => i.is_dir(),
                Some(i) => !i.is_dir() && i.fingerprint == m.subject.fingerprint,
                None => false,
            } && !dst.view.contains_key(&m.to);

            if untouched && still_moved && target_matches {
                let guard = Guard::of(&m.subject);
                self.push(
                    PlannedOp::Rename {
                        side: other,
                        from: m.from.clone(),
                        to: m.to.clone(),
                        guard,
                    },
                    &[(side, m.sequence)],
                );
                rebase_subtree(&mut self.endpoint_mut(other).view, &m.from, &m.to);
                let src = self.endpoint_mut(side);
                src.settle(&m.from, m.sequence);
                src.settle(&m.to, m.sequence);
            } else if dir {
                // Replay the directory move entry by entry.
                let mut paths: Vec<RelPath> = dst
                    .view
                    .keys()
                    .filter(|p| p.is_within(&m.from))
                    .cloned()
                    .collect();
                paths.extend(src.view.keys().filter(|p| p.is_within(&m.to)).cloned());
                let at = m.subject.mod_time;
                let src = self.endpoint_mut(side);
                for path in paths {
                    src.touch(&path, m.sequence, at);
                }
            }
        }
    }

    fn plan_paths(&mut self) {
        let paths: BTreeSet<RelPath> = self
            .local
            .touched
            .keys()
            .chain(self.remote.touched.keys())
            .cloned()
            .collect();

        for path in paths {
            let local_touch = self.local.touched.get(&path).cloned();
            let remote_touch = self.remote.touched.get(&path).cloned();
            let local_state = self.local.view.get(&path).cloned();
            let remote_state = self.remote.view.get(&path).cloned();

            let mut consumes = Vec::new();
            if let Some(t) = &local_touch {
                consumes.extend(t.seqs.iter().map(|s| (Side::Local, *s)));
            }
            if let Some(t) = &remote_touch {
                consumes.extend(t.seqs.iter().map(|s| (Side::Remote, *s)));
            }

            if converged(local_state.as_ref(), remote_state.as_ref()) {
                continue;
            }

            let (winner, reason) = match (&local_touch, &remote_touch) {
                (Some(_), None) => (Side::Local, None),
                (None, Some(_)) => (Side::Remote, None),
                (Some(l), Some(r)) => {
                    let (winner, reason) = resolve(
                        local_state.as_ref(),
                        l.at,
                        remote_state.as_ref(),
                        r.at,
                    );
                    (winner, Some(reason))
                }
                (None, None) => continue,
            };
            let (want, lost) = match winner {
                Side::Local => (local_state, remote_state),
                Side::Remote => (remote_state, local_state),
            };

            if let Some(reason) = reason {
                let preserved_as = match &lost {
                    Some(loser) if !loser.is_dir() => {
                        Some(self.preserve(winner.other(), &path, loser, &consumes))
                    }
                    _ => None,
                };
                tracing::info!(
                    path = %path,
                    winner = %winner,
                    reason = ?reason,
                    preserved_as = preserved_as.as_ref().map(|p| p.as_str()),
                    "conflict resolved",
                );
                self.conflicts.push(Conflict {
                    path: path.clone(),
                    winner,
                    reason,
                    preserved_as,
                });
            }

            self.converge(winner.other(), &path, want.as_ref(), &consumes);
        }
    }

    /// Move the loser at `path` aside and copy it to the winner too.
    fn preserve(
        &mut self,
        loser: Side,
        path: &RelPath,
        lost: &Inode,
        consumes: &[(Side, Sequence)],
    ) -> RelPath {
        let kept = unique_conflict_name(path, loser, lost.mod_time, |candidate| {
            self.reserved.contains(candidate)
                || self.local.view.contains_key(candidate)
                || self.remote.view.contains_key(candidate)
        });
        self.reserved.insert(kept.clone());
        self.push(
            PlannedOp::Preserve {
                side: loser,
                path: path.clone(),
                to: kept.clone(),
                guard: Guard::of(lost),
            },
            consumes,
        );
        self.push(
            PlannedOp::Copy {
                to: loser.other(),
                src: kept.clone(),
                dst: kept.clone(),
                fingerprint: lost.fingerprint.clone(),
                guard: Guard::Absent,
            },
            consumes,
        );
        let moved = lost.relocated(kept.clone());
        let loser_view = &mut self.endpoint_mut(loser).view;
        loser_view.remove(path);
        loser_view.insert(kept.clone(), moved.clone());
        self.endpoint_mut(loser.other())
            .view
            .insert(kept.clone(), moved);
        kept
    }

    /// Make `target` hold `want` at `path`.
    fn converge(
        &mut self,
        target: Side,
        path: &RelPath,
        want: Option<&Inode>,
        consumes: &[(Side, Sequence)],
    ) {
        let current = self.endpoint(target).view.get(path).cloned();
        match (want, current) {
            (None, None) => {}
            (None, Some(cur)) => {
                self.push(
                    PlannedOp::Remove {
                        side: target,
                        path: path.clone(),
                        guard: Guard::of(&cur),
                    },
                    consumes,
                );
                self.endpoint_mut(target).view.remove(path);
            }
            (Some(w), Some(cur)) if w.kind == cur.kind && w.same_content(&cur) => {}
            (Some(w), current) => {
                let mut guard = Guard::Absent;
                if let Some(cur) = &current {
                    if cur.kind != w.kind {
                        self.push(
                            PlannedOp::Remove {
                                side: target,
                                path: path.clone(),
                                guard: Guard::of(cur),
                            },
                            consumes,
                        );
                    } else {
                        guard = Guard::of(cur);
                    }
                }
                let op = if w.is_dir() {
                    PlannedOp::EnsureDir {
                        side: target,
                        path: path.clone(),
                    }
                } else {
                    PlannedOp::Copy {
                        to: target,
                        src: path.clone(),
                        dst: path.clone(),
                        fingerprint: w.fingerprint.clone(),
                        guard,
                    }
                };
                self.push(op, consumes);
                self.endpoint_mut(target).view.insert(path.clone(), w.clone());
            }
        }
    }

    /// A directory scheduled for removal that will still hold entries is
    /// recreated on the other side instead.
    fn keep_occupied_dirs(&mut self) {
        let mut steps = std::mem::take(&mut self.steps);
        for step in &mut steps {
            let PlannedOp::Remove {
                side,
                path,
                guard: Guard::Directory,
            } = &step.op
            else {
                continue;
            };
            let occupied = self
                .endpoint(*side)
                .view
                .keys()
                .any(|p| p != path && p.is_within(path));
            if occupied {
                tracing::debug!(side = %side, path = %path, "directory still occupied; keeping it");
                let keep = PlannedOp::EnsureDir {
                    side: side.other(),
                    path: path.clone(),
                };
                step.op = keep;
            }
        }
        self.steps = steps;
    }
}

fn converged(local: Option<&Inode>, remote: Option<&Inode>) -> bool {
    match (local, remote) {
        (None, None) => true,
        (Some(l), Some(r)) => l.kind == r.kind && l.same_content(r),
        _ => false,
    }
}

/// Pick the winner of a path both sides touched.
fn resolve(
    local: Option<&Inode>,
    local_at: DateTime<Utc>,
    remote: Option<&Inode>,
    remote_at: DateTime<Utc>,
) -> (Side, ConflictReason) {
    match (local, remote) {
        (Some(l), Some(r)) if l.kind != r.kind => {
            if l.is_dir() {
                (Side::Local, ConflictReason::Directory)
            } else {
                (Side::Remote, ConflictReason::Directory)
            }
        }
        (Some(l), None) if l.is_dir() => (Side::Local, ConflictReason::Directory),
        (None, Some(r)) if r.is_dir() => (Side::Remote, ConflictReason::Directory),
        _ => {
            let l = local.map_or(local_at, |i| i.mod_time);
            let r = remote.map_or(remote_at, |i| i.mod_time);
            match r.cmp(&l) {
                std::cmp::Ordering::Greater => (Side::Remote, ConflictReason::Newer),
                std::cmp::Ordering::Less => (Side::Local, ConflictReason::Newer),
                std::cmp::Ordering::Equal => (Side::Local, ConflictReason::Tie),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn file(path: &str, fp: &str, t: i64) -> Inode {
        Inode::file(rel(path), fp, at(t), fp.len() as u64)
    }

    fn dir(path: &str) -> Inode {
        Inode::directory(rel(path), at(0))
    }

    fn rec(seq: u64, op: ChangeOp, subject: Inode, prev: Option<&str>) -> ChangeRecord {
        ChangeRecord {
            sequence: Sequence(seq),
            op,
            subject,
            previous_path: prev.map(rel),
        }
    }

    fn tree(entries: &[Inode]) -> BTreeMap<RelPath, Inode> {
        entries.iter().map(|i| (i.path.clone(), i.clone())).collect()
    }

    fn ops(plan: &MergePlan) -> Vec<String> {
        plan.steps.iter().map(|s| s.op.to_string()).collect()
    }

    #[test]
    fn one_sided_create_is_copied_with_absent_guard() {
        let lt = tree(&[dir("docs"), file("docs/a.txt", "aa", 1)]);
        let rt = tree(&[dir("docs")]);
        let lc = vec![rec(2, ChangeOp::Created, file("docs/a.txt", "aa", 1), None)];
        let plan = build(
            SideView { changes: &lc, tree: &lt },
            SideView { changes: &[], tree: &rt },
        );
        assert_eq!(ops(&plan), vec!["copy local:docs/a.txt -> remote:docs/a.txt"]);
        assert_eq!(plan.steps[0].consumes, vec![(Side::Local, Sequence(2))]);
        assert!(matches!(
            plan.steps[0].op,
            PlannedOp::Copy { guard: Guard::Absent, .. }
        ));
    }

    #[test]
    fn already_converged_paths_plan_nothing() {
        let both = tree(&[file("a.txt", "aa", 1)]);
        let lc = vec![rec(1, ChangeOp::Created, file("a.txt", "aa", 1), None)];
        let rc = vec![rec(1, ChangeOp::Created, file("a.txt", "aa", 2), None)];
        let plan = build(
            SideView { changes: &lc, tree: &both },
            SideView { changes: &rc, tree: &both },
        );
        assert!(plan.is_empty());
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn later_modification_wins_and_loser_is_kept() {
        let lt = tree(&[file("a.txt", "local", 10)]);
        let rt = tree(&[file("a.txt", "remote", 20)]);
        let lc = vec![rec(4, ChangeOp::Modified, file("a.txt", "local", 10), None)];
        let rc = vec![rec(9, ChangeOp::Modified, file("a.txt", "remote", 20), None)];

        // Swapping which slice arrives first cannot change the outcome.
        for _ in 0..2 {
            let plan = build(
                SideView { changes: &lc, tree: &lt },
                SideView { changes: &rc, tree: &rt },
            );
            assert_eq!(plan.conflicts.len(), 1);
            assert_eq!(plan.conflicts[0].winner, Side::Remote);
            let kept = plan.conflicts[0].preserved_as.clone().unwrap();
            assert!(kept.as_str().starts_with("a (conflict local "));
            assert_eq!(
                ops(&plan),
                vec![
                    format!("preserve local:a.txt as {kept}"),
                    format!("copy local:{kept} -> remote:{kept}"),
                    "copy remote:a.txt -> local:a.txt".to_string(),
                ]
            );
        }
    }

    #[test]
    fn exact_tie_goes_to_local() {
        let lt = tree(&[file("a.txt", "local", 5)]);
        let rt = tree(&[file("a.txt", "remote", 5)]);
        let lc = vec![rec(1, ChangeOp::Modified, file("a.txt", "local", 5), None)];
        let rc = vec![rec(1, ChangeOp::Modified, file("a.txt", "remote", 5), None)];
        let plan = build(
            SideView { changes: &lc, tree: &lt },
            SideView { changes: &rc, tree: &rt },
        );
        assert_eq!(plan.conflicts[0].winner, Side::Local);
        assert_eq!(plan.conflicts[0].reason, ConflictReason::Tie);
    }

    #[test]
    fn winning_delete_still_keeps_the_losing_file() {
        let lt = tree(&[]);
        let rt = tree(&[file("a.txt", "edited", 10)]);
        let deleted = Inode {
            mod_time: at(30),
            ..file("a.txt", "orig", 1)
        };
        let lc = vec![rec(3, ChangeOp::Deleted, deleted, None)];
        let rc = vec![rec(2, ChangeOp::Modified, file("a.txt", "edited", 10), None)];
        let plan = build(
            SideView { changes: &lc, tree: &lt },
            SideView { changes: &rc, tree: &rt },
        );
        assert_eq!(plan.conflicts[0].winner, Side::Local);
        let kept = plan.conflicts[0].preserved_as.clone().unwrap();
        assert_eq!(
            ops(&plan),
            vec![
                format!("preserve remote:a.txt as {kept}"),
                format!("copy remote:{kept} -> local:{kept}"),
            ]
        );
    }

    #[test]
    fn directory_beats_file() {
        let lt = tree(&[file("x", "f", 50)]);
        let rt = tree(&[dir("x")]);
        let lc = vec![rec(1, ChangeOp::Created, file("x", "f", 50), None)];
        let rc = vec![rec(1, ChangeOp::Created, dir("x"), None)];
        let plan = build(
            SideView { changes: &lc, tree: &lt },
            SideView { changes: &rc, tree: &rt },
        );
        assert_eq!(plan.conflicts[0].winner, Side::Remote);
        assert_eq!(plan.conflicts[0].reason, ConflictReason::Directory);
        let kept = plan.conflicts[0].preserved_as.clone().unwrap();
        assert_eq!(
            ops(&plan),
            vec![
                format!("preserve local:x as {kept}"),
                "mkdir local:x".to_string(),
                format!("copy local:{kept} -> remote:{kept}"),
            ]
        );
    }

    #[test]
    fn untouched_directory_move_becomes_one_rename() {
        let lt = tree(&[dir("notes"), file("notes/a.txt", "aa", 1)]);
        let rt = tree(&[dir("docs"), file("docs/a.txt", "aa", 1)]);
        let lc = vec![rec(7, ChangeOp::Moved, dir("notes"), Some("docs"))];
        let plan = build(
            SideView { changes: &lc, tree: &lt },
            SideView { changes: &[], tree: &rt },
        );
        assert_eq!(ops(&plan), vec!["rename remote:docs -> notes"]);
        assert_eq!(plan.steps[0].consumes, vec![(Side::Local, Sequence(7))]);
    }

    #[test]
    fn contested_directory_move_is_replayed_entry_by_entry() {
        let lt = tree(&[dir("notes"), file("notes/a.txt", "aa", 1)]);
        let rt = tree(&[dir("docs"), file("docs/a.txt", "aa", 1), file("docs/b.txt", "bb", 9)]);
        let lc = vec![rec(7, ChangeOp::Moved, dir("notes"), Some("docs"))];
        let rc = vec![rec(3, ChangeOp::Created, file("docs/b.txt", "bb", 9), None)];
        let plan = build(
            SideView { changes: &lc, tree: &lt },
            SideView { changes: &rc, tree: &rt },
        );
        let ops = ops(&plan);
        assert!(ops.contains(&"remove remote:docs/a.txt".to_string()));
        assert!(ops.contains(&"mkdir remote:notes".to_string()));
        assert!(ops.contains(&"copy local:notes/a.txt -> remote:notes/a.txt".to_string()));
        // docs/b.txt is newer on the remote side and survives, so docs stays.
        assert!(ops.contains(&"copy remote:docs/b.txt -> local:docs/b.txt".to_string()));
        assert!(!ops.contains(&"remove remote:docs".to_string()));
        assert!(ops.contains(&"mkdir local:docs".to_string()));
    }

    #[test]
    fn removals_run_deepest_first() {
        let lt = tree(&[]);
        let rt = tree(&[dir("d"), dir("d/e"), file("d/e/f", "ff", 1)]);
        let lc = vec![
            rec(1, ChangeOp::Deleted, file("d/e/f", "ff", 1), None),
            rec(2, ChangeOp::Deleted, dir("d/e"), None),
            rec(3, ChangeOp::Deleted, dir("d"), None),
        ];
        let plan = build(
            SideView { changes: &lc, tree: &lt },
            SideView { changes: &[], tree: &rt },
        );
        assert_eq!(
            ops(&plan),
            vec!["remove remote:d/e/f", "remove remote:d/e", "remove remote:d"]
        );
    }
}
