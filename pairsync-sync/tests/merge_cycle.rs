use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use filetime::{set_file_mtime, FileTime};
use tempfile::TempDir;

use pairsync_core::{
    ChangeRecord, GlobFilter, Inode, JobName, RelPath, Sequence, Side, WorkspaceId,
};
use pairsync_sync::{
    AppliedChange, DetachedWatcher, FileStore, LogStore, MemoryStore, Merger, MergerState,
    Synchronizable, SyncError, TwoWayMerger, Watermark, Workspace,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn workspace(job: &JobName, side: Side, root: &Path, filter: GlobFilter, store: Arc<dyn LogStore>) -> Workspace {
    Workspace::open(
        WorkspaceId::for_side(job, side),
        root,
        filter,
        true,
        Duration::from_millis(500),
        store,
        Box::new(DetachedWatcher::new()),
    )
    .expect("open workspace")
}

fn merger_with(
    a: &Path,
    b: &Path,
    filter: GlobFilter,
    store: Arc<dyn LogStore>,
) -> TwoWayMerger<Workspace, Workspace> {
    let job = JobName::from("docs");
    let local = workspace(&job, Side::Local, a, filter.clone(), Arc::clone(&store));
    let remote = workspace(&job, Side::Remote, b, filter, store);
    let merger = TwoWayMerger::new(job, local, remote);
    merger.start().expect("start");
    merger
}

fn merger(a: &Path, b: &Path) -> TwoWayMerger<Workspace, Workspace> {
    merger_with(a, b, GlobFilter::allow_all(), Arc::new(MemoryStore::new()))
}

/// Relative path -> `Some(content)` for files, `None` for directories.
fn tree(root: &Path) -> BTreeMap<String, Option<String>> {
    fn visit(root: &Path, dir: &Path, out: &mut BTreeMap<String, Option<String>>) {
        for entry in fs::read_dir(dir).expect("read dir") {
            let path = entry.expect("entry").path();
            let rel = path
                .strip_prefix(root)
                .expect("under root")
                .to_string_lossy()
                .replace('\\', "/");
            if path.is_dir() {
                out.insert(rel, None);
                visit(root, &path, out);
            } else {
                out.insert(rel, Some(fs::read_to_string(&path).expect("read file")));
            }
        }
    }
    let mut out = BTreeMap::new();
    visit(root, root, &mut out);
    out
}

fn write(root: &Path, rel: &str, content: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(&path, content).expect("write file");
    path
}

fn set_age(path: &Path, ago: Duration) {
    let at = FileTime::from_system_time(SystemTime::now() - ago);
    set_file_mtime(path, at).expect("set mtime");
}

fn conflict_copies(root: &Path) -> Vec<(String, String)> {
    tree(root)
        .into_iter()
        .filter(|(name, _)| name.contains("(conflict "))
        .filter_map(|(name, content)| content.map(|c| (name, c)))
        .collect()
}

// ---------------------------------------------------------------------------
// One-sided replay
// ---------------------------------------------------------------------------

#[test]
fn new_file_reaches_the_peer_in_one_cycle() {
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    fs::create_dir(a.path().join("docs")).expect("docs");
    let merger = merger(a.path(), b.path());
    let first = merger.sync().expect("first sync");
    assert!(b.path().join("docs").is_dir());

    write(a.path(), "docs/a.txt", "hello");
    let report = merger.sync().expect("second sync");

    assert_eq!(report.applied, 1);
    assert_eq!(
        report.local_watermark.sequence.0,
        first.local_watermark.sequence.0 + 1
    );
    assert_eq!(
        report.remote_watermark.sequence.0,
        first.remote_watermark.sequence.0 + 1
    );
    assert!(report.local_watermark.deferred.is_empty());
    assert_eq!(
        fs::read_to_string(b.path().join("docs/a.txt")).expect("copied"),
        "hello"
    );
    assert_eq!(merger.state(), MergerState::Idle);
}

#[test]
fn trees_converge_after_mixed_changes_on_one_side() {
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    write(a.path(), "keep.txt", "keep");
    write(a.path(), "old/one.txt", "one");
    write(a.path(), "old/deep/two.txt", "two");
    write(a.path(), "gone.txt", "bye");
    let merger = merger(a.path(), b.path());
    merger.sync().expect("seed");
    assert_eq!(tree(a.path()), tree(b.path()));

    fs::rename(a.path().join("old"), a.path().join("new")).expect("rename dir");
    fs::remove_file(a.path().join("gone.txt")).expect("remove");
    write(a.path(), "keep.txt", "changed");
    write(a.path(), "fresh/three.txt", "three");
    merger.sync().expect("sync");

    assert_eq!(tree(a.path()), tree(b.path()));
    assert!(!b.path().join("old").exists());
    assert_eq!(
        fs::read_to_string(b.path().join("new/deep/two.txt")).expect("moved"),
        "two"
    );
}

#[test]
fn changes_flow_in_both_directions() {
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    let merger = merger(a.path(), b.path());
    write(a.path(), "from_a.txt", "a");
    write(b.path(), "from_b.txt", "b");
    merger.sync().expect("sync");
    assert_eq!(tree(a.path()), tree(b.path()));
    assert_eq!(tree(a.path()).len(), 2);
}

#[test]
fn excluded_paths_stay_put() {
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    let filter = GlobFilter::new(["*.md"], ["draft_*"]).expect("filter");
    let merger = merger_with(a.path(), b.path(), filter, Arc::new(MemoryStore::new()));
    write(a.path(), "notes.md", "n");
    write(a.path(), "draft_notes.md", "d");
    write(a.path(), "scratch.tmp", "t");
    merger.sync().expect("sync");

    assert!(b.path().join("notes.md").exists());
    assert!(!b.path().join("draft_notes.md").exists());
    assert!(!b.path().join("scratch.tmp").exists());
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[test]
fn second_sync_without_changes_is_a_noop() {
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    write(a.path(), "x/y.txt", "y");
    write(b.path(), "z.txt", "z");
    let merger = merger(a.path(), b.path());
    let first = merger.sync().expect("first");
    let last_local = merger.local().log().last_sequence().expect("seq");
    let last_remote = merger.remote().log().last_sequence().expect("seq");

    assert!(merger.plan_only().expect("plan").is_empty());
    let second = merger.sync().expect("second");
    assert!(second.is_noop());
    assert_eq!(second.applied + second.skipped, 0);
    assert_eq!(second.local_watermark, first.local_watermark);
    assert_eq!(second.remote_watermark, first.remote_watermark);
    assert_eq!(merger.local().log().last_sequence().expect("seq"), last_local);
    assert_eq!(merger.remote().log().last_sequence().expect("seq"), last_remote);
}

#[test]
fn dry_run_leaves_disk_watermarks_and_logs_alone() {
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    write(a.path(), "a.txt", "a");
    let merger = merger(a.path(), b.path());
    // Appears after start, so only a flush or rescan would log it.
    write(b.path(), "later.txt", "later");
    let local_seq = merger.local().log().last_sequence().expect("seq");
    let remote_seq = merger.remote().log().last_sequence().expect("seq");

    let plan = merger.plan_only().expect("plan");
    let ops: Vec<String> = plan.steps.iter().map(|s| s.op.to_string()).collect();
    assert_eq!(ops.len(), 2, "{ops:?}");
    assert!(ops.iter().any(|op| op.contains("remote:later.txt -> local:later.txt")));
    assert!(!b.path().join("a.txt").exists());
    assert!(!a.path().join("later.txt").exists());
    assert_eq!(merger.local().log().last_sequence().expect("seq"), local_seq);
    assert_eq!(merger.remote().log().last_sequence().expect("seq"), remote_seq);
    let wm = merger
        .local()
        .load_watermark(merger.remote().id())
        .expect("watermark");
    assert_eq!(wm, Watermark::default());

    let report = merger.sync().expect("sync");
    assert_eq!(report.applied, 2);
    assert_eq!(tree(a.path()), tree(b.path()));
}

#[test]
fn durable_logs_survive_a_restart_without_replaying() {
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    let state = TempDir::new().expect("state");
    write(a.path(), "a.txt", "a");
    {
        let store: Arc<dyn LogStore> = Arc::new(FileStore::open(state.path()).expect("store"));
        let merger = merger_with(a.path(), b.path(), GlobFilter::allow_all(), store);
        merger.sync().expect("sync");
        merger.stop();
    }

    write(a.path(), "while_down.txt", "later");
    let store: Arc<dyn LogStore> = Arc::new(FileStore::open(state.path()).expect("store"));
    let merger = merger_with(a.path(), b.path(), GlobFilter::allow_all(), store);
    let report = merger.sync().expect("sync after restart");
    assert_eq!(report.applied, 1);
    assert_eq!(tree(a.path()), tree(b.path()));
    assert!(merger.sync().expect("again").is_noop());
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

fn contested(local_age: Duration, remote_age: Duration) -> (TempDir, TempDir, pairsync_sync::SyncReport) {
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    let base = write(a.path(), "report.txt", "base");
    set_age(&base, Duration::from_secs(7200));
    let merger = merger(a.path(), b.path());
    merger.sync().expect("seed");

    let local = write(a.path(), "report.txt", "local edit");
    set_age(&local, local_age);
    let remote = write(b.path(), "report.txt", "remote edit");
    set_age(&remote, remote_age);
    let report = merger.sync().expect("contested sync");
    (a, b, report)
}

#[test]
fn later_remote_write_wins_and_local_is_preserved() {
    let (a, b, report) = contested(Duration::from_secs(600), Duration::from_secs(60));

    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].winner, Side::Remote);
    for root in [a.path(), b.path()] {
        assert_eq!(
            fs::read_to_string(root.join("report.txt")).expect("winner"),
            "remote edit"
        );
        let copies = conflict_copies(root);
        assert_eq!(copies.len(), 1, "one preserved loser in {}", root.display());
        assert!(copies[0].0.starts_with("report (conflict local "));
        assert!(copies[0].0.ends_with(").txt"));
        assert_eq!(copies[0].1, "local edit");
    }
    assert_eq!(tree(a.path()), tree(b.path()));
}

#[test]
fn later_local_write_wins_and_remote_is_preserved() {
    let (a, b, report) = contested(Duration::from_secs(60), Duration::from_secs(600));

    assert_eq!(report.conflicts[0].winner, Side::Local);
    for root in [a.path(), b.path()] {
        assert_eq!(
            fs::read_to_string(root.join("report.txt")).expect("winner"),
            "local edit"
        );
        let copies = conflict_copies(root);
        assert_eq!(copies.len(), 1);
        assert!(copies[0].0.starts_with("report (conflict remote "));
        assert_eq!(copies[0].1, "remote edit");
    }
}

#[test]
fn delete_against_newer_edit_keeps_the_edit() {
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    let base = write(a.path(), "plan.md", "base");
    set_age(&base, Duration::from_secs(7200));
    let merger = merger(a.path(), b.path());
    merger.sync().expect("seed");

    fs::remove_file(a.path().join("plan.md")).expect("delete on a");
    // Edit stamped in the future so it beats the deletion time.
    let edited = write(b.path(), "plan.md", "edited");
    set_file_mtime(
        &edited,
        FileTime::from_system_time(SystemTime::now() + Duration::from_secs(3600)),
    )
    .expect("mtime");
    merger.sync().expect("sync");

    for root in [a.path(), b.path()] {
        assert_eq!(fs::read_to_string(root.join("plan.md")).expect("kept"), "edited");
    }
}

// ---------------------------------------------------------------------------
// Partial failure
// ---------------------------------------------------------------------------

/// Writes a competing file into the remote tree after changes are fetched
/// and before the plan runs.
struct Meddling {
    inner: Workspace,
    armed: AtomicBool,
}

impl Synchronizable for Meddling {
    fn id(&self) -> &WorkspaceId {
        self.inner.id()
    }
    fn root(&self) -> &Path {
        self.inner.root()
    }
    fn assert_ready(&self) -> Result<(), SyncError> {
        self.inner.assert_ready()
    }
    fn get_changes(&self, watermark: &Watermark) -> Result<Vec<ChangeRecord>, SyncError> {
        self.inner.get_changes(watermark)
    }
    fn preview_changes(
        &self,
        watermark: &Watermark,
    ) -> Result<(Vec<ChangeRecord>, BTreeMap<RelPath, Inode>), SyncError> {
        self.inner.preview_changes(watermark)
    }
    fn known(&self) -> Result<BTreeMap<RelPath, Inode>, SyncError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            write(self.inner.root(), "b.txt", "intruder");
        }
        self.inner.known()
    }
    fn probe(&self, path: &RelPath) -> Result<Option<Inode>, SyncError> {
        self.inner.probe(path)
    }
    fn note_applied(&self, change: AppliedChange) -> Result<Option<ChangeRecord>, SyncError> {
        self.inner.note_applied(change)
    }
    fn load_watermark(&self, peer: &WorkspaceId) -> Result<Watermark, SyncError> {
        self.inner.load_watermark(peer)
    }
    fn save_watermark(&self, peer: &WorkspaceId, watermark: &Watermark) -> Result<(), SyncError> {
        self.inner.save_watermark(peer, watermark)
    }
    fn degraded(&self) -> bool {
        self.inner.degraded()
    }
    fn resume(&self) -> bool {
        self.inner.resume()
    }
    fn start(&self) -> Result<(), SyncError> {
        self.inner.start()
    }
    fn stop(&self) {
        self.inner.stop()
    }
}

#[test]
fn failed_step_defers_only_its_own_records() {
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    let job = JobName::from("docs");
    let store: Arc<dyn LogStore> = Arc::new(MemoryStore::new());
    let local = workspace(&job, Side::Local, a.path(), GlobFilter::allow_all(), Arc::clone(&store));
    let remote = Meddling {
        inner: workspace(&job, Side::Remote, b.path(), GlobFilter::allow_all(), store),
        armed: AtomicBool::new(true),
    };
    let merger = TwoWayMerger::new(job, local, remote);
    merger.start().expect("start");

    let a_file = write(a.path(), "a.txt", "a");
    let b_file = write(a.path(), "b.txt", "ours");
    set_age(&a_file, Duration::from_secs(3600));
    set_age(&b_file, Duration::from_secs(3600));

    let report = merger.sync().expect("partial sync");
    assert_eq!(report.applied, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].path.as_str(), "b.txt");
    assert_eq!(report.local_watermark.sequence, Sequence(2));
    assert_eq!(report.local_watermark.deferred.len(), 1);
    assert_eq!(merger.state(), MergerState::Degraded);
    assert_eq!(fs::read_to_string(b.path().join("a.txt")).expect("a"), "a");
    assert_eq!(fs::read_to_string(b.path().join("b.txt")).expect("b"), "intruder");

    // The deferred record comes back and now contests the intruder, which is
    // newer and wins; ours survives as a conflict copy.
    let retry = merger.sync().expect("retry");
    assert!(retry.failed.is_empty());
    assert!(retry.local_watermark.deferred.is_empty());
    assert_eq!(retry.conflicts.len(), 1);
    assert_eq!(merger.state(), MergerState::Idle);
    for root in [a.path(), b.path()] {
        assert_eq!(fs::read_to_string(root.join("b.txt")).expect("b"), "intruder");
        let copies = conflict_copies(root);
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].1, "ours");
    }
}

#[test]
fn vanished_root_abandons_the_cycle() {
    let a = TempDir::new().expect("a");
    let outer = TempDir::new().expect("outer");
    let b = outer.path().join("peer");
    fs::create_dir(&b).expect("peer");
    write(a.path(), "a.txt", "a");
    let merger = merger(a.path(), &b);
    fs::remove_dir(&b).expect("remove peer root");

    let err = merger.sync().unwrap_err();
    assert!(matches!(err, SyncError::WatcherDown { .. }));
    assert_eq!(merger.state(), MergerState::Degraded);
    let wm = merger
        .local()
        .load_watermark(merger.remote().id())
        .expect("watermark");
    assert_eq!(wm, Watermark::default());
}
