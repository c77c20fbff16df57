use std::fs;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use pairsync_core::{Config, FilterConfig, JobConfig, JobName, StorageKind};
use pairsync_daemon::Scheduler;
use pairsync_sync::MergerState;

fn config(a: &Path, b: &Path) -> Config {
    let mut config = Config::default();
    config.jobs.insert(
        "docs".into(),
        JobConfig {
            directory: a.to_path_buf(),
            peer_directory: b.to_path_buf(),
            filters: FilterConfig {
                include: Vec::new(),
                exclude: vec!["*.swp".into()],
            },
            sync_interval_seconds: 0.2,
            recursive: true,
            storage: StorageKind::File,
            move_window_ms: 100,
        },
    );
    config
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

fn read(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ticking_job_keeps_both_trees_in_step() {
    let home = TempDir::new().expect("home");
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");

    let (mut scheduler, rejected) = Scheduler::from_config(&config(a.path(), b.path()), home.path());
    assert!(rejected.is_empty());
    assert!(scheduler.start().await.is_empty());

    fs::create_dir(a.path().join("docs")).expect("mkdir");
    fs::write(a.path().join("docs/a.txt"), "from a").expect("write a");
    fs::write(a.path().join("docs/.a.txt.swp"), "swap").expect("write swap");
    eventually("a -> b", || {
        read(&b.path().join("docs/a.txt")).as_deref() == Some("from a")
    })
    .await;

    fs::write(b.path().join("docs/b.txt"), "from b").expect("write b");
    eventually("b -> a", || {
        read(&a.path().join("docs/b.txt")).as_deref() == Some("from b")
    })
    .await;

    fs::remove_file(a.path().join("docs/a.txt")).expect("delete");
    eventually("delete reaches b", || !b.path().join("docs/a.txt").exists()).await;

    assert!(!b.path().join("docs/.a.txt.swp").exists());
    let status = scheduler.status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].name, JobName::from("docs"));
    assert_ne!(status[0].state, MergerState::Degraded);
    assert!(status[0].cycles > 0);

    scheduler.stop().await;
    assert!(home
        .path()
        .join(".pairsync/state/docs.local/changes.jsonl")
        .exists());
}
