//! The set of configured jobs and their shared lifecycle.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;

use pairsync_core::{Config, JobName, Side, StorageKind, ValidatedJob, WorkspaceId};
use pairsync_sync::{
    DetachedWatcher, FileStore, LogStore, MemoryStore, SyncReport, TwoWayMerger, Watcher,
    Workspace,
};

use crate::error::DaemonError;
use crate::job::{Job, JobHandle, JobStatus, TickOutcome};
use crate::watcher::NotifyWatcher;

/// How a workspace learns about changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    /// OS notifications through `notify`.
    Live,
    /// No watcher; every cycle rescans. Used by one-shot runs.
    Detached,
}

pub type PairMerger = TwoWayMerger<Workspace, Workspace>;

/// Build the merger for a validated job, opening both change logs.
pub fn build_merger(
    job: &ValidatedJob,
    state_dir: &Path,
    mode: WatchMode,
) -> Result<PairMerger, DaemonError> {
    let store: Arc<dyn LogStore> = match job.storage {
        StorageKind::File => Arc::new(FileStore::open(state_dir)?),
        StorageKind::Memory => {
            tracing::warn!(
                job = %job.name,
                "change log is in memory only; history is lost on restart",
            );
            Arc::new(MemoryStore::new())
        }
    };
    let open = |side: Side| -> Result<Workspace, DaemonError> {
        let root = match side {
            Side::Local => &job.directory,
            Side::Remote => &job.peer_directory,
        };
        let watcher: Box<dyn Watcher> = match mode {
            WatchMode::Live => Box::new(NotifyWatcher::new()?),
            WatchMode::Detached => Box::new(DetachedWatcher::new()),
        };
        Ok(Workspace::open(
            WorkspaceId::for_side(&job.name, side),
            root,
            job.filter.clone(),
            job.recursive,
            job.move_window,
            Arc::clone(&store),
            watcher,
        )?)
    };
    Ok(TwoWayMerger::new(
        job.name.clone(),
        open(Side::Local)?,
        open(Side::Remote)?,
    ))
}

pub struct Scheduler {
    jobs: BTreeMap<JobName, Job>,
    shutdown: broadcast::Sender<()>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            jobs: BTreeMap::new(),
            shutdown,
        }
    }

    /// One job per valid configured pair. Invalid jobs are returned with
    /// their errors and never started; the rest proceed.
    pub fn from_config(config: &Config, home: &Path) -> (Scheduler, Vec<(JobName, DaemonError)>) {
        let state_dir = config.state_dir_at(home);
        let mut scheduler = Scheduler::new();
        let mut rejected = Vec::new();
        for (name, validated) in config.validate_jobs() {
            let built = validated
                .map_err(DaemonError::from)
                .and_then(|job| {
                    let merger = build_merger(&job, &state_dir, WatchMode::Live)?;
                    Ok(Job::new(job.name.clone(), Arc::new(merger), job.interval))
                });
            match built {
                Ok(job) => scheduler.add(job),
                Err(err) => {
                    tracing::error!(job = %name, error = %err, "job rejected");
                    rejected.push((name, err));
                }
            }
        }
        (scheduler, rejected)
    }

    pub fn add(&mut self, job: Job) {
        self.jobs.insert(job.name().clone(), job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Start every job. A job that cannot start is dropped and reported;
    /// its siblings keep running.
    pub async fn start(&mut self) -> Vec<(JobName, DaemonError)> {
        let mut failed = Vec::new();
        let names: Vec<JobName> = self.jobs.keys().cloned().collect();
        for name in names {
            let Some(job) = self.jobs.get_mut(&name) else {
                continue;
            };
            if let Err(err) = job.start(self.shutdown.subscribe()).await {
                tracing::error!(job = %name, error = %err, "job failed to start");
                if let Some(job) = self.jobs.remove(&name) {
                    job.stop().await;
                }
                failed.push((name, err));
            }
        }
        tracing::info!(jobs = self.jobs.len(), "scheduler started");
        failed
    }

    /// Stop ticking everywhere, then wait for each job's in-flight cycle
    /// before tearing its watchers down.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(());
        let jobs = std::mem::take(&mut self.jobs);
        let stopping: Vec<_> = jobs.into_values().map(|job| tokio::spawn(job.stop())).collect();
        for handle in stopping {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "job stop join failed");
            }
        }
        tracing::info!("scheduler stopped");
    }

    pub fn status(&self) -> Vec<JobStatus> {
        self.jobs.values().map(Job::status).collect()
    }

    pub fn handle(&self, name: &JobName) -> Option<JobHandle> {
        self.jobs.get(name).map(Job::handle)
    }

    pub fn handles(&self) -> Vec<JobHandle> {
        self.jobs.values().map(Job::handle).collect()
    }

    pub fn trigger(&self, name: &JobName) -> Result<TickOutcome, DaemonError> {
        self.handle(name)
            .map(|h| h.trigger())
            .ok_or_else(|| DaemonError::UnknownJob(name.clone()))
    }

    /// Run one cycle of `name` now and wait for its report.
    pub async fn sync_now(&self, name: &JobName) -> Result<SyncReport, DaemonError> {
        let handle = self
            .handle(name)
            .ok_or_else(|| DaemonError::UnknownJob(name.clone()))?;
        handle.sync_now().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairsync_core::{FilterConfig, JobConfig};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn job(dir: PathBuf, peer: PathBuf, storage: StorageKind) -> JobConfig {
        JobConfig {
            directory: dir,
            peer_directory: peer,
            filters: FilterConfig::default(),
            sync_interval_seconds: 60.0,
            recursive: true,
            storage,
            move_window_ms: 500,
        }
    }

    #[tokio::test]
    async fn bad_jobs_are_refused_and_good_ones_run() {
        let home = TempDir::new().unwrap();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let mut config = Config::default();
        config.jobs.insert(
            "good".into(),
            job(a.path().into(), b.path().into(), StorageKind::Memory),
        );
        config.jobs.insert(
            "missing".into(),
            job("/no/such/dir".into(), b.path().into(), StorageKind::Memory),
        );

        let (mut scheduler, rejected) = Scheduler::from_config(&config, home.path());
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, JobName::from("missing"));
        assert!(matches!(rejected[0].1, DaemonError::Config(_)));
        assert_eq!(scheduler.len(), 1);

        assert!(scheduler.start().await.is_empty());
        fs::write(a.path().join("a.txt"), "a").unwrap();
        // Event delivery is asynchronous; keep cycling until it lands.
        for _ in 0..50 {
            let report = scheduler.sync_now(&JobName::from("good")).await.unwrap();
            assert!(report.failed.is_empty());
            if b.path().join("a.txt").exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert_eq!(fs::read_to_string(b.path().join("a.txt")).unwrap(), "a");
        assert!(matches!(
            scheduler.trigger(&JobName::from("nope")),
            Err(DaemonError::UnknownJob(_))
        ));

        scheduler.stop().await;
        assert!(scheduler.is_empty());
    }

    #[test]
    fn detached_merger_uses_the_configured_state_dir() {
        let state = TempDir::new().unwrap();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let validated = job(a.path().into(), b.path().into(), StorageKind::File)
            .validate("docs")
            .unwrap();
        let merger = build_merger(&validated, state.path(), WatchMode::Detached).unwrap();
        pairsync_sync::Merger::start(&merger).unwrap();
        fs::write(a.path().join("x.txt"), "x").unwrap();
        pairsync_sync::Merger::sync(&merger).unwrap();
        assert!(state.path().join("docs.local").join("changes.jsonl").exists());
        assert!(b.path().join("x.txt").exists());
    }
}
