//! One merger plus the timer that drives it.
//!
//! At most one cycle per job is ever in flight: a tick that lands while the
//! previous cycle is still running is skipped, not queued. Cycles run on the
//! blocking pool so a slow disk never stalls other jobs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use pairsync_core::JobName;
use pairsync_sync::{Merger, MergerState, SyncReport};

use crate::error::DaemonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Started,
    Skipped,
}

/// Result of the most recent cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastCycle {
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<SyncReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub name: JobName,
    pub state: MergerState,
    pub interval_ms: u64,
    pub in_flight: bool,
    pub cycles: u64,
    pub skipped_ticks: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<LastCycle>,
}

enum Acquire {
    Acquired,
    Busy,
    Stopping,
}

struct Shared {
    name: JobName,
    merger: Arc<dyn Merger>,
    in_flight: AtomicBool,
    /// Set once by `Job::stop`; no cycle may start afterwards.
    stopping: AtomicBool,
    idle: Notify,
    cycles: AtomicU64,
    skipped: AtomicU64,
    last: Mutex<Option<LastCycle>>,
}

impl Shared {
    /// Claim the in-flight flag. The flag is taken before `stopping` is
    /// read and `stop` does the reverse, so one of them always sees the
    /// other.
    fn try_acquire(&self) -> Acquire {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Acquire::Busy;
        }
        if self.stopping.load(Ordering::SeqCst) {
            self.release();
            return Acquire::Stopping;
        }
        Acquire::Acquired
    }

    fn release(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
        self.idle.notify_waiters();
    }

    /// Run one cycle; the caller holds the in-flight flag.
    async fn run_cycle(self: Arc<Self>) -> Result<SyncReport, DaemonError> {
        let merger = Arc::clone(&self.merger);
        let joined = tokio::task::spawn_blocking(move || merger.sync()).await;
        let result = match joined {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(err)) => Err(DaemonError::Sync(err)),
            Err(err) => Err(DaemonError::Protocol(format!("sync task join error: {err}"))),
        };

        let last = LastCycle {
            finished_at: Utc::now(),
            report: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(ToString::to_string),
        };
        if let Ok(mut slot) = self.last.lock() {
            *slot = Some(last);
        }
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.release();
        result
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.in_flight.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Cheap handle for triggering and inspecting a job.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<Shared>,
}

impl JobHandle {
    pub fn name(&self) -> &JobName {
        &self.shared.name
    }

    /// Start a cycle in the background unless one is already running.
    pub fn trigger(&self) -> TickOutcome {
        match self.shared.try_acquire() {
            Acquire::Acquired => {}
            Acquire::Busy => {
                self.shared.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job = %self.shared.name, "tick skipped; previous sync still running");
                return TickOutcome::Skipped;
            }
            Acquire::Stopping => return TickOutcome::Skipped,
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            // Outcome is logged by the merger and kept in `last`.
            let _ = shared.run_cycle().await;
        });
        TickOutcome::Started
    }

    /// Run a cycle now and return its report, waiting out any cycle already
    /// in flight first.
    pub async fn sync_now(&self) -> Result<SyncReport, DaemonError> {
        loop {
            self.shared.wait_idle().await;
            match self.shared.try_acquire() {
                Acquire::Acquired => return Arc::clone(&self.shared).run_cycle().await,
                Acquire::Busy => continue,
                Acquire::Stopping => {
                    return Err(DaemonError::JobStopping(self.shared.name.clone()))
                }
            }
        }
    }

    pub async fn wait_idle(&self) {
        self.shared.wait_idle().await;
    }

    pub fn status(&self, interval: Duration) -> JobStatus {
        JobStatus {
            name: self.shared.name.clone(),
            state: self.shared.merger.state(),
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            in_flight: self.shared.in_flight.load(Ordering::SeqCst),
            cycles: self.shared.cycles.load(Ordering::Relaxed),
            skipped_ticks: self.shared.skipped.load(Ordering::Relaxed),
            last: self.shared.last.lock().ok().and_then(|l| l.clone()),
        }
    }
}

pub struct Job {
    handle: JobHandle,
    interval: Duration,
    ticker: Option<JoinHandle<()>>,
}

impl Job {
    pub fn new(name: JobName, merger: Arc<dyn Merger>, interval: Duration) -> Self {
        Self {
            handle: JobHandle {
                shared: Arc::new(Shared {
                    name,
                    merger,
                    in_flight: AtomicBool::new(false),
                    stopping: AtomicBool::new(false),
                    idle: Notify::new(),
                    cycles: AtomicU64::new(0),
                    skipped: AtomicU64::new(0),
                    last: Mutex::new(None),
                }),
            },
            interval,
            ticker: None,
        }
    }

    pub fn name(&self) -> &JobName {
        self.handle.name()
    }

    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> JobStatus {
        self.handle.status(self.interval)
    }

    /// Start watching both endpoints, then begin ticking. The ticker stops
    /// when `shutdown` fires.
    pub async fn start(&mut self, shutdown: broadcast::Receiver<()>) -> Result<(), DaemonError> {
        let merger = Arc::clone(&self.handle.shared.merger);
        tokio::task::spawn_blocking(move || merger.start())
            .await
            .map_err(|err| DaemonError::Protocol(format!("job start join error: {err}")))??;

        let handle = self.handle.clone();
        let interval = self.interval;
        self.ticker = Some(tokio::spawn(tick_loop(handle, interval, shutdown)));
        tracing::info!(
            job = %self.name(),
            interval_ms = self.interval.as_millis() as u64,
            "job started",
        );
        Ok(())
    }

    /// Refuse new cycles, wait for the ticker to exit and any in-flight
    /// cycle to finish, then release both watchers. The ticker must already
    /// have been signalled.
    pub async fn stop(mut self) {
        self.handle.shared.stopping.store(true, Ordering::SeqCst);
        if let Some(ticker) = self.ticker.take() {
            if let Err(err) = ticker.await {
                tracing::warn!(job = %self.name(), error = %err, "ticker join failed");
            }
        }
        self.handle.wait_idle().await;
        let merger = Arc::clone(&self.handle.shared.merger);
        if let Err(err) = tokio::task::spawn_blocking(move || merger.stop()).await {
            tracing::warn!(job = %self.name(), error = %err, "merger stop join failed");
        }
        tracing::info!(job = %self.name(), "job stopped");
    }
}

async fn tick_loop(handle: JobHandle, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                handle.trigger();
            }
        }
    }
}
