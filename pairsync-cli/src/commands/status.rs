//! `pairsync status`: daemon and per-job state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use pairsync_daemon::{request_status, DaemonError, DaemonStatus, JobStatus};
use pairsync_sync::MergerState;

/// Arguments for `pairsync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "job")]
    job: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "every")]
    every: String,
    #[tabled(rename = "cycles")]
    cycles: u64,
    #[tabled(rename = "skipped ticks")]
    skipped: u64,
    #[tabled(rename = "last sync")]
    last_sync: String,
    #[tabled(rename = "last result")]
    last_result: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;

        match request_status(&home) {
            Ok(status) if self.json => println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("failed to render daemon status JSON")?
            ),
            Ok(status) => print_table(&status),
            Err(DaemonError::DaemonNotRunning { socket }) => {
                if self.json {
                    let payload = serde_json::json!({
                        "running": false,
                        "socket": socket.display().to_string(),
                    });
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&payload)
                            .context("failed to render daemon status JSON")?
                    );
                } else {
                    println!("daemon is not running (no socket at {})", socket.display());
                }
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        }
        Ok(())
    }
}

fn print_table(status: &DaemonStatus) {
    let now = Utc::now();
    println!(
        "daemon running (pid {}, up {}, config {})",
        status.pid,
        format_age(status.started_at, now).trim_end_matches(" ago"),
        status.config.display()
    );

    if status.jobs.is_empty() {
        println!("no jobs running");
    } else {
        let rows: Vec<JobRow> = status.jobs.iter().map(|job| row(job, now)).collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    for rejected in &status.rejected {
        println!("{} '{}' rejected: {}", "✗".red(), rejected.job, rejected.error);
    }
}

fn row(job: &JobStatus, now: DateTime<Utc>) -> JobRow {
    let state = match job.state {
        MergerState::Idle => "idle".green().to_string(),
        MergerState::Reconciling => "reconciling".cyan().to_string(),
        MergerState::Degraded => "degraded".red().to_string(),
    };
    let (last_sync, last_result) = match &job.last {
        None => ("never".to_string(), "-".to_string()),
        Some(last) => {
            let result = match (&last.report, &last.error) {
                (_, Some(error)) => error.clone(),
                (Some(report), None) => format!(
                    "{} applied, {} conflict(s), {} failed",
                    report.applied,
                    report.conflicts.len(),
                    report.failed.len()
                ),
                (None, None) => "-".to_string(),
            };
            (format_age(last.finished_at, now), result)
        }
    };
    JobRow {
        job: job.name.to_string(),
        state,
        every: format_interval(job.interval_ms),
        cycles: job.cycles,
        skipped: job.skipped_ticks,
        last_sync,
        last_result,
    }
}

pub fn format_interval(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
