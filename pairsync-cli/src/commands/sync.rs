//! `pairsync sync`: one cycle now, through the daemon when it runs.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use pairsync_core::{JobName, ValidatedJob};
use pairsync_daemon::{
    build_merger, request_sync, send_request, DaemonError, DaemonRequest, WatchMode,
};
use pairsync_sync::{ConflictReason, MergePlan, Merger, SyncReport};

/// Arguments for `pairsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Job to sync (every configured job when omitted).
    pub job: Option<String>,

    /// Print the plan without touching either tree.
    #[arg(long)]
    pub dry_run: bool,
}

impl SyncArgs {
    pub fn run(self, config: Option<&Path>) -> Result<()> {
        let home = super::home()?;

        // A running daemon owns the change logs; never open them twice.
        if self.dry_run {
            if daemon_running(&home) {
                bail!("the daemon is running; stop it before a dry run");
            }
        } else {
            match request_sync(&home, self.job.clone()) {
                Ok(results) => {
                    let mut failures = 0usize;
                    for result in results {
                        match (result.report, result.error) {
                            (Some(report), _) => print_report(&report),
                            (None, error) => {
                                failures += 1;
                                eprintln!(
                                    "{} '{}': {}",
                                    "✗".red(),
                                    result.job,
                                    error.unwrap_or_else(|| "no report".to_string())
                                );
                            }
                        }
                    }
                    if failures > 0 {
                        bail!("{failures} job(s) failed");
                    }
                    return Ok(());
                }
                Err(DaemonError::DaemonNotRunning { .. }) => {}
                Err(err) => return Err(err).context("daemon sync request failed"),
            }
        }

        let path = super::config_path(&home, config);
        let config = super::load_config(&path)?;
        let state_dir = config.state_dir_at(&home);

        let selected = match &self.job {
            Some(name) => {
                let job = config
                    .jobs
                    .get(name)
                    .with_context(|| format!("no job named '{name}' in {}", path.display()))?;
                vec![(JobName::from(name.as_str()), job.validate(name))]
            }
            None => config.validate_jobs(),
        };
        if selected.is_empty() {
            println!("no jobs configured in {}", path.display());
            return Ok(());
        }

        let mut failures = 0usize;
        for (name, validated) in selected {
            let outcome = validated
                .map_err(anyhow::Error::from)
                .and_then(|job| run_once(&job, &state_dir, self.dry_run));
            if let Err(err) = outcome {
                failures += 1;
                eprintln!("{} '{name}': {err:#}", "✗".red());
            }
        }
        if failures > 0 {
            bail!("{failures} job(s) failed");
        }
        Ok(())
    }
}

fn daemon_running(home: &Path) -> bool {
    let ping = DaemonRequest {
        cmd: "status".to_string(),
        job: None,
    };
    send_request(home, &ping).is_ok()
}

fn run_once(job: &ValidatedJob, state_dir: &Path, dry_run: bool) -> Result<()> {
    let merger = build_merger(job, state_dir, WatchMode::Detached)
        .with_context(|| format!("failed to open job '{}'", job.name))?;
    if dry_run {
        // No start: its rescan would log what the plan only previews.
        return merger
            .plan_only()
            .map(|plan| print_plan(&job.name, &plan))
            .with_context(|| format!("dry run failed for '{}'", job.name));
    }

    merger
        .start()
        .with_context(|| format!("failed to scan job '{}'", job.name))?;
    let outcome = merger.sync().map(|report| print_report(&report));
    merger.stop();
    outcome.with_context(|| format!("sync failed for '{}'", job.name))
}

fn print_plan(job: &JobName, plan: &MergePlan) {
    let prefix = "[dry-run] ";
    if plan.is_empty() && plan.conflicts.is_empty() {
        println!("{prefix}✓ '{job}': nothing to do");
        return;
    }
    println!("{prefix}'{job}' would run {} step(s)", plan.steps.len());
    for step in &plan.steps {
        println!("  {}", step.op);
    }
    for conflict in &plan.conflicts {
        println!(
            "  {} {}: {} wins ({})",
            "conflict".yellow(),
            conflict.path,
            conflict.winner,
            reason_label(conflict.reason)
        );
    }
}

fn print_report(report: &SyncReport) {
    let job = &report.job;
    if report.is_noop() {
        println!("✓ '{job}': nothing to do");
        return;
    }

    let mark = if report.failed.is_empty() {
        "✓".green()
    } else {
        "!".yellow()
    };
    println!(
        "{mark} '{job}' synced ({} applied, {} skipped, {} failed, {} conflict(s))",
        report.applied,
        report.skipped,
        report.failed.len(),
        report.conflicts.len()
    );
    for conflict in &report.conflicts {
        let kept = conflict
            .preserved_as
            .as_ref()
            .map(|path| format!(", loser kept as {path}"))
            .unwrap_or_default();
        println!(
            "  {} {}: {} wins ({}){kept}",
            "conflict".yellow(),
            conflict.path,
            conflict.winner,
            reason_label(conflict.reason)
        );
    }
    for failed in &report.failed {
        println!(
            "  {} {} {}: {}",
            "✗".red(),
            failed.op,
            failed.path,
            failed.error
        );
    }
}

fn reason_label(reason: ConflictReason) -> &'static str {
    match reason {
        ConflictReason::Newer => "newer",
        ConflictReason::Tie => "tie",
        ConflictReason::Directory => "directory",
    }
}
