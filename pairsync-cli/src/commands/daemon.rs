//! `pairsync run` and `pairsync stop`: daemon lifecycle.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use pairsync_daemon::{request_stop, start_blocking, DaemonError};

/// Arguments for `pairsync run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

impl RunArgs {
    pub fn run(self, config: Option<&Path>) -> Result<()> {
        let home = super::home()?;
        let config_path = super::config_path(&home, config);
        start_blocking(&home, &config_path, self.json_logs).context("daemon exited with error")
    }
}

pub fn stop() -> Result<()> {
    let home = super::home()?;
    match request_stop(&home) {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}
