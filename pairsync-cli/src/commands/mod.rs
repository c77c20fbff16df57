pub mod daemon;
pub mod status;
pub mod sync;
pub mod validate;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use pairsync_core::config;

pub fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// `--config` when given, else `~/.pairsync/config.yaml`.
pub fn config_path(home: &Path, explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config::config_path_at(home))
}

pub fn load_config(path: &Path) -> Result<config::Config> {
    config::load_from(path).with_context(|| format!("failed to load {}", path.display()))
}
