//! YAML job configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.pairsync/
//!   config.yaml     (jobs, see below)
//!   state/          (default change-log + watermark directory)
//! ```
//!
//! ```yaml
//! jobs:
//!   docs:
//!     directory: /home/me/docs
//!     peer_directory: /mnt/backup/docs
//!     filters: { include: ["*.md"], exclude: ["draft_*"] }
//!     sync_interval_seconds: 5
//! ```
//!
//! # API pattern
//!
//! Every loader has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::filter::GlobFilter;
use crate::types::JobName;

/// Shortest accepted trigger interval. Anything tighter starves I/O.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_millis(100);

pub const DEFAULT_MOVE_WINDOW_MS: u64 = 500;

// ---------------------------------------------------------------------------
// 1. Schema
// ---------------------------------------------------------------------------

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Where change logs and watermarks live. Defaults to `~/.pairsync/state`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Change-log engine for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// JSON-lines log under `state_dir`; survives restarts.
    #[default]
    File,
    /// In-process only; history is lost on restart and the first cycle after
    /// startup rescans both trees.
    Memory,
}

/// One synchronisation pair as written in `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub directory: PathBuf,
    pub peer_directory: PathBuf,
    #[serde(default)]
    pub filters: FilterConfig,
    pub sync_interval_seconds: f64,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default = "default_move_window_ms")]
    pub move_window_ms: u64,
}

fn default_recursive() -> bool {
    true
}

fn default_move_window_ms() -> u64 {
    DEFAULT_MOVE_WINDOW_MS
}

/// A job that passed validation: directories canonicalised, globs compiled.
#[derive(Debug, Clone)]
pub struct ValidatedJob {
    pub name: JobName,
    pub directory: PathBuf,
    pub peer_directory: PathBuf,
    pub filter: GlobFilter,
    pub interval: Duration,
    pub recursive: bool,
    pub storage: StorageKind,
    pub move_window: Duration,
}

// ---------------------------------------------------------------------------
// 2. Validation
// ---------------------------------------------------------------------------

impl JobConfig {
    pub fn validate(&self, name: &str) -> Result<ValidatedJob, ConfigError> {
        let job = name.trim();
        if job.is_empty() {
            return Err(ConfigError::EmptyJobName);
        }
        if job.starts_with('.') || job.contains(['/', '\\']) || job.contains("..") {
            return Err(ConfigError::InvalidJobName {
                job: job.to_string(),
            });
        }

        let filter = GlobFilter::new(&self.filters.include, &self.filters.exclude).map_err(
            |source| ConfigError::Filter {
                job: job.to_string(),
                source,
            },
        )?;

        let directory = existing_dir(job, &self.directory)?;
        let peer_directory = existing_dir(job, &self.peer_directory)?;
        if directory.starts_with(&peer_directory) || peer_directory.starts_with(&directory) {
            return Err(ConfigError::OverlappingDirectories {
                job: job.to_string(),
                directory,
                peer: peer_directory,
            });
        }

        let interval = interval_from_seconds(job, self.sync_interval_seconds)?;
        if self.move_window_ms == 0 {
            return Err(ConfigError::ZeroMoveWindow {
                job: job.to_string(),
            });
        }

        Ok(ValidatedJob {
            name: JobName::from(job),
            directory,
            peer_directory,
            filter,
            interval,
            recursive: self.recursive,
            storage: self.storage,
            move_window: Duration::from_millis(self.move_window_ms),
        })
    }
}

fn existing_dir(job: &str, path: &Path) -> Result<PathBuf, ConfigError> {
    let canonical = match std::fs::canonicalize(path) {
        Ok(p) => p,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::MissingDirectory {
                job: job.to_string(),
                path: path.to_path_buf(),
            })
        }
        Err(err) => return Err(io_err(path, err)),
    };
    if !canonical.is_dir() {
        return Err(ConfigError::NotADirectory {
            job: job.to_string(),
            path: path.to_path_buf(),
        });
    }
    Ok(canonical)
}

fn interval_from_seconds(job: &str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::NonPositiveInterval {
            job: job.to_string(),
            value,
        });
    }
    let interval =
        Duration::try_from_secs_f64(value).map_err(|_| ConfigError::IntervalTooLong {
            job: job.to_string(),
            value,
        })?;
    if interval < MIN_SYNC_INTERVAL {
        return Err(ConfigError::IntervalTooShort {
            job: job.to_string(),
            value,
            min_ms: MIN_SYNC_INTERVAL.as_millis(),
        });
    }
    Ok(interval)
}

impl Config {
    /// Validate every job independently. A broken job never hides the others.
    pub fn validate_jobs(&self) -> Vec<(JobName, Result<ValidatedJob, ConfigError>)> {
        self.jobs
            .iter()
            .map(|(name, job)| (JobName::from(name.as_str()), job.validate(name)))
            .collect()
    }

    /// Resolved state directory; relative `state_dir` values are taken
    /// relative to `~/.pairsync/`.
    pub fn state_dir_at(&self, home: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => pairsync_root(home).join(dir),
            None => pairsync_root(home).join("state"),
        }
    }
}

// ---------------------------------------------------------------------------
// 3. Path helpers + load
// ---------------------------------------------------------------------------

/// `<home>/.pairsync/`
pub fn pairsync_root(home: &Path) -> PathBuf {
    home.join(".pairsync")
}

/// `<home>/.pairsync/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    pairsync_root(home).join("config.yaml")
}

/// Load and parse the config file at `path`.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Load `<home>/.pairsync/config.yaml`.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    load_from(&config_path_at(home))
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, ConfigError> {
    load_at(&home()?)
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
