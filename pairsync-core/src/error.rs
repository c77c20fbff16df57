//! Error types for pairsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// A glob pattern that could not be compiled.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid glob pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// A string that is not a usable workspace-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid relative path '{0}'")]
pub struct PathError(pub String);

/// All errors that can arise while loading or validating job configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load; includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`; cannot locate `~/.pairsync/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The config file did not exist at the expected path.
    #[error("config not found at {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("job name must not be empty")]
    EmptyJobName,

    /// Job names become state file names, so they cannot escape the state dir.
    #[error("job name '{job}' may not start with '.' or contain '/', '\\' or '..'")]
    InvalidJobName { job: String },

    #[error("job '{job}': {source}")]
    Filter {
        job: String,
        #[source]
        source: FilterError,
    },

    #[error("job '{job}': directory {path} does not exist")]
    MissingDirectory { job: String, path: PathBuf },

    #[error("job '{job}': {path} is not a directory")]
    NotADirectory { job: String, path: PathBuf },

    #[error("job '{job}': directory {directory} and peer {peer} overlap")]
    OverlappingDirectories {
        job: String,
        directory: PathBuf,
        peer: PathBuf,
    },

    #[error("job '{job}': sync_interval_seconds must be positive (got {value})")]
    NonPositiveInterval { job: String, value: f64 },

    #[error("job '{job}': sync_interval_seconds {value} is below the {min_ms} ms floor")]
    IntervalTooShort { job: String, value: f64, min_ms: u128 },

    #[error("job '{job}': sync_interval_seconds {value} is too large")]
    IntervalTooLong { job: String, value: f64 },

    #[error("job '{job}': move_window_ms must be positive")]
    ZeroMoveWindow { job: String },
}

/// Convenience constructor for [`ConfigError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
