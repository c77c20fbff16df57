//! pairsync core library: domain types, job configuration, glob filtering, errors.
//!
//! Public API surface:
//! - [`types`]: newtypes and change-log domain structs
//! - [`filter`]: [`GlobFilter`] include/exclude matching
//! - [`config`]: YAML job configuration, load + validate
//! - [`error`]: [`ConfigError`], [`FilterError`], [`PathError`]

pub mod config;
pub mod error;
pub mod filter;
pub mod types;

pub use config::{Config, FilterConfig, JobConfig, StorageKind, ValidatedJob};
pub use error::{ConfigError, FilterError, PathError};
pub use filter::GlobFilter;
pub use types::{
    ChangeOp, ChangeRecord, Inode, InodeKind, JobName, RelPath, Sequence, Side, WorkspaceId,
};
