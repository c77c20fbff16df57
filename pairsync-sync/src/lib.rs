//! # pairsync-sync
//!
//! Change tracking and two-way merging for a pair of directory trees.
//!
//! A [`Workspace`] turns raw watcher events into an ordered [`ChangeLog`]
//! via its [`DiffClassifier`]. A [`TwoWayMerger`] reads both logs from
//! their [`Watermark`]s, builds a [`MergePlan`] and applies it with guarded,
//! atomic filesystem operations.

pub mod apply;
pub mod change_log;
pub mod classifier;
pub mod conflict;
pub mod error;
pub mod file_store;
pub mod fingerprint;
pub mod merger;
pub mod plan;
pub mod store;
pub mod watch;
pub mod workspace;

pub use change_log::ChangeLog;
pub use classifier::{AppliedChange, DiffClassifier};
pub use error::{StoreError, SyncError};
pub use file_store::FileStore;
pub use merger::{FailedStep, Merger, MergerState, SyncReport, TwoWayMerger};
pub use plan::{Conflict, ConflictReason, MergePlan, PlannedOp};
pub use store::{LogStore, MemoryStore, Watermark};
pub use watch::{DetachedWatcher, EventHandler, RawEvent, RawKind, Watcher};
pub use workspace::{Synchronizable, Workspace};
