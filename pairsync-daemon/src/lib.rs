//! pairsync daemon: notify-backed watching, periodic jobs, control socket.

mod error;
pub mod job;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod scheduler;
pub mod watcher;

pub use error::DaemonError;
pub use job::{Job, JobHandle, JobStatus, LastCycle, TickOutcome};
pub use protocol::{
    request_status, request_stop, request_sync, send_request, DaemonRequest, DaemonResponse,
    DaemonStatus, JobSyncResult, RejectedJob,
};
pub use runtime::{init_tracing, run, start_blocking};
pub use scheduler::{build_merger, PairMerger, Scheduler, WatchMode};
pub use watcher::NotifyWatcher;
