//! Host side of the worker subsystem.
//!
//! `HostSupervisor` owns at most one live worker. Each worker is wrapped in a
//! `LazyWorker` so concurrent callers share one launch; a dead or failed
//! worker is never reused, only replaced by swapping in a new `LazyWorker`.

mod launcher;
mod lazy;
mod supervisor;
#[cfg(test)]
pub(crate) mod testing;

pub use launcher::{
    ChildProcess, DumpHandler, LaunchRequest, ProcessLauncher, WORKER_BINARY, WorkerHandle,
    WorkerLauncher, WorkerProcess, find_worker_binary,
};
pub use lazy::LazyWorker;
pub use supervisor::HostSupervisor;
