//! Worker-side runtime: everything that runs inside the spawned process.
//!
//! The `scriptpad-worker` binary binds a socket, hands each connection to
//! `serve`, and exits when the service is aborted, the connection closes,
//! or the supervisor process disappears.

pub mod liveness;
mod server;
mod service;
mod streamer;
mod writer;

pub use liveness::{is_process_alive, wait_for_exit};
pub use server::serve;
pub use service::{ServiceState, WorkerService};
pub use streamer::{FlushTask, ResultQueue, ResultStreamer};
pub use writer::OutputWriter;
