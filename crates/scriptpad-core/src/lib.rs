//! Core engine for scriptpad.
//!
//! This crate provides:
//! - A supervisor that runs snippets in a separate worker process
//! - A duplex RPC channel with a server-push path for streamed results
//! - The worker-side service, result streamer and console capture
//! - The pad-script compiler and interpreter executed inside the worker

pub mod config;
pub mod error;
pub mod host;
pub mod ipc;
pub mod result;
pub mod script;
pub mod worker;

pub use config::{StreamerConfig, SupervisorConfig};
pub use error::{Error, Result};
pub use host::{HostSupervisor, ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use result::{
    Diagnostic, ExceptionInfo, ExecutionOutcome, InitializationParams, OutputStream, ResultEvent,
    Severity, Span,
};
pub use worker::{WorkerService, serve};
