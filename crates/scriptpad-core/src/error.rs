//! Error types for scriptpad-core.

use std::time::Duration;

use thiserror::Error;

use crate::result::{Diagnostic, ExceptionInfo, Severity};

/// Result type for scriptpad-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in scriptpad-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The worker process could not be started.
    #[error("failed to spawn worker process: {0}")]
    ProcessSpawnFailure(String),

    /// The worker did not become ready within the handshake bound.
    #[error("worker process {pid} did not complete its handshake within {timeout:?}")]
    HandshakeTimeout { pid: u32, timeout: Duration },

    /// The worker exited before signalling readiness.
    #[error("worker process {pid} exited during handshake ({status})")]
    ProcessDiedDuringHandshake { pid: u32, status: String },

    /// The worker endpoint is not listening or rejected the handshake token.
    #[error("failed to connect to worker: {0}")]
    ConnectFailure(String),

    /// The RPC channel to the worker broke down.
    #[error("RPC communication failure: {0}")]
    RpcCommunicationFailure(String),

    /// No worker could be created within the configured number of attempts.
    #[error("unable to create worker process after {attempts} attempt(s)")]
    WorkerUnavailable { attempts: usize },

    /// Compilation produced Error-severity diagnostics.
    #[error("compilation failed with {} error(s)", count_errors(.0))]
    CompilationDiagnostics(Vec<Diagnostic>),

    /// User code raised an exception.
    #[error("{}: {}", .0.type_name, .0.message)]
    ExecutionException(ExceptionInfo),

    /// The supervisor has been disposed.
    #[error("supervisor has been disposed")]
    Disposed,

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The worker reported a failure for the requested operation.
    #[error("worker error: {0}")]
    Remote(String),

    /// Malformed frame or protocol version mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

fn count_errors(diagnostics: &[Diagnostic]) -> usize {
    diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .count()
}

impl Error {
    /// Render the error with a recovery hint where one is known.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Self::ProcessSpawnFailure(_) => Some(
                "build the worker with `cargo build -p scriptpad-worker` or set SCRIPTPAD_WORKER_PATH",
            ),
            Self::HandshakeTimeout { .. } => {
                Some("raise SCRIPTPAD_HANDSHAKE_TIMEOUT_MS if the machine is heavily loaded")
            }
            Self::ProcessDiedDuringHandshake { .. } => {
                Some("run the worker manually with RUST_LOG=debug to see why it exits")
            }
            Self::WorkerUnavailable { .. } => {
                Some("check the log output above for the individual spawn failures")
            }
            Self::Disposed => Some("create a new supervisor"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
