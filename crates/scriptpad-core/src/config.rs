//! Supervisor and streamer configuration.
//!
//! Retry bound and handshake timeout are policy, not constants: both can be
//! set programmatically or overridden from the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default number of worker creation attempts per acquisition.
pub const DEFAULT_MAX_ATTEMPTS: usize = 2;

/// Default bound on the readiness handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Configuration for a `HostSupervisor` and the workers it launches.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Explicit worker binary. When `None`, the binary is discovered.
    pub worker_path: Option<PathBuf>,
    /// Worker creation attempts per acquisition before `WorkerUnavailable`.
    pub max_attempts: usize,
    /// Bound on the readiness handshake.
    pub handshake_timeout: Duration,
    /// How often the handshake polls the socket and child liveness.
    pub handshake_poll_interval: Duration,
    /// How long `reset` waits for the worker to acknowledge `Abort`.
    pub abort_timeout: Duration,
    /// Per-call RPC timeout. `None` leaves calls unbounded.
    pub rpc_timeout: Option<Duration>,
    /// How often the worker checks that the supervisor process is alive.
    pub liveness_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_path: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handshake_poll_interval: Duration::from_millis(25),
            abort_timeout: Duration::from_millis(500),
            rpc_timeout: None,
            liveness_interval: Duration::from_millis(500),
        }
    }
}

impl SupervisorConfig {
    /// Default configuration with environment overrides applied.
    ///
    /// Recognised variables:
    /// - `SCRIPTPAD_WORKER_PATH`
    /// - `SCRIPTPAD_MAX_ATTEMPTS`
    /// - `SCRIPTPAD_HANDSHAKE_TIMEOUT_MS`
    /// - `SCRIPTPAD_RPC_TIMEOUT_MS`
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = lookup("SCRIPTPAD_WORKER_PATH") {
            self.worker_path = Some(PathBuf::from(path));
        }
        if let Some(value) = lookup("SCRIPTPAD_MAX_ATTEMPTS") {
            let attempts = parse_number("SCRIPTPAD_MAX_ATTEMPTS", &value)?;
            if attempts == 0 {
                return Err(Error::Config(
                    "SCRIPTPAD_MAX_ATTEMPTS must be at least 1".to_string(),
                ));
            }
            self.max_attempts = attempts as usize;
        }
        if let Some(value) = lookup("SCRIPTPAD_HANDSHAKE_TIMEOUT_MS") {
            let ms = parse_number("SCRIPTPAD_HANDSHAKE_TIMEOUT_MS", &value)?;
            self.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(value) = lookup("SCRIPTPAD_RPC_TIMEOUT_MS") {
            let ms = parse_number("SCRIPTPAD_RPC_TIMEOUT_MS", &value)?;
            self.rpc_timeout = Some(Duration::from_millis(ms));
        }
        Ok(self)
    }

    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

/// Batching policy for streamed result events.
#[derive(Debug, Clone, Copy)]
pub struct StreamerConfig {
    /// Length of one batching window.
    pub window: Duration,
    /// Maximum number of events pushed in one message.
    pub max_batch: usize,
    /// Text bytes after which a batch is closed early, keeping every push
    /// well below the frame limit.
    pub max_batch_bytes: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(500),
            max_batch: 10_000,
            max_batch_bytes: 8 * 1024 * 1024,
        }
    }
}
