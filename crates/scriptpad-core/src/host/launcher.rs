//! Worker process spawning and the readiness handshake.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::ipc::{Push, Request, Response, RpcChannel};
use crate::result::{ExecutionOutcome, InitializationParams, ResultEvent};

/// Name of the worker executable.
pub const WORKER_BINARY: &str = if cfg!(windows) {
    "scriptpad-worker.exe"
} else {
    "scriptpad-worker"
};

/// Callback receiving each batch of streamed events.
pub type DumpHandler = Arc<dyn Fn(Vec<ResultEvent>) + Send + Sync>;

/// Everything a launcher needs to bring up one worker.
#[derive(Clone)]
pub struct LaunchRequest {
    /// Spawn generation, used only for logging.
    pub generation: u64,
    pub params: InitializationParams,
    pub on_dump: DumpHandler,
}

/// The OS-level side of a worker.
pub trait WorkerProcess: Send + Sync {
    fn id(&self) -> u32;

    fn is_alive(&self) -> bool;

    /// Kill the process. Must be idempotent.
    fn terminate(&self);
}

/// Creates ready, initialized workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Spawn a worker, complete its handshake and send `Initialize`.
    ///
    /// When `cancel` fires at any point, the spawned process is terminated
    /// and the launch fails with `Cancelled`.
    async fn launch(&self, request: LaunchRequest, cancel: CancellationToken) -> Result<WorkerHandle>;
}

/// A connected worker: its process plus the RPC channel to it.
///
/// Handles are never reused once dead. Dropping a handle terminates the
/// process.
pub struct WorkerHandle {
    generation: u64,
    process: Box<dyn WorkerProcess>,
    channel: RpcChannel,
    rpc_timeout: Option<Duration>,
    terminated: AtomicBool,
}

impl WorkerHandle {
    pub fn new(
        generation: u64,
        process: Box<dyn WorkerProcess>,
        channel: RpcChannel,
        rpc_timeout: Option<Duration>,
    ) -> Self {
        Self {
            generation,
            process,
            channel,
            rpc_timeout,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process.id()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the worker can still serve requests.
    pub fn is_alive(&self) -> bool {
        !self.was_terminated() && !self.channel.is_closed() && self.process.is_alive()
    }

    /// Whether the worker was torn down on purpose (reset, cancel, dispose).
    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub async fn initialize(&self, params: InitializationParams) -> Result<()> {
        match self.call(Request::Initialize(params)).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected("Initialize", &other)),
        }
    }

    /// Run `code`. A call cut short or faulted because the worker was
    /// deliberately terminated reports `Cancelled`.
    pub async fn execute(&self, code: &str) -> Result<ExecutionOutcome> {
        let result = self
            .call(Request::Execute {
                code: code.to_string(),
            })
            .await;
        match result {
            // A fault raised by the teardown itself, e.g. the interrupt.
            Ok(Response::Outcome(ExecutionOutcome::Exception(_))) if self.was_terminated() => {
                Ok(ExecutionOutcome::Cancelled)
            }
            Ok(Response::Outcome(outcome)) => Ok(outcome),
            Ok(other) => Err(unexpected("Execute", &other)),
            Err(_) if self.was_terminated() => Ok(ExecutionOutcome::Cancelled),
            Err(e) => Err(e),
        }
    }

    /// Compile `code` and write the artifact to `path` in the worker.
    pub async fn compile_and_save(&self, code: &str, path: &str) -> Result<()> {
        let result = self
            .call(Request::CompileAndSave {
                code: code.to_string(),
                path: path.to_string(),
            })
            .await;
        match result {
            Ok(Response::Saved) => Ok(()),
            Ok(Response::NotSaved { errors }) => Err(Error::CompilationDiagnostics(errors)),
            Ok(other) => Err(unexpected("CompileAndSave", &other)),
            Err(_) if self.was_terminated() => Err(Error::Cancelled),
            Err(e) => Err(e),
        }
    }

    /// Ask the worker to stop, waiting at most `timeout` for the
    /// acknowledgement. Marks the handle terminated first, so calls still
    /// in flight report cancellation.
    pub async fn abort(&self, timeout: Duration) {
        self.terminated.store(true, Ordering::SeqCst);
        match self.channel.call(Request::Abort, Some(timeout)).await {
            Ok(_) => tracing::debug!("Worker {} acknowledged abort", self.process_id()),
            Err(e) => tracing::debug!("Worker {} abort: {}", self.process_id(), e),
        }
    }

    /// Kill the worker process.
    pub fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                "Terminating worker {} (generation {})",
                self.process_id(),
                self.generation
            );
        }
        self.process.terminate();
    }

    async fn call(&self, request: Request) -> Result<Response> {
        self.channel.call(request, self.rpc_timeout).await
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn unexpected(request: &str, response: &Response) -> Error {
    Error::Protocol(format!("unexpected response to {}: {:?}", request, response))
}

/// Wrap a connected channel into a handle, wire up pushes and send
/// `Initialize`, racing everything against `cancel`.
pub(crate) async fn attach(
    request: LaunchRequest,
    process: Box<dyn WorkerProcess>,
    channel: RpcChannel,
    rpc_timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<WorkerHandle> {
    let on_dump = request.on_dump.clone();
    channel.on_push(move |push| match push {
        Push::Dump(batch) => on_dump(batch),
    });

    let handle = WorkerHandle::new(request.generation, process, channel, rpc_timeout);
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = handle.initialize(request.params) => result,
    }?;
    Ok(handle)
}

/// A real worker child process.
pub struct ChildProcess {
    pid: u32,
    /// `None` once terminated.
    child: Mutex<Option<Child>>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| Error::ProcessSpawnFailure("worker exited immediately".to_string()))?;
        Ok(Self {
            pid,
            child: Mutex::new(Some(child)),
        })
    }

    /// Exit status, if the process has exited on its own.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        child.as_mut()?.try_wait().ok().flatten()
    }
}

impl WorkerProcess for ChildProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn terminate(&self) {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut child) = child else {
            return;
        };
        if let Err(e) = child.start_kill() {
            // Already exited.
            tracing::debug!("Failed to kill worker {}: {}", self.pid, e);
        }
        // Reap in the background so no zombie is left behind. Outside a
        // runtime, `kill_on_drop` leaves reaping to tokio's orphan queue.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = child.wait().await;
            });
        }
    }
}

/// Launches `scriptpad-worker` processes over Unix domain sockets.
pub struct ProcessLauncher {
    config: SupervisorConfig,
}

impl ProcessLauncher {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    fn worker_binary(&self) -> Result<PathBuf> {
        match &self.config.worker_path {
            Some(path) => Ok(path.clone()),
            None => find_worker_binary(),
        }
    }

    fn spawn(&self, address: &Path, token: &str) -> Result<ChildProcess> {
        let worker_path = self.worker_binary()?;
        let child = Command::new(&worker_path)
            .arg("--address")
            .arg(address)
            .arg("--token")
            .arg(token)
            .arg("--parent-pid")
            .arg(std::process::id().to_string())
            .arg("--liveness-interval-ms")
            .arg(self.config.liveness_interval.as_millis().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit()) // Worker logs pass through for debugging
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ProcessSpawnFailure(format!("'{}': {}", worker_path.display(), e))
            })?;
        ChildProcess::new(child)
    }

    /// Poll until the worker accepts our token, the child exits, or the
    /// handshake bound elapses.
    async fn handshake(&self, process: &ChildProcess, address: &Path, token: &str) -> Result<RpcChannel> {
        let timeout = self.config.handshake_timeout;
        let poll = async {
            loop {
                if let Some(status) = process.exit_status() {
                    return Err(Error::ProcessDiedDuringHandshake {
                        pid: process.id(),
                        status: status.to_string(),
                    });
                }
                if address.exists() {
                    match RpcChannel::connect(address, token).await {
                        Ok(channel) => return Ok(channel),
                        Err(Error::ConnectFailure(reason)) => {
                            tracing::debug!("Worker {} not ready: {}", process.id(), reason);
                        }
                        Err(e) => return Err(e),
                    }
                }
                tokio::time::sleep(self.config.handshake_poll_interval).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(Error::HandshakeTimeout {
                pid: process.id(),
                timeout,
            }),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, request: LaunchRequest, cancel: CancellationToken) -> Result<WorkerHandle> {
        let token = Uuid::new_v4().simple().to_string();
        let address =
            std::env::temp_dir().join(format!("scriptpad-{}.sock", Uuid::new_v4().simple()));

        let process = self.spawn(&address, &token)?;
        tracing::info!(
            "Spawned worker {} (generation {})",
            process.id(),
            request.generation
        );

        let connected = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.handshake(&process, &address, &token) => result,
        };
        // Connected sockets survive the unlink.
        let _ = std::fs::remove_file(&address);

        let channel = match connected {
            Ok(channel) => channel,
            Err(e) => {
                process.terminate();
                return Err(e);
            }
        };

        attach(
            request,
            Box::new(process),
            channel,
            self.config.rpc_timeout,
            &cancel,
        )
        .await
    }
}

/// Find the scriptpad-worker binary.
///
/// Search order:
/// 1. `SCRIPTPAD_WORKER_PATH` environment variable
/// 2. Same directory as the current executable
/// 3. System PATH
/// 4. `target/debug` or `target/release` of this workspace
pub fn find_worker_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SCRIPTPAD_WORKER_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let worker_path = exe_dir.join(WORKER_BINARY);
        if worker_path.exists() {
            return Ok(worker_path);
        }
        // Test binaries live one level down, in target/<profile>/deps.
        if let Some(profile_dir) = exe_dir.parent() {
            let worker_path = profile_dir.join(WORKER_BINARY);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_BINARY) {
        return Ok(path);
    }

    let workspace = Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..");
    for profile in ["debug", "release"] {
        let path = workspace.join("target").join(profile).join(WORKER_BINARY);
        if path.exists() {
            return Ok(path.canonicalize().unwrap_or(path));
        }
    }

    Err(Error::ProcessSpawnFailure(
        "could not find scriptpad-worker binary".to_string(),
    ))
}
