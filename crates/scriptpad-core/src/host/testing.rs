//! Launchers that run workers inside the test process.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StreamerConfig;
use crate::error::{Error, Result};
use crate::ipc::RpcChannel;
use crate::worker::{WorkerService, serve};

use super::launcher::{LaunchRequest, WorkerHandle, WorkerLauncher, WorkerProcess, attach};

const TOKEN: &str = "in-process";

/// Serves each worker over an in-memory duplex stream.
pub(crate) struct InProcessLauncher {
    launches: AtomicUsize,
    next_pid: AtomicU32,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
}

impl InProcessLauncher {
    pub(crate) fn new() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            next_pid: AtomicU32::new(1000),
            processes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Pids of launched workers that are still running.
    pub(crate) fn live_pids(&self) -> Vec<u32> {
        let processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        processes
            .iter()
            .filter(|process| process.is_alive())
            .map(|process| process.pid)
            .collect()
    }

    /// Simulate a crash of the most recently launched worker.
    pub(crate) fn crash_latest(&self) {
        let processes = self.processes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(process) = processes.last() {
            process.terminate();
        }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, request: LaunchRequest, cancel: CancellationToken) -> Result<WorkerHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(1 << 20);
        let service = Arc::new(WorkerService::new(StreamerConfig {
            window: Duration::from_millis(20),
            ..StreamerConfig::default()
        }));
        let terminate = service.termination_token();
        let serving = service.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = terminate.cancelled() => {}
                result = serve(server, TOKEN, pid, serving) => {
                    if let Err(e) = result {
                        tracing::debug!("In-process worker {} stopped: {}", pid, e);
                    }
                }
            }
        });

        let process = Arc::new(FakeProcess {
            pid,
            service,
            task,
            killed: AtomicBool::new(false),
        });
        self.processes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(process.clone());

        let channel = match RpcChannel::handshake(client, TOKEN).await {
            Ok(channel) => channel,
            Err(e) => {
                process.terminate();
                return Err(e);
            }
        };
        attach(request, Box::new(SharedProcess(process)), channel, None, &cancel).await
    }
}

/// An in-process worker standing in for an OS process.
pub(crate) struct FakeProcess {
    pid: u32,
    service: Arc<WorkerService>,
    task: JoinHandle<()>,
    killed: AtomicBool,
}

impl WorkerProcess for FakeProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        !self.killed.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    fn terminate(&self) {
        self.killed.store(true, Ordering::SeqCst);
        // Stops a running script; the task abort closes the connection.
        self.service.abort();
        self.task.abort();
    }
}

struct SharedProcess(Arc<FakeProcess>);

impl WorkerProcess for SharedProcess {
    fn id(&self) -> u32 {
        self.0.id()
    }

    fn is_alive(&self) -> bool {
        self.0.is_alive()
    }

    fn terminate(&self) {
        self.0.terminate()
    }
}

/// Fails every launch.
pub(crate) struct FailingLauncher {
    launches: AtomicUsize,
}

impl FailingLauncher {
    pub(crate) fn new() -> Self {
        Self {
            launches: AtomicUsize::new(0),
        }
    }

    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerLauncher for FailingLauncher {
    async fn launch(&self, _request: LaunchRequest, _cancel: CancellationToken) -> Result<WorkerHandle> {
        let attempt = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        Err(Error::ProcessSpawnFailure(format!(
            "launch {} refused by test launcher",
            attempt
        )))
    }
}
