//! Single-shot worker initialization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::launcher::{LaunchRequest, WorkerHandle, WorkerLauncher};

#[derive(Clone)]
enum InitState {
    Pending,
    /// `None` when the launch failed or the worker was disposed first.
    Ready(Option<Arc<WorkerHandle>>),
}

/// A worker that is launched at most once, on first use.
///
/// Any number of callers may await `initialized()` concurrently; exactly
/// one launch runs. A failed launch is never retried here: the supervisor
/// replaces the whole `LazyWorker` instead.
pub struct LazyWorker {
    generation: u64,
    launcher: Arc<dyn WorkerLauncher>,
    request: Mutex<Option<LaunchRequest>>,
    state: Arc<watch::Sender<InitState>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl LazyWorker {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, request: LaunchRequest) -> Self {
        let (state, _) = watch::channel(InitState::Pending);
        Self {
            generation: request.generation,
            launcher,
            request: Mutex::new(Some(request)),
            state: Arc::new(state),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Begin the launch in the background if it has not started yet.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let request = self
            .request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(request) = request else {
            return;
        };

        let launcher = self.launcher.clone();
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            let handle = match launcher.launch(request, cancel.clone()).await {
                Ok(handle) => {
                    tracing::debug!(
                        "Worker {} ready (generation {})",
                        handle.process_id(),
                        generation
                    );
                    Some(Arc::new(handle))
                }
                Err(e) => {
                    tracing::warn!("Worker launch failed (generation {}): {}", generation, e);
                    None
                }
            };

            let mut slot = Some(handle.clone());
            let stored = state.send_if_modified(|current| {
                if !matches!(current, InitState::Pending) {
                    return false;
                }
                *current = InitState::Ready(slot.take().flatten());
                true
            });
            if !stored {
                // Disposed while launching.
                if let Some(handle) = handle {
                    handle.terminate();
                }
            }
        });
    }

    /// Start the launch if needed and wait for it to finish.
    ///
    /// Returns `None` if the launch failed or this worker was disposed.
    pub async fn initialized(&self) -> Option<Arc<WorkerHandle>> {
        self.start();
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| matches!(state, InitState::Ready(_)))
            .await
            .ok()?;
        match &*state {
            InitState::Ready(handle) => handle.clone(),
            InitState::Pending => None,
        }
    }

    /// The handle, if the launch has already succeeded. Never waits.
    pub fn resolved(&self) -> Option<Arc<WorkerHandle>> {
        match &*self.state.borrow() {
            InitState::Ready(handle) => handle.clone(),
            InitState::Pending => None,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel a pending launch or kill the launched worker. Idempotent.
    pub fn dispose(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        if let InitState::Ready(Some(handle)) = self.state.send_replace(InitState::Ready(None)) {
            handle.terminate();
        }
    }
}

impl Drop for LazyWorker {
    fn drop(&mut self) {
        self.dispose();
    }
}
