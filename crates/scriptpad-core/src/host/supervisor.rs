//! Host-side supervisor: owns the current worker and routes calls to it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};
use crate::result::{ExecutionOutcome, InitializationParams, ResultEvent};

use super::launcher::{LaunchRequest, ProcessLauncher, WorkerHandle, WorkerLauncher};
use super::lazy::LazyWorker;

/// Supervises one out-of-process worker at a time.
///
/// Workers are created lazily on first use and replaced wholesale when they
/// die, are reset, or are cancelled. Cloning is cheap; clones share the
/// same worker.
#[derive(Clone)]
pub struct HostSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    params: InitializationParams,
    launcher: Arc<dyn WorkerLauncher>,
    /// `None` once disposed.
    current: Mutex<Option<Arc<LazyWorker>>>,
    generation: AtomicU64,
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Vec<ResultEvent>>>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Swap {
    Won,
    Lost,
    Disposed,
}

impl HostSupervisor {
    /// A supervisor launching `scriptpad-worker` processes.
    pub fn new(config: SupervisorConfig, params: InitializationParams) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(config.clone()));
        Self::with_launcher(config, params, launcher)
    }

    pub fn with_launcher(
        config: SupervisorConfig,
        params: InitializationParams,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        let inner = Arc::new(Inner {
            config,
            params,
            launcher,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        });
        let first = inner.new_worker();
        *inner.lock() = Some(first);
        Self { inner }
    }

    /// Receive every batch of streamed events from now on.
    ///
    /// Batches arrive in push order. A batch produced by a call is always
    /// delivered before that call returns.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<ResultEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Pid of the current worker, if it is up.
    pub fn current_process_id(&self) -> Option<u32> {
        self.current_handle().map(|handle| handle.process_id())
    }

    /// Start launching the current worker without waiting for it.
    pub fn warm_up(&self) -> Result<()> {
        self.inner.current()?.start();
        Ok(())
    }

    /// Run `code` in the worker.
    pub async fn execute(&self, code: &str) -> Result<ExecutionOutcome> {
        let handle = self.acquire().await?;
        tracing::debug!("Executing in worker {}", handle.process_id());
        handle.execute(code).await
    }

    /// Run `code`, resetting the worker if `cancel` fires first.
    ///
    /// Cancellation is whole-worker: the running script is stopped by
    /// tearing its process down, and the call returns `Cancelled`.
    pub async fn execute_with_cancel(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        if cancel.is_cancelled() {
            return Ok(ExecutionOutcome::Cancelled);
        }
        tokio::select! {
            result = self.execute(code) => result,
            _ = cancel.cancelled() => {
                tracing::info!("Execution cancelled; resetting worker");
                match self.reset().await {
                    Ok(()) | Err(Error::Disposed) => Ok(ExecutionOutcome::Cancelled),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Compile `code` in the worker and write the artifact to `path`.
    ///
    /// Diagnostics are streamed whatever the result. Fails with
    /// `CompilationDiagnostics` when errors prevented writing the file.
    pub async fn compile_and_save(&self, code: &str, path: &str) -> Result<()> {
        let handle = self.acquire().await?;
        handle.compile_and_save(code, path).await
    }

    /// Abort the current worker and replace it with a fresh one.
    ///
    /// The aborted worker is never reused. The replacement starts
    /// launching immediately.
    pub async fn reset(&self) -> Result<()> {
        let observed = self.inner.current()?;
        if let Some(handle) = observed.resolved().filter(|handle| handle.is_alive()) {
            handle.abort(self.inner.config.abort_timeout).await;
        }

        let replacement = self.inner.new_worker();
        let previous = {
            let mut current = self.inner.lock();
            if current.is_none() {
                drop(current);
                replacement.dispose();
                return Err(Error::Disposed);
            }
            current.replace(replacement.clone())
        };
        if let Some(previous) = previous {
            previous.dispose();
        }
        replacement.start();
        tracing::info!("Worker reset (generation {})", replacement.generation());
        Ok(())
    }

    /// Kill the current worker. Every later call fails with `Disposed`.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Get a live worker, replacing dead or failed ones.
    ///
    /// Each pass awaits one initialization. A worker that failed on its own
    /// counts as an attempt; one torn down by a concurrent reset does not.
    /// After `max_attempts` failures the acquisition fails.
    async fn acquire(&self) -> Result<Arc<WorkerHandle>> {
        let max_attempts = self.inner.config.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            let observed = self.inner.current()?;
            let failed = match observed.initialized().await {
                Some(handle) if handle.is_alive() => return Ok(handle),
                Some(handle) if handle.was_terminated() => false,
                Some(handle) => {
                    tracing::warn!("Worker {} is no longer alive", handle.process_id());
                    true
                }
                None => !observed.is_disposed(),
            };

            match self.inner.replace(&observed, self.inner.new_worker()) {
                Swap::Won if failed => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        return Err(Error::WorkerUnavailable { attempts });
                    }
                }
                Swap::Won => {}
                Swap::Lost => tracing::debug!(
                    "Worker generation {} was already replaced",
                    observed.generation()
                ),
                Swap::Disposed => return Err(Error::Disposed),
            }
        }
    }

    fn current_handle(&self) -> Option<Arc<WorkerHandle>> {
        self.inner
            .current()
            .ok()?
            .resolved()
            .filter(|handle| handle.is_alive())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Option<Arc<LazyWorker>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Result<Arc<LazyWorker>> {
        self.lock().clone().ok_or(Error::Disposed)
    }

    fn new_worker(&self) -> Arc<LazyWorker> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let subscribers = self.subscribers.clone();
        let request = LaunchRequest {
            generation,
            params: self.params.clone(),
            on_dump: Arc::new(move |batch| {
                let mut subscribers = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
                subscribers.retain(|tx| tx.send(batch.clone()).is_ok());
            }),
        };
        Arc::new(LazyWorker::new(self.launcher.clone(), request))
    }

    /// Install `candidate` only if `observed` is still current. Whichever
    /// of the two ends up outside the slot is disposed.
    fn replace(&self, observed: &Arc<LazyWorker>, candidate: Arc<LazyWorker>) -> Swap {
        let swap = {
            let mut current = self.lock();
            match current.as_ref() {
                None => Swap::Disposed,
                Some(existing) if Arc::ptr_eq(existing, observed) => {
                    *current = Some(candidate.clone());
                    Swap::Won
                }
                Some(_) => Swap::Lost,
            }
        };
        match swap {
            Swap::Won => observed.dispose(),
            Swap::Lost | Swap::Disposed => candidate.dispose(),
        }
        swap
    }

    fn dispose(&self) {
        let previous = self.lock().take();
        if let Some(worker) = previous {
            tracing::debug!("Disposing worker generation {}", worker.generation());
            worker.dispose();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::{FailingLauncher, InProcessLauncher};
    use std::time::Duration;

    fn supervisor(launcher: Arc<dyn WorkerLauncher>) -> HostSupervisor {
        HostSupervisor::with_launcher(
            SupervisorConfig::default(),
            InitializationParams::default(),
            launcher,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<ResultEvent>>) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            events.extend(batch);
        }
        events
    }

    #[tokio::test]
    async fn test_execute_streams_value() {
        let supervisor = supervisor(Arc::new(InProcessLauncher::new()));
        let mut rx = supervisor.subscribe();

        let outcome = supervisor.execute("1 + 1").await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(drain(&mut rx), vec![ResultEvent::value("int", "2")]);
    }

    #[tokio::test]
    async fn test_compile_errors_are_streamed_not_returned() {
        let supervisor = supervisor(Arc::new(InProcessLauncher::new()));
        let mut rx = supervisor.subscribe();

        let outcome = supervisor.execute("int x = ;").await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        let events = drain(&mut rx);
        assert!(!events.is_empty());
        assert!(events.iter().all(|event| matches!(
            event,
            ResultEvent::Diagnostic(diagnostic) if diagnostic.is_error()
        )));
    }

    #[tokio::test]
    async fn test_exception_outcome() {
        let supervisor = supervisor(Arc::new(InProcessLauncher::new()));
        let outcome = supervisor.execute("throw \"boom\";").await.unwrap();
        let exception = outcome.exception().expect("exception outcome");
        assert_eq!(exception.message, "boom");
    }

    #[tokio::test]
    async fn test_unavailable_after_max_attempts() {
        let launcher = Arc::new(FailingLauncher::new());
        let supervisor = supervisor(launcher.clone());

        let err = supervisor.execute("1").await.unwrap_err();
        assert!(matches!(err, Error::WorkerUnavailable { attempts: 2 }));
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_worker() {
        let launcher = Arc::new(InProcessLauncher::new());
        let supervisor = supervisor(launcher.clone());

        let mut rx = supervisor.subscribe();
        let codes: Vec<String> = (0..8).map(|i| i.to_string()).collect();
        let outcomes =
            futures::future::join_all(codes.iter().map(|code| supervisor.execute(code))).await;
        assert!(outcomes
            .into_iter()
            .all(|outcome| outcome.unwrap() == ExecutionOutcome::Completed));
        assert_eq!(launcher.launches(), 1);

        let mut values: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ResultEvent::Value { display, .. } => Some(display),
                _ => None,
            })
            .collect();
        values.sort();
        assert_eq!(values, codes);
    }

    #[tokio::test]
    async fn test_reset_replaces_worker() {
        let launcher = Arc::new(InProcessLauncher::new());
        let supervisor = supervisor(launcher.clone());

        supervisor.execute("1").await.unwrap();
        let first = supervisor.current_process_id().unwrap();

        supervisor.reset().await.unwrap();
        supervisor.execute("1").await.unwrap();
        let second = supervisor.current_process_id().unwrap();

        assert_ne!(first, second);
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn test_stale_replacement_is_discarded() {
        let launcher = Arc::new(InProcessLauncher::new());
        let supervisor = supervisor(launcher.clone());
        let inner = &supervisor.inner;

        let observed = inner.current().unwrap();
        let winner = inner.new_worker();
        assert_eq!(inner.replace(&observed, winner.clone()), Swap::Won);
        assert!(observed.is_disposed());
        assert!(!winner.is_disposed());

        // A second caller still holding the replaced worker.
        let late = inner.new_worker();
        assert_eq!(inner.replace(&observed, late.clone()), Swap::Lost);
        assert!(late.is_disposed());
        assert!(late.initialized().await.is_none());
        assert!(Arc::ptr_eq(&inner.current().unwrap(), &winner));

        supervisor.execute("1").await.unwrap();
        assert_eq!(launcher.launches(), 1);
        assert_eq!(
            launcher.live_pids(),
            vec![supervisor.current_process_id().unwrap()]
        );

        supervisor.dispose();
        let orphan = inner.new_worker();
        assert_eq!(inner.replace(&winner, orphan.clone()), Swap::Disposed);
        assert!(orphan.is_disposed());
        assert!(launcher.live_pids().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resets_leave_one_live_worker() {
        let launcher = Arc::new(InProcessLauncher::new());
        let supervisor = supervisor(launcher.clone());

        let tasks: Vec<_> = (0..8)
            .map(|task| {
                let supervisor = supervisor.clone();
                tokio::spawn(async move {
                    for round in 0..5 {
                        if (task + round) % 2 == 0 {
                            supervisor.reset().await?;
                        } else {
                            let outcome = supervisor.execute("1 + 1").await?;
                            assert!(
                                matches!(
                                    outcome,
                                    ExecutionOutcome::Completed | ExecutionOutcome::Cancelled
                                ),
                                "unexpected outcome: {:?}",
                                outcome
                            );
                        }
                    }
                    Ok::<(), Error>(())
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let outcome = supervisor.execute("1 + 1").await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        let current = supervisor.current_process_id().unwrap();

        // Launches cut short by a reset finish tearing down in the background.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while launcher.live_pids() != vec![current] {
            assert!(
                tokio::time::Instant::now() < deadline,
                "stale workers still alive: {:?}",
                launcher.live_pids()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_dead_worker_is_replaced() {
        let launcher = Arc::new(InProcessLauncher::new());
        let supervisor = supervisor(launcher.clone());

        supervisor.execute("1").await.unwrap();
        let first = supervisor.current_process_id().unwrap();
        launcher.crash_latest();
        assert!(supervisor.current_process_id().is_none());

        supervisor.execute("1").await.unwrap();
        assert_ne!(supervisor.current_process_id().unwrap(), first);
    }

    #[tokio::test]
    async fn test_dispose_rejects_calls() {
        let supervisor = supervisor(Arc::new(InProcessLauncher::new()));
        supervisor.execute("1").await.unwrap();

        supervisor.dispose();
        assert!(supervisor.is_disposed());
        assert!(matches!(supervisor.execute("1").await, Err(Error::Disposed)));
        assert!(matches!(supervisor.reset().await, Err(Error::Disposed)));
        assert!(matches!(supervisor.warm_up(), Err(Error::Disposed)));
        assert!(supervisor.current_process_id().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_tears_down_running_script() {
        let launcher = Arc::new(InProcessLauncher::new());
        let supervisor = supervisor(launcher.clone());
        supervisor.execute("1").await.unwrap();
        let first = supervisor.current_process_id().unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.execute_with_cancel("while (true) {}", &cancel),
        )
        .await
        .expect("cancellation should end the call")
        .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Cancelled);

        supervisor.execute("1 + 1").await.unwrap();
        assert_ne!(supervisor.current_process_id().unwrap(), first);
    }

    #[tokio::test]
    async fn test_large_output_keeps_worker_usable() {
        let supervisor = supervisor(Arc::new(InProcessLauncher::new()));
        let mut rx = supervisor.subscribe();
        let code = "string s = \"x\";\nint i = 0;\nwhile (i < 21) { s = s + s; i = i + 1; }\n\
                    int n = 0;\nwhile (n < 12) { println(s); n = n + 1; }\ns";

        let outcome = supervisor.execute(code).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let mut batches = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            batches.push(batch);
        }
        assert!(batches.len() >= 2, "expected the output to span batches");
        let events: Vec<ResultEvent> = batches.into_iter().flatten().collect();
        assert_eq!(events.len(), 13);
        assert!(events
            .iter()
            .all(|event| event.payload_len() < crate::result::MAX_EVENT_TEXT + 64));

        let outcome = supervisor.execute("1 + 1").await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(drain(&mut rx), vec![ResultEvent::value("int", "2")]);
    }

    #[tokio::test]
    async fn test_compile_and_save_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor(Arc::new(InProcessLauncher::new()));
        let path = dir.path().join("out.padc");

        let err = supervisor
            .compile_and_save("int x = ;", path.to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CompilationDiagnostics(ref d) if !d.is_empty()));
        assert!(!path.exists());

        supervisor
            .compile_and_save("1 + 1", path.to_str().unwrap())
            .await
            .unwrap();
        assert!(path.exists());
    }
}
