//! The worker-side service: compiles and runs submissions.
//!
//! # Lifecycle
//!
//! `Uninitialized → Initializing → Ready ⇄ Executing`, and `Dead` once
//! aborted. Requests run concurrently (the server spawns a task per request)
//! so `Abort` is served while an `Execute` is in flight. Script code itself
//! runs on a dedicated OS thread per execution, never on the runtime.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::StreamerConfig;
use crate::error::{Error, Result};
use crate::ipc::{PushSender, Request, Response};
use crate::result::{ExceptionInfo, ExecutionOutcome, InitializationParams, OutputStream, ResultEvent};
use crate::script::{self, CompileOptions, CompiledScript, ScriptHost, Value};

use super::streamer::{ResultQueue, ResultStreamer};
use super::writer::OutputWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    Dead,
}

struct Lifecycle {
    state: ServiceState,
    in_flight: usize,
}

/// State fixed by `Initialize`.
struct Session {
    options: CompileOptions,
    streamer: ResultStreamer,
}

pub struct WorkerService {
    streamer_config: StreamerConfig,
    lifecycle: Mutex<Lifecycle>,
    session: OnceLock<Session>,
    /// Set by `abort`; the hosting process exits once it fires.
    terminate: CancellationToken,
    /// Polled by running scripts so in-process hosts can stop them too.
    interrupt: Arc<AtomicBool>,
    executions: AtomicU64,
}

impl Default for WorkerService {
    fn default() -> Self {
        Self::new(StreamerConfig::default())
    }
}

impl WorkerService {
    pub fn new(streamer_config: StreamerConfig) -> Self {
        Self {
            streamer_config,
            lifecycle: Mutex::new(Lifecycle {
                state: ServiceState::Uninitialized,
                in_flight: 0,
            }),
            session: OnceLock::new(),
            terminate: CancellationToken::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            executions: AtomicU64::new(0),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle().state
    }

    /// Fires when the service has been aborted and the process should exit.
    pub fn termination_token(&self) -> CancellationToken {
        self.terminate.clone()
    }

    /// Number of programs actually started (compile failures excluded).
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::SeqCst)
    }

    /// Route one request.
    pub async fn dispatch(&self, request: Request, push: &PushSender) -> Result<Response> {
        match request {
            Request::Initialize(params) => {
                self.initialize(params, push.clone())?;
                Ok(Response::Ack)
            }
            Request::Execute { code } => self.execute(&code).await.map(Response::Outcome),
            Request::CompileAndSave { code, path } => self.compile_and_save(&code, &path).await,
            Request::Abort => {
                self.abort();
                Ok(Response::Ack)
            }
        }
    }

    /// Store compile options and capture the push channel. Only the first
    /// call succeeds.
    pub fn initialize(&self, params: InitializationParams, push: PushSender) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != ServiceState::Uninitialized {
                return Err(Error::Remote("worker is already initialized".to_string()));
            }
            lifecycle.state = ServiceState::Initializing;
        }

        let options = CompileOptions::from_params(&params);
        let streamer = ResultStreamer::spawn(self.streamer_config, push);
        let session = Session { options, streamer };

        let _ = self.session.set(session);
        tracing::debug!(
            "Initialized with {} reference(s), imports {:?}",
            params.references.len(),
            params.imports
        );

        let mut lifecycle = self.lifecycle();
        if lifecycle.state == ServiceState::Initializing {
            lifecycle.state = ServiceState::Ready;
        }
        Ok(())
    }

    fn enter(&self) -> Result<(InFlight<'_>, &Session)> {
        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            ServiceState::Dead => return Err(Error::Remote("worker has been aborted".to_string())),
            ServiceState::Uninitialized | ServiceState::Initializing => {
                return Err(Error::Remote("worker is not initialized".to_string()));
            }
            ServiceState::Ready | ServiceState::Executing => {}
        }
        let session = self
            .session
            .get()
            .ok_or_else(|| Error::Remote("worker is not initialized".to_string()))?;
        lifecycle.state = ServiceState::Executing;
        lifecycle.in_flight += 1;
        Ok((InFlight { service: self }, session))
    }

    /// Compile and run a submission.
    ///
    /// Compile errors are streamed as `Diagnostic` events and the call
    /// completes without running anything. A produced value is streamed as
    /// one `Value` event; a fault is returned as `Exception`. All events
    /// are pushed before this returns.
    pub async fn execute(&self, code: &str) -> Result<ExecutionOutcome> {
        let (_in_flight, session) = self.enter()?;
        let flush = session.streamer.begin();
        let queue = session.streamer.queue();

        let compilation = script::compile(code, &session.options);
        let outcome = match compilation.program {
            Some(program) => self.run(program, &queue).await,
            None => {
                for diagnostic in compilation.diagnostics {
                    queue.enqueue(ResultEvent::Diagnostic(diagnostic));
                }
                Ok(ExecutionOutcome::Completed)
            }
        };

        flush.finish().await;
        outcome
    }

    /// Run `program` on its own thread. Console output is captured by
    /// writers owned by this execution, so partial lines never mix with
    /// those of a concurrent call.
    async fn run(&self, program: CompiledScript, queue: &ResultQueue) -> Result<ExecutionOutcome> {
        let stdout = Arc::new(OutputWriter::new(OutputStream::Stdout, queue.clone()));
        let stderr = Arc::new(OutputWriter::new(OutputStream::Stderr, queue.clone()));
        let host = ExecutionHost {
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            queue: queue.clone(),
        };
        let interrupt = self.interrupt.clone();
        let (tx, rx) = oneshot::channel();

        self.executions.fetch_add(1, Ordering::SeqCst);
        std::thread::Builder::new()
            .name("scriptpad-exec".to_string())
            .spawn(move || {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    script::run(&program, &host, &interrupt)
                }));
                let _ = tx.send(result);
            })?;

        let result = rx.await;
        stdout.flush();
        stderr.flush();

        let outcome = match result {
            Ok(Ok(Ok(Some(value)))) => {
                queue.enqueue(value_event(&value, None));
                ExecutionOutcome::Completed
            }
            Ok(Ok(Ok(None))) => ExecutionOutcome::Completed,
            Ok(Ok(Err(exception))) => ExecutionOutcome::Exception(exception.bounded()),
            Ok(Err(panic)) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "execution engine panicked".to_string());
                ExecutionOutcome::Exception(
                    ExceptionInfo::new("EngineFaultException", message).bounded(),
                )
            }
            Err(_) => ExecutionOutcome::Exception(ExceptionInfo::new(
                "EngineFaultException",
                "execution thread exited without a result",
            )),
        };
        Ok(outcome)
    }

    /// Compile a submission and persist the program to `path` (relative
    /// paths resolve against the working directory). Diagnostics are
    /// streamed either way; Error diagnostics prevent writing.
    pub async fn compile_and_save(&self, code: &str, path: &str) -> Result<Response> {
        let (_in_flight, session) = self.enter()?;
        let flush = session.streamer.begin();
        let queue = session.streamer.queue();

        let compilation = script::compile(code, &session.options);
        let errors = compilation.errors();
        for diagnostic in compilation.diagnostics {
            queue.enqueue(ResultEvent::Diagnostic(diagnostic));
        }

        let response = match compilation.program {
            Some(program) => {
                let target = session.options.resolve(Path::new(path));
                program.save(&target).map(|_| {
                    tracing::debug!("Saved program to {}", target.display());
                    Response::Saved
                })
            }
            None => Ok(Response::NotSaved { errors }),
        };

        flush.finish().await;
        response
    }

    /// Mark the service dead and request process termination.
    pub fn abort(&self) {
        self.lifecycle().state = ServiceState::Dead;
        self.interrupt.store(true, Ordering::SeqCst);
        self.terminate.cancel();
        tracing::info!("Abort requested");
    }
}

/// Decrements the in-flight count when a request finishes.
struct InFlight<'a> {
    service: &'a WorkerService,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut lifecycle = self.service.lifecycle();
        lifecycle.in_flight = lifecycle.in_flight.saturating_sub(1);
        if lifecycle.in_flight == 0 && lifecycle.state == ServiceState::Executing {
            lifecycle.state = ServiceState::Ready;
        }
    }
}

fn value_event(value: &Value, header: Option<&str>) -> ResultEvent {
    ResultEvent::Value {
        header: header.map(str::to_string),
        type_name: value.type_name().to_string(),
        display: value.to_string(),
    }
}

/// Routes script output into the worker's writers and result queue.
struct ExecutionHost {
    stdout: Arc<OutputWriter>,
    stderr: Arc<OutputWriter>,
    queue: ResultQueue,
}

impl ScriptHost for ExecutionHost {
    fn write(&self, stream: OutputStream, text: &str) {
        match stream {
            OutputStream::Stdout => self.stdout.write(text),
            OutputStream::Stderr => self.stderr.write(text),
        }
    }

    fn dump(&self, value: &Value, header: Option<&str>) {
        // Keep console lines written before the dump ahead of it.
        self.stdout.flush();
        self.stderr.flush();
        self.queue.enqueue(value_event(value, header));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Frame, FrameReceiver, Push};
    use crate::result::Severity;

    struct Harness {
        service: WorkerService,
        push: PushSender,
        frames: FrameReceiver,
    }

    impl Harness {
        fn new() -> Self {
            let (push, frames) = PushSender::pair();
            Self {
                service: WorkerService::default(),
                push,
                frames,
            }
        }

        fn initialized(params: InitializationParams) -> Self {
            let harness = Self::new();
            harness
                .service
                .initialize(params, harness.push.clone())
                .unwrap();
            harness
        }

        fn events(&mut self) -> Vec<ResultEvent> {
            drain_events(&mut self.frames)
        }
    }

    fn drain_events(frames: &mut FrameReceiver) -> Vec<ResultEvent> {
        let mut events = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            if let Frame::Push {
                body: Push::Dump(batch),
            } = frame
            {
                events.extend(batch);
            }
        }
        events
    }

    fn stdout(text: &str) -> ResultEvent {
        ResultEvent::Output {
            stream: OutputStream::Stdout,
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_requires_initialization() {
        let harness = Harness::new();
        assert_eq!(harness.service.state(), ServiceState::Uninitialized);
        let err = harness.service.execute("1").await.unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[tokio::test]
    async fn test_second_initialize_is_rejected() {
        let harness = Harness::initialized(InitializationParams::default());
        assert_eq!(harness.service.state(), ServiceState::Ready);
        let err = harness
            .service
            .initialize(InitializationParams::default(), harness.push.clone())
            .unwrap_err();
        assert!(matches!(err, Error::Remote(_)));
    }

    #[tokio::test]
    async fn test_value_is_emitted_once() {
        let mut harness = Harness::initialized(InitializationParams::default());
        let outcome = harness.service.execute("1+1").await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(harness.events(), vec![ResultEvent::value("int", "2")]);
        assert_eq!(harness.service.state(), ServiceState::Ready);
    }

    #[tokio::test]
    async fn test_no_value_without_result_expression() {
        let mut harness = Harness::initialized(InitializationParams::default());
        let outcome = harness.service.execute("int x = 1;\nx = x + 1;").await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert!(harness.events().iter().all(|e| !e.is_value()));
    }

    #[tokio::test]
    async fn test_compile_errors_block_execution() {
        let mut harness = Harness::initialized(InitializationParams::default());
        let outcome = harness.service.execute("int x = ;").await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::Completed);
        let events = harness.events();
        assert!(events.iter().any(|e| matches!(
            e,
            ResultEvent::Diagnostic(d) if d.severity == Severity::Error
        )));
        assert!(events.iter().all(|e| !e.is_value()));
        assert_eq!(harness.service.executions(), 0);
    }

    #[tokio::test]
    async fn test_output_precedes_value() {
        let mut harness = Harness::initialized(InitializationParams::default());
        harness
            .service
            .execute("print(\"partial\");\ndump(1, \"one\");\neprintln(\"err\");\n2")
            .await
            .unwrap();

        assert_eq!(
            harness.events(),
            vec![
                ResultEvent::Output {
                    stream: OutputStream::Stdout,
                    text: "partial".to_string(),
                },
                ResultEvent::Value {
                    header: Some("one".to_string()),
                    type_name: "int".to_string(),
                    display: "1".to_string(),
                },
                ResultEvent::Output {
                    stream: OutputStream::Stderr,
                    text: "err".to_string(),
                },
                ResultEvent::value("int", "2"),
            ]
        );
    }

    #[tokio::test]
    async fn test_exception_is_returned_not_streamed() {
        let mut harness = Harness::initialized(InitializationParams::default());
        let outcome = harness.service.execute("throw \"boom\";").await.unwrap();

        let exception = outcome.exception().unwrap();
        assert_eq!(exception.type_name, "Exception");
        assert_eq!(exception.message, "boom");
        assert!(harness.events().is_empty());
        assert_eq!(harness.service.executions(), 1);
    }

    #[tokio::test]
    async fn test_compile_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut harness = Harness::initialized(InitializationParams {
            working_directory: dir.path().display().to_string(),
            ..Default::default()
        });

        let response = harness
            .service
            .compile_and_save("int unused = 1;\n1+1", "out/script.spad")
            .await
            .unwrap();
        assert_eq!(response, Response::Saved);
        let saved = CompiledScript::load(&dir.path().join("out/script.spad")).unwrap();
        assert_eq!(saved.units.len(), 1);
        // Warnings are streamed even on success.
        let events = harness.events();
        assert!(matches!(events.as_slice(), [ResultEvent::Diagnostic(_)]));

        let response = harness
            .service
            .compile_and_save("int x = ;", "bad.spad")
            .await
            .unwrap();
        assert!(matches!(response, Response::NotSaved { ref errors } if errors.len() == 1));
        assert!(!dir.path().join("bad.spad").exists());
        assert_eq!(harness.service.executions(), 0);
    }

    #[tokio::test]
    async fn test_abort_marks_dead() {
        let harness = Harness::initialized(InitializationParams::default());
        let token = harness.service.termination_token();

        harness.service.abort();

        assert!(token.is_cancelled());
        assert_eq!(harness.service.state(), ServiceState::Dead);
        let err = harness.service.execute("1").await.unwrap_err();
        assert!(err.to_string().contains("aborted"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_while_executing() {
        let harness = Harness::initialized(InitializationParams::default());
        let service = Arc::new(harness.service);

        let running = service.clone();
        let execution = tokio::spawn(async move { running.execute("while (true) {}").await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(service.state(), ServiceState::Executing);
        let response = service
            .dispatch(Request::Abort, &harness.push)
            .await
            .unwrap();
        assert_eq!(response, Response::Ack);

        let outcome = execution.await.unwrap().unwrap();
        assert_eq!(
            outcome.exception().map(|e| e.type_name.as_str()),
            Some("OperationCanceledException")
        );
        assert_eq!(service.state(), ServiceState::Dead);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_partial_lines_stay_with_their_execution() {
        let Harness {
            service,
            mut frames,
            ..
        } = Harness::initialized(InitializationParams::default());
        let service = Arc::new(service);

        let running = service.clone();
        let spinning =
            tokio::spawn(async move { running.execute("print(\"left\");\nwhile (true) {}").await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let outcome = service.execute("println(\"right\");").await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);
        assert_eq!(drain_events(&mut frames), vec![stdout("right")]);

        service.abort();
        spinning.await.unwrap().unwrap();
        assert_eq!(drain_events(&mut frames), vec![stdout("left")]);
    }

    #[tokio::test]
    async fn test_huge_value_is_truncated() {
        let mut harness = Harness::initialized(InitializationParams::default());
        let code = "string s = \"x\";\nint i = 0;\nwhile (i < 21) { s = s + s; i = i + 1; }\ns";
        let outcome = harness.service.execute(code).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let events = harness.events();
        let [ResultEvent::Value { display, .. }] = events.as_slice() else {
            panic!("expected a single value, got {:?}", events.len());
        };
        assert!(display.len() < crate::result::MAX_EVENT_TEXT + 64);
        assert!(display.ends_with("bytes truncated]"));
    }
}
