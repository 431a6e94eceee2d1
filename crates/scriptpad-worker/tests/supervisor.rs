//! End-to-end tests driving real `scriptpad-worker` processes.

use std::time::Duration;

use scriptpad_core::worker::{is_process_alive, wait_for_exit};
use scriptpad_core::{
    Error, ExecutionOutcome, HostSupervisor, InitializationParams, OutputStream, ResultEvent,
    SupervisorConfig,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn config() -> SupervisorConfig {
    SupervisorConfig::default().with_worker_path(env!("CARGO_BIN_EXE_scriptpad-worker"))
}

fn supervisor_with(params: InitializationParams) -> HostSupervisor {
    HostSupervisor::new(config(), params)
}

fn supervisor() -> HostSupervisor {
    supervisor_with(InitializationParams::default())
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Vec<ResultEvent>>) -> Vec<ResultEvent> {
    let mut events = Vec::new();
    while let Ok(batch) = rx.try_recv() {
        events.extend(batch);
    }
    events
}

async fn gone(pid: u32) {
    tokio::time::timeout(
        Duration::from_secs(5),
        wait_for_exit(pid, Duration::from_millis(20)),
    )
    .await
    .unwrap_or_else(|_| panic!("worker {} should have exited", pid));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_plus_one() {
    let supervisor = supervisor();
    let mut rx = supervisor.subscribe();

    let outcome = supervisor.execute("1+1").await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed);
    assert_eq!(drain(&mut rx), vec![ResultEvent::value("int", "2")]);

    let pid = supervisor.current_process_id().unwrap();
    assert_ne!(pid, std::process::id());
    supervisor.dispose();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_statement_without_value() {
    let supervisor = supervisor();
    let mut rx = supervisor.subscribe();

    let outcome = supervisor.execute("var x = 1;").await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed);
    // Only the unused-variable warning, no value.
    assert!(drain(&mut rx).iter().all(|event| !event.is_value()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_compile_error_blocks_execution() {
    let supervisor = supervisor();
    let mut rx = supervisor.subscribe();

    let outcome = supervisor
        .execute("println(\"side effect\");\nint x = ;")
        .await
        .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed);

    let events = drain(&mut rx);
    assert!(events.iter().any(|event| matches!(
        event,
        ResultEvent::Diagnostic(diagnostic) if diagnostic.is_error()
    )));
    assert!(
        events
            .iter()
            .all(|event| !matches!(event, ResultEvent::Output { .. })),
        "nothing may run when compilation fails"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_output_and_exception() {
    let supervisor = supervisor();
    let mut rx = supervisor.subscribe();

    let outcome = supervisor
        .execute("println(\"before\");\nthrow \"boom\";")
        .await
        .unwrap();
    let exception = outcome.exception().expect("exception outcome");
    assert_eq!(exception.message, "boom");
    assert!(matches!(
        outcome.into_result(),
        Err(Error::ExecutionException(_))
    ));

    assert_eq!(
        drain(&mut rx),
        vec![ResultEvent::Output {
            stream: OutputStream::Stdout,
            text: "before".to_string(),
        }]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_infinite_loop() {
    let supervisor = supervisor();
    supervisor.execute("1").await.unwrap();
    let first = supervisor.current_process_id().unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        supervisor.execute_with_cancel("while(true){}", &cancel),
    )
    .await
    .expect("cancellation should end the call")
    .unwrap();
    assert_eq!(outcome, ExecutionOutcome::Cancelled);
    gone(first).await;

    let mut rx = supervisor.subscribe();
    supervisor.execute("1+1").await.unwrap();
    assert_eq!(drain(&mut rx), vec![ResultEvent::value("int", "2")]);
    assert_ne!(supervisor.current_process_id().unwrap(), first);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reset_spawns_new_process() {
    let supervisor = supervisor();
    supervisor.execute("1").await.unwrap();
    let first = supervisor.current_process_id().unwrap();

    supervisor.reset().await.unwrap();
    gone(first).await;

    supervisor.execute("1").await.unwrap();
    let second = supervisor.current_process_id().unwrap();
    assert_ne!(first, second);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_killed_worker_is_replaced() {
    let supervisor = supervisor();
    supervisor.execute("1").await.unwrap();
    let first = supervisor.current_process_id().unwrap();

    std::process::Command::new("kill")
        .arg("-9")
        .arg(first.to_string())
        .status()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while supervisor.current_process_id().is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("supervisor should notice the dead worker");

    let outcome = supervisor.execute("2").await.unwrap();
    assert_eq!(outcome, ExecutionOutcome::Completed);
    assert_ne!(supervisor.current_process_id().unwrap(), first);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_compile_and_save() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor_with(InitializationParams {
        working_directory: dir.path().display().to_string(),
        ..InitializationParams::default()
    });

    supervisor
        .compile_and_save("Math.max(2, 3)", "out/program.padc")
        .await
        .unwrap();
    assert!(dir.path().join("out/program.padc").exists());

    let err = supervisor
        .compile_and_save("int x = ;", "broken.padc")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CompilationDiagnostics(_)));
    assert!(!dir.path().join("broken.padc").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_references_and_imports() {
    let dir = tempfile::tempdir().unwrap();
    let library = dir.path().join("lib.pad");
    std::fs::write(&library, "int answer = 42;\n").unwrap();

    let supervisor = supervisor_with(InitializationParams {
        references: vec![library.display().to_string()],
        imports: vec!["Math".to_string()],
        ..InitializationParams::default()
    });
    let mut rx = supervisor.subscribe();

    supervisor.execute("max(answer, 7)").await.unwrap();
    assert_eq!(drain(&mut rx), vec![ResultEvent::value("int", "42")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_streams_large_output_in_batches() {
    let supervisor = supervisor();
    let mut rx = supervisor.subscribe();

    supervisor
        .execute("int i = 0;\nwhile (i < 12000) { println(i); i = i + 1; }")
        .await
        .unwrap();

    let mut batches = Vec::new();
    while let Ok(batch) = rx.try_recv() {
        batches.push(batch);
    }
    assert!(batches.len() >= 2);
    assert!(batches.iter().all(|batch| batch.len() <= 10_000));

    let lines: Vec<String> = batches
        .into_iter()
        .flatten()
        .filter_map(|event| match event {
            ResultEvent::Output { text, .. } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(lines.len(), 12_000);
    assert_eq!(lines.first().map(String::as_str), Some("0"));
    assert_eq!(lines.last().map(String::as_str), Some("11999"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dispose_kills_worker() {
    let supervisor = supervisor();
    supervisor.execute("1").await.unwrap();
    let pid = supervisor.current_process_id().unwrap();
    assert!(is_process_alive(pid));

    supervisor.dispose();
    gone(pid).await;
    assert!(matches!(supervisor.execute("1").await, Err(Error::Disposed)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unlaunchable_worker_is_unavailable() {
    let supervisor = HostSupervisor::new(
        SupervisorConfig::default().with_worker_path("/bin/false"),
        InitializationParams::default(),
    );
    let err = supervisor.execute("1").await.unwrap_err();
    assert!(matches!(err, Error::WorkerUnavailable { attempts: 2 }));
}
