//! Run, check and compile commands.
//!
//! `run` and `compile` go through a worker process; `check` compiles in
//! process since nothing user-written executes.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use scriptpad_core::script::{self, CompileOptions};
use scriptpad_core::{
    ExecutionOutcome, HostSupervisor, InitializationParams, ResultEvent, SupervisorConfig,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::colors;
use crate::output::{Printer, print_diagnostic, print_exception};

/// Options shared by every command that compiles a script.
pub struct ScriptOptions {
    pub references: Vec<String>,
    pub imports: Vec<String>,
    pub worker: Option<PathBuf>,
}

impl ScriptOptions {
    fn params(&self, working_directory: &Path) -> InitializationParams {
        InitializationParams {
            references: self.references.clone(),
            imports: self.imports.clone(),
            working_directory: working_directory.display().to_string(),
            ..InitializationParams::default()
        }
    }

    /// A supervisor whose workers resolve paths against `working_directory`.
    pub fn supervisor(&self, working_directory: &Path) -> anyhow::Result<HostSupervisor> {
        let mut config = SupervisorConfig::from_env()?;
        if let Some(worker) = &self.worker {
            config = config.with_worker_path(worker);
        }
        Ok(HostSupervisor::new(config, self.params(working_directory)))
    }
}

/// Run a script file in a worker.
pub async fn execute(script_path: &str, options: &ScriptOptions) -> anyhow::Result<()> {
    let start = Instant::now();
    let (code, directory) = read_script(script_path)?;
    let supervisor = options.supervisor(&directory)?;
    let mut events = supervisor.subscribe();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let mut printer = Printer::default();
    let outcome = execute_streaming(&supervisor, &mut events, &mut printer, &code, &cancel).await;
    supervisor.dispose();
    let outcome = outcome?;

    if printer.errors() > 0 {
        anyhow::bail!("{} compilation error(s)", printer.errors());
    }
    match outcome {
        ExecutionOutcome::Completed => {
            tracing::debug!("Completed in {:.2}s", start.elapsed().as_secs_f64());
            Ok(())
        }
        ExecutionOutcome::Exception(exception) => {
            print_exception(&exception);
            anyhow::bail!("script raised {}", exception.type_name)
        }
        ExecutionOutcome::Cancelled => {
            eprintln!("{}Cancelled{}", colors::YELLOW, colors::RESET);
            anyhow::bail!("execution cancelled")
        }
    }
}

/// Compile a script without running it and report diagnostics.
pub fn check(script_path: &str, options: &ScriptOptions) -> anyhow::Result<()> {
    let (code, directory) = read_script(script_path)?;
    let compile_options = CompileOptions::from_params(&options.params(&directory));
    let compilation = script::compile(&code, &compile_options);

    for diagnostic in &compilation.diagnostics {
        print_diagnostic(diagnostic);
    }
    if compilation.has_errors() {
        anyhow::bail!("{} compilation error(s)", compilation.errors().len());
    }
    println!("{}No errors{} in {}", colors::GREEN, colors::RESET, script_path);
    Ok(())
}

/// Compile a script in a worker and save the program artifact.
pub async fn compile(
    script_path: &str,
    output: Option<&str>,
    options: &ScriptOptions,
) -> anyhow::Result<()> {
    let (code, directory) = read_script(script_path)?;
    let output = match output {
        Some(path) => PathBuf::from(path),
        None => Path::new(script_path).with_extension("padc"),
    };
    let output = std::path::absolute(&output)
        .with_context(|| format!("Invalid output path {}", output.display()))?;

    let supervisor = options.supervisor(&directory)?;
    let mut events = supervisor.subscribe();
    let result = supervisor
        .compile_and_save(&code, &output.display().to_string())
        .await;
    supervisor.dispose();

    let mut printer = Printer::default();
    while let Ok(batch) = events.try_recv() {
        printer.print_batch(&batch);
    }

    match result {
        Ok(()) => {
            println!(
                "{}Compiled{} {} -> {}",
                colors::GREEN,
                colors::RESET,
                script_path,
                output.display()
            );
            Ok(())
        }
        Err(scriptpad_core::Error::CompilationDiagnostics(errors)) => {
            anyhow::bail!("{} compilation error(s)", errors.len())
        }
        Err(e) => Err(e.into()),
    }
}

/// Run `code`, printing streamed events while the call is in flight.
pub async fn execute_streaming(
    supervisor: &HostSupervisor,
    events: &mut mpsc::UnboundedReceiver<Vec<ResultEvent>>,
    printer: &mut Printer,
    code: &str,
    cancel: &CancellationToken,
) -> scriptpad_core::Result<ExecutionOutcome> {
    let execution = supervisor.execute_with_cancel(code, cancel);
    tokio::pin!(execution);

    let outcome = loop {
        tokio::select! {
            biased;
            Some(batch) = events.recv() => printer.print_batch(&batch),
            outcome = &mut execution => break outcome,
        }
    };
    // Batches pushed before the response are already queued.
    while let Ok(batch) = events.try_recv() {
        printer.print_batch(&batch);
    }
    outcome
}

fn read_script(script_path: &str) -> anyhow::Result<(String, PathBuf)> {
    let path = Path::new(script_path);
    let code = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    let directory = std::path::absolute(path)?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((code, directory))
}
