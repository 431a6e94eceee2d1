//! Interactive read-eval-print loop.
//!
//! Every entry runs in the same worker, so globals declared by references
//! survive between entries. Ctrl-C cancels the running entry by resetting
//! the worker.

use std::io::BufRead;
use std::sync::Arc;

use scriptpad_core::ExecutionOutcome;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::colors;
use crate::output::{Printer, print_exception};
use crate::run::{ScriptOptions, execute_streaming};

const PROMPT: &str = "pad> ";

/// What a line of input asks for.
#[derive(Debug, PartialEq)]
enum Command<'a> {
    Quit,
    Reset,
    Help,
    Skip,
    Code(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    match line.trim() {
        "" => Command::Skip,
        ":quit" | ":q" | ":exit" => Command::Quit,
        ":reset" => Command::Reset,
        ":help" | ":h" => Command::Help,
        _ => Command::Code(line),
    }
}

/// Start the REPL and run until `:quit` or end of input.
pub async fn execute(options: &ScriptOptions) -> anyhow::Result<()> {
    let directory = std::env::current_dir()?;
    let supervisor = options.supervisor(&directory)?;
    let mut events = supervisor.subscribe();
    supervisor.warm_up()?;

    let interrupts = Arc::new(Notify::new());
    let notifier = interrupts.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            notifier.notify_waiters();
        }
    });

    let mut lines = spawn_line_reader();
    println!(
        "{}scriptpad{} - type {}:help{} for commands",
        colors::BOLD,
        colors::RESET,
        colors::CYAN,
        colors::RESET
    );

    loop {
        print!("{}", PROMPT);
        colors::flush_stdout();
        let Some(line) = lines.recv().await else {
            println!();
            break;
        };

        match parse_command(&line) {
            Command::Skip => {}
            Command::Quit => break,
            Command::Help => print_help(),
            Command::Reset => match supervisor.reset().await {
                Ok(()) => println!("{}Worker reset{}", colors::DIM, colors::RESET),
                Err(e) => eprintln!("{}{}{}", colors::RED, e.with_hint(), colors::RESET),
            },
            Command::Code(code) => {
                let cancel = CancellationToken::new();
                let guard = cancel.clone();
                let interrupts = interrupts.clone();
                let watcher = tokio::spawn(async move {
                    interrupts.notified().await;
                    guard.cancel();
                });

                let mut printer = Printer::default();
                let outcome =
                    execute_streaming(&supervisor, &mut events, &mut printer, code, &cancel).await;
                watcher.abort();

                match outcome {
                    Ok(ExecutionOutcome::Completed) => {}
                    Ok(ExecutionOutcome::Exception(exception)) => print_exception(&exception),
                    Ok(ExecutionOutcome::Cancelled) => {
                        eprintln!("{}Cancelled{}", colors::YELLOW, colors::RESET)
                    }
                    Err(e) => eprintln!("{}{}{}", colors::RED, e.with_hint(), colors::RESET),
                }
            }
        }
    }

    supervisor.dispose();
    Ok(())
}

fn print_help() {
    println!("  {}:reset{}  restart the worker", colors::CYAN, colors::RESET);
    println!("  {}:quit{}   leave the REPL", colors::CYAN, colors::RESET);
    println!("  Ctrl-C   cancel the running entry");
}

/// Read stdin lines on a plain thread; the channel closes at end of input.
fn spawn_line_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
