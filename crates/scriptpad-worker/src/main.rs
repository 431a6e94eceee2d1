//! scriptpad-worker - runs pad-script snippets on behalf of a supervisor.
//!
//! The supervisor starts this process with a socket address, a handshake
//! token and its own pid. The worker serves exactly one supervisor
//! connection and then exits. It also exits, without waiting for running
//! scripts, when the supervisor disappears or sends `Abort`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::UnixListener;

use scriptpad_core::worker::{WorkerService, is_process_alive, serve, wait_for_exit};

/// Time given to in-flight responses after an abort before the process exits.
const ABORT_GRACE: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "scriptpad-worker")]
#[command(about = "Worker process for scriptpad (started by the supervisor)")]
#[command(version)]
struct Args {
    /// Unix socket path to listen on
    #[arg(long)]
    address: PathBuf,

    /// Token the supervisor must present when connecting
    #[arg(long)]
    token: String,

    /// Pid of the supervisor; the worker exits once it is gone
    #[arg(long)]
    parent_pid: u32,

    /// How often to check that the supervisor is alive
    #[arg(long, default_value = "500")]
    liveness_interval_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    // Logs go to stderr; stdout belongs to nobody.
    let filter = if args.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(&args) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };
    let _ = std::fs::remove_file(&args.address);

    // Exit without joining the execution thread: a script stuck in a loop
    // must not keep the process alive.
    std::process::exit(code);
}

fn run(args: &Args) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(serve_supervisor(args));
    // Do not wait for tasks still blocked on the connection.
    runtime.shutdown_background();
    result
}

async fn serve_supervisor(args: &Args) -> anyhow::Result<()> {
    if !is_process_alive(args.parent_pid) {
        anyhow::bail!("supervisor process {} is not running", args.parent_pid);
    }

    let listener = bind(&args.address)?;
    tracing::debug!("Listening on {}", args.address.display());

    let service = Arc::new(WorkerService::default());
    let terminate = service.termination_token();
    let interval = Duration::from_millis(args.liveness_interval_ms.max(1));

    tokio::select! {
        _ = wait_for_exit(args.parent_pid, interval) => {
            tracing::warn!("Supervisor {} exited, shutting down", args.parent_pid);
        }
        _ = async {
            terminate.cancelled().await;
            tokio::time::sleep(ABORT_GRACE).await;
        } => {
            tracing::debug!("Aborted by supervisor");
        }
        result = accept_session(&listener, &args.token, service.clone()) => {
            result?;
            tracing::debug!("Session ended");
        }
    }
    Ok(())
}

fn bind(address: &Path) -> anyhow::Result<UnixListener> {
    if address.exists() {
        std::fs::remove_file(address)
            .with_context(|| format!("Failed to remove stale socket {}", address.display()))?;
    }
    UnixListener::bind(address)
        .with_context(|| format!("Failed to bind {}", address.display()))
}

/// Accept connections until one presents the right token, then serve it
/// until it closes.
async fn accept_session(
    listener: &UnixListener,
    token: &str,
    service: Arc<WorkerService>,
) -> anyhow::Result<()> {
    let pid = std::process::id();
    loop {
        let (stream, _addr) = listener.accept().await.context("Failed to accept connection")?;
        match serve(stream, token, pid, service.clone()).await {
            Ok(()) => return Ok(()),
            Err(e @ (scriptpad_core::Error::ConnectFailure(_) | scriptpad_core::Error::Protocol(_))) => {
                tracing::warn!("Rejected connection: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "scriptpad-worker",
            "--address",
            "/tmp/w.sock",
            "--token",
            "abc",
            "--parent-pid",
            "42",
        ])
        .unwrap();
        assert_eq!(args.address, PathBuf::from("/tmp/w.sock"));
        assert_eq!(args.token, "abc");
        assert_eq!(args.parent_pid, 42);
        assert_eq!(args.liveness_interval_ms, 500);
        assert!(!args.verbose);
    }

    #[test]
    fn test_args_require_token() {
        assert!(
            Args::try_parse_from(["scriptpad-worker", "--address", "/tmp/w.sock", "--parent-pid", "1"])
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.sock");
        std::fs::write(&path, b"stale").unwrap();

        let _listener = bind(&path).unwrap();
        assert!(tokio::net::UnixStream::connect(&path).await.is_ok());
    }
}
