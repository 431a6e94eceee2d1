//! scriptpad CLI - run pad-script snippets in an isolated worker process.

mod colors;
mod output;
mod repl;
mod run;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use run::ScriptOptions;

#[derive(Parser)]
#[command(name = "scriptpad")]
#[command(about = "Run pad-script snippets in an isolated worker process")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct ScriptArgs {
    /// Reference script run before every submission (repeatable)
    #[arg(short, long = "reference")]
    references: Vec<String>,

    /// Builtin namespace whose functions may be called unqualified (repeatable)
    #[arg(short, long = "import")]
    imports: Vec<String>,

    /// Path to the scriptpad-worker binary
    #[arg(long)]
    worker: Option<PathBuf>,
}

impl From<ScriptArgs> for ScriptOptions {
    fn from(args: ScriptArgs) -> Self {
        Self {
            references: args.references,
            imports: args.imports,
            worker: args.worker,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script in a worker process
    Run {
        /// Path to the script (.pad file)
        script: String,

        #[command(flatten)]
        options: ScriptArgs,
    },

    /// Compile a script and report diagnostics without running it
    Check {
        /// Path to the script (.pad file)
        script: String,

        #[command(flatten)]
        options: ScriptArgs,
    },

    /// Compile a script to a program artifact
    Compile {
        /// Path to the script (.pad file)
        script: String,

        /// Output path (defaults to the script path with a .padc extension)
        #[arg(short, long)]
        output: Option<String>,

        #[command(flatten)]
        options: ScriptArgs,
    },

    /// Start an interactive session
    Repl {
        #[command(flatten)]
        options: ScriptArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
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

    // Helper to format scriptpad-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<scriptpad_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run { script, options } => {
            run::execute(&script, &options.into()).await.map_err(format_error)?;
        }

        Commands::Check { script, options } => {
            run::check(&script, &options.into()).map_err(format_error)?;
        }

        Commands::Compile {
            script,
            output,
            options,
        } => {
            run::compile(&script, output.as_deref(), &options.into())
                .await
                .map_err(format_error)?;
        }

        Commands::Repl { options } => {
            repl::execute(&options.into()).await.map_err(format_error)?;
        }
    }

    Ok(())
}
