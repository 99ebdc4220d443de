//! runbox CLI - run untrusted scripts in killable worker processes.

mod colors;
mod launch;
mod run;
mod serve;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use runbox_core::Outcome;

use crate::run::RunOptions;

#[derive(Parser)]
#[command(name = "runbox")]
#[command(about = "Run scripts in isolated, cancellable worker processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script once and print its outcome
    Run {
        /// Path to the script
        script: String,

        /// Interpreter the worker loads as its runtime
        #[arg(long, default_value = "sh")]
        runtime: String,

        /// Path to the runbox-worker binary
        #[arg(long)]
        worker: Option<PathBuf>,

        /// Cancel the run after this many seconds
        #[arg(long)]
        timeout: Option<f64>,

        /// Give up if the worker is not ready after this many seconds
        #[arg(long, default_value = "10")]
        init_timeout: f64,
    },

    /// Start the WebSocket playground server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host address to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Interpreter every session's worker loads as its runtime
        #[arg(long, default_value = "sh")]
        runtime: String,

        /// Path to the runbox-worker binary
        #[arg(long)]
        worker: Option<PathBuf>,
    },

    /// Serve the worker protocol on stdin/stdout
    #[command(hide = true)]
    Worker,
}

fn seconds(value: f64, flag: &str) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| anyhow::anyhow!("--{} must be a non-negative number of seconds", flag))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
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
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format runbox errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(core_err) = err.downcast_ref::<runbox_core::Error>() {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else if let Some(runbox_server::ServerError::Core(core_err)) =
            err.downcast_ref::<runbox_server::ServerError>()
        {
            anyhow::anyhow!("{}", core_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run {
            script,
            runtime,
            worker,
            timeout,
            init_timeout,
        } => {
            let options = RunOptions {
                runtime,
                worker,
                timeout: timeout.map(|t| seconds(t, "timeout")).transpose()?,
                init_timeout: seconds(init_timeout, "init-timeout")?,
            };
            let outcome = run::execute(&script, options).await.map_err(format_error)?;
            return Ok(match outcome {
                Outcome::Success { .. } => ExitCode::SUCCESS,
                Outcome::Failure { .. } => ExitCode::from(1),
                Outcome::Cancelled => ExitCode::from(2),
            });
        }

        Commands::Serve {
            port,
            host,
            runtime,
            worker,
        } => {
            serve::execute(host, port, runtime, worker)
                .await
                .map_err(format_error)?;
        }

        Commands::Worker => launch::serve_worker()?,
    }

    Ok(ExitCode::SUCCESS)
}
