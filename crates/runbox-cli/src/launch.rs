//! Worker selection for the CLI.
//!
//! Without `--worker`, `runbox` starts copies of itself in worker mode, so
//! the single binary is enough to run scripts.

use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use runbox_core::BrokerConfig;
use runbox_worker::CommandLoader;

/// Subcommand that switches `runbox` into worker mode.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Broker settings for `runtime`, launching `worker` or this executable.
pub fn broker_config(runtime: String, worker: Option<PathBuf>) -> anyhow::Result<BrokerConfig> {
    let (worker_path, worker_args) = match worker {
        Some(path) => (path, Vec::new()),
        None => (std::env::current_exe()?, vec![WORKER_SUBCOMMAND.to_string()]),
    };
    tracing::debug!(worker = %worker_path.display(), ?worker_args, "worker selected");

    Ok(BrokerConfig {
        runtime_location: runtime,
        worker_path: Some(worker_path),
        worker_args,
    })
}

/// Worker mode: speak the protocol on stdin/stdout until the broker hangs up.
pub fn serve_worker() -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = BufWriter::new(stdout.lock());

    runbox_worker::serve(&mut reader, &mut writer, CommandLoader)?;
    Ok(())
}
