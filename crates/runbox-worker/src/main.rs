//! Runbox worker process.
//!
//! Spawned by the execution broker. Speaks the framed protocol on
//! stdin/stdout and logs to stderr.

use std::io::{BufReader, BufWriter};

use runbox_worker::CommandLoader;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = BufWriter::new(stdout.lock());

    tracing::debug!(pid = std::process::id(), "worker started");
    runbox_worker::serve(&mut reader, &mut writer, CommandLoader)?;

    Ok(())
}
