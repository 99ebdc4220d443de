//! Serve command implementation for runbox CLI.
//!
//! Starts the WebSocket playground server.

use std::path::PathBuf;

use runbox_server::ServerConfig;

use crate::{colors, launch};

/// Start the playground server.
pub async fn execute(
    host: String,
    port: u16,
    runtime: String,
    worker: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = ServerConfig {
        host,
        port,
        broker: launch::broker_config(runtime, worker)?,
    };

    println!(
        "\n{}runbox Server{} - Sandboxed Playground",
        colors::BOLD,
        colors::RESET
    );
    println!("{}", "─".repeat(50));
    println!(
        "{}  ◆ Runtime:{} {}",
        colors::CYAN,
        colors::RESET,
        config.broker.runtime_location
    );
    if let Some(worker) = &config.broker.worker_path {
        println!(
            "{}  ◆ Worker:{} {} {}",
            colors::CYAN,
            colors::RESET,
            worker.display(),
            config.broker.worker_args.join(" ")
        );
    }
    println!(
        "{}  ◆ Server:{} http://{}:{}",
        colors::CYAN,
        colors::RESET,
        config.host,
        config.port
    );
    println!(
        "{}  ◆ WebSocket:{} ws://{}:{}/ws",
        colors::CYAN,
        colors::RESET,
        config.host,
        config.port
    );
    println!("{}", "─".repeat(50));
    println!("{}Press Ctrl+C to stop{}", colors::GREEN, colors::RESET);
    println!();

    runbox_server::serve(config).await?;

    Ok(())
}
