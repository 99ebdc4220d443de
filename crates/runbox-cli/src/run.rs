//! Run command implementation for runbox CLI.
//!
//! Executes one script in a fresh worker and reports its outcome.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use runbox_core::ipc::WorkerEvents;
use runbox_core::{BrokerNotice, ChannelCallback, Error as CoreError, ExecutionBroker, Outcome};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{colors, launch};

/// Options for a single run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub runtime: String,
    pub worker: Option<PathBuf>,
    /// Cancel the run after this long.
    pub timeout: Option<Duration>,
    pub init_timeout: Duration,
}

/// Drives one broker from the CLI's single task.
struct Driver {
    broker: ExecutionBroker,
    events: WorkerEvents,
    notices: UnboundedReceiver<BrokerNotice>,
}

impl Driver {
    async fn next_notice(&mut self) -> Option<BrokerNotice> {
        loop {
            tokio::select! {
                biased;

                Some(notice) = self.notices.recv() => return Some(notice),
                Some(event) = self.events.recv() => self.broker.handle_event(event),
                else => return None,
            }
        }
    }

    async fn wait_ready(&mut self, limit: Duration) -> anyhow::Result<()> {
        let waited = tokio::time::timeout(limit, async {
            loop {
                match self.next_notice().await {
                    Some(BrokerNotice::ReadyChanged(true)) => return Ok(()),
                    Some(BrokerNotice::InitFailed(message)) => {
                        return Err(CoreError::Initialization(message));
                    }
                    Some(other) => tracing::debug!("ignoring {:?} while waiting for ready", other),
                    None => return Err(CoreError::WorkerTerminated),
                }
            }
        })
        .await;

        match waited {
            Ok(result) => Ok(result?),
            Err(_) => Err(CoreError::Initialization(format!(
                "worker did not become ready within {}s",
                limit.as_secs_f64()
            ))
            .into()),
        }
    }

    async fn wait_outcome(&mut self, limit: Option<Duration>) -> anyhow::Result<Outcome> {
        let deadline = limit.map(|limit| tokio::time::Instant::now() + limit);

        loop {
            let notice = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.next_notice()).await {
                        Ok(notice) => notice,
                        Err(_) => {
                            tracing::info!("run timed out, cancelling");
                            self.broker.cancel();
                            return self.collect_outcome().await;
                        }
                    }
                }
                None => self.next_notice().await,
            };

            match notice {
                Some(BrokerNotice::Outcome(outcome)) => return Ok(outcome),
                Some(other) => tracing::debug!("ignoring {:?} while running", other),
                None => return Err(CoreError::WorkerTerminated.into()),
            }
        }
    }

    /// Outcome already emitted by a cancel, without waiting on the worker.
    async fn collect_outcome(&mut self) -> anyhow::Result<Outcome> {
        while let Some(notice) = self.next_notice().await {
            if let BrokerNotice::Outcome(outcome) = notice {
                return Ok(outcome);
            }
        }
        Err(CoreError::WorkerTerminated.into())
    }
}

/// Execute a script. Returns its outcome.
pub async fn execute(script_path: &str, options: RunOptions) -> anyhow::Result<Outcome> {
    let start = Instant::now();

    let path = Path::new(script_path);
    if !path.exists() {
        anyhow::bail!("Script not found: {}", script_path);
    }
    let source = std::fs::read_to_string(path)?;

    eprintln!(
        "{}◆ Running{} {} {}(runtime: {}){}",
        colors::CYAN,
        colors::RESET,
        path.display(),
        colors::DIM,
        options.runtime,
        colors::RESET
    );

    let config = launch::broker_config(options.runtime, options.worker)?;
    let (callback, notices) = ChannelCallback::new();
    let (broker, events) = ExecutionBroker::with_config(&config, callback)?;
    let mut driver = Driver {
        broker,
        events,
        notices,
    };

    driver.wait_ready(options.init_timeout).await?;
    driver.broker.run(source)?;
    let outcome = driver.wait_outcome(options.timeout).await?;
    driver.broker.teardown();

    print_outcome(&outcome);
    eprintln!(
        "{}Finished in {:.2}s{}",
        colors::DIM,
        start.elapsed().as_secs_f64(),
        colors::RESET
    );

    Ok(outcome)
}

fn print_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::Success { output } => {
            print!("{}", output);
            if !output.ends_with('\n') {
                println!();
            }
            eprintln!("{}✓ Success{}", colors::GREEN, colors::RESET);
        }
        Outcome::Failure { message } => {
            eprintln!("{}{}✗ Failure:{} {}", colors::BOLD, colors::RED, colors::RESET, message);
        }
        Outcome::Cancelled => {
            eprintln!("{}⊘ Cancelled{}", colors::YELLOW, colors::RESET);
        }
    }
}
