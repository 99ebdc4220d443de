//! Runbox playground server.
//!
//! Bridges a browser playground to the execution broker over WebSocket.
//!
//! # Architecture
//!
//! The server consists of:
//! - **Session**: One broker (and one worker process) per connection
//! - **Protocol**: Client/server message types
//! - **Routes**: HTTP and WebSocket handlers

pub mod error;
pub mod protocol;
pub mod routes;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use runbox_core::BrokerConfig;
use runbox_core::ipc::find_worker_binary;

pub use error::{ServerError, ServerResult};
pub use protocol::{ClientMessage, ServerMessage};
pub use routes::{AppState, create_router};
pub use session::PlaygroundSession;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Broker settings applied to every session.
    pub broker: BrokerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            broker: BrokerConfig::default(),
        }
    }
}

/// Start the runbox server and run until Ctrl+C.
pub async fn serve(config: ServerConfig) -> ServerResult<()> {
    let mut broker = config.broker;

    // Resolve the worker binary once, before accepting connections.
    if broker.worker_path.is_none() {
        broker.worker_path = Some(find_worker_binary()?);
    }

    let state = Arc::new(AppState { broker });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| ServerError::Io(format!("Invalid address: {}:{}", config.host, config.port)))?;

    tracing::info!("Starting runbox server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(());
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await?;

    tracing::info!("Server shutdown complete");

    Ok(())
}
