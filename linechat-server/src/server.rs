//! TCP listener and accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::broadcaster::{self, BroadcasterHandle};
use crate::config::ServerConfig;
use crate::connection;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run the server, blocking forever.
    pub async fn run(self) -> Result<()> {
        let (addr, handle) = self.start().await?;
        tracing::info!("Chat relay ready on {addr}");
        handle.await.context("Accept loop panicked")
    }

    /// Bind, start the broadcaster and the accept loop, and return the bound
    /// address plus the accept task (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<()>)> {
        self.config.validate()?;

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let (broadcaster, _broadcaster_task) = broadcaster::spawn(self.config.event_queue);
        let config = Arc::new(self.config);
        let handle = tokio::spawn(accept_loop(listener, broadcaster, config));

        Ok((addr, handle))
    }
}

async fn accept_loop(
    listener: TcpListener,
    broadcaster: BroadcasterHandle,
    config: Arc<ServerConfig>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let broadcaster = broadcaster.clone();
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    if let Err(e) = connection::handle(stream, broadcaster, config).await {
                        tracing::error!("Connection error: {e}");
                    }
                });
            }
            Err(e) => {
                tracing::error!("Accept error: {e}");
                // Persistent failures (fd exhaustion) would otherwise spin.
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
