//! TCP listener and accept loop
//!
//! The acceptor never waits on session work: each accepted socket gets its
//! own writer task and session task, and the loop goes straight back to
//! `accept`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ServerConfig;
use crate::error::{ChatError, Result};
use crate::server::session::Session;
use crate::server::state::{ServerState, ServerStats};
use crate::transport::spawn_connection;

/// Line relay server
pub struct ChatServer {
    state: Arc<ServerState>,
    shutdown: CancellationToken,
}

impl ChatServer {
    /// Create a new server with the given configuration
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(ServerState::new(config)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Token that stops the accept loop and closes every connection
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the configured address. Failing here is fatal for the process.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.state.config().bind_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|e| ChatError::network(format!("Failed to bind {}: {}", addr, e)))
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Chat server listening on {}", listener.local_addr()?);
        info!(
            "Transcript: {}",
            self.state.transcript().path().display()
        );

        if let Some(interval) = self.state.config().stats_interval {
            tokio::spawn(report_stats(
                Arc::clone(&self.state),
                interval,
                self.shutdown.clone(),
            ));
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_session(stream, addr),
                    Err(e) => warn!("Error accepting connection: {}", e),
                },
            }
        }

        info!("Chat server stopped accepting connections");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        if !self.state.try_acquire_slot() {
            warn!(
                "Connection limit ({}) reached, rejecting {}",
                self.state.config().max_connections,
                addr
            );
            return;
        }

        info!("New client connected: {}", addr);

        let accepted = spawn_connection(
            stream,
            addr,
            &self.state.config().transport,
            self.shutdown.child_token(),
        );
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let session = Session::new(Arc::clone(&state), accepted.handle);

            match session.run(accepted.reader).await {
                Ok(()) => info!("Client disconnected: {}", addr),
                Err(e) => info!("Client disconnected: {} ({})", addr, e),
            }

            // The session has already asked the writer to drain.
            if let Err(e) = accepted.writer_task.await {
                error!("Writer task for {} failed: {}", addr, e);
            }
            state.release_slot();
            debug!("Released connection slot for {}", addr);
        });
    }

    /// Get server statistics
    pub async fn get_stats(&self) -> ServerStats {
        self.state.stats().await
    }

    /// Stop accepting and close every live connection
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!("Chat server shutdown requested");
    }
}

/// Periodically log connection counts
async fn report_stats(state: Arc<ServerState>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let stats = state.stats().await;
        match serde_json::to_string(&stats) {
            Ok(json) => info!("Server stats: {}", json),
            Err(e) => warn!("Failed to encode server stats: {}", e),
        }
    }
}
