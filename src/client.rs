//! Terminal client
//!
//! A thin shim between a terminal and the relay: lines typed on the input
//! are forwarded to the server as-is, and everything the server sends is
//! copied to the output. Sending `/exit` ends the session.

use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info};

use crate::DEFAULT_PORT;
use crate::error::{ChatError, Result};
use crate::protocol::EXIT_COMMAND;

/// Chat client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// How a client session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// The user sent `/exit`
    UserExit,
    /// The input stream ended
    InputClosed,
    /// The server closed the connection
    ServerClosed,
}

pub struct ChatClient {
    config: ClientConfig,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connect and pump lines between `input`/`output` and the server
    pub async fn run<I, O>(&self, input: I, output: O) -> Result<ClientExit>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        info!("Connecting to chat server at {}", self.config.server_addr);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.server_addr),
        )
        .await
        .map_err(|_| ChatError::timeout("Connection timeout"))?
        .map_err(|e| ChatError::connection(format!("Failed to connect: {}", e)))?;

        let (mut server_read, mut server_write) = stream.into_split();

        let result = tokio::select! {
            sent = forward_input(input, &mut server_write) => sent,
            received = async {
                let mut output = output;
                tokio::io::copy(&mut server_read, &mut output).await?;
                output.flush().await?;
                Ok::<_, ChatError>(ClientExit::ServerClosed)
            } => received,
        };

        let _ = server_write.shutdown().await;
        debug!("Client session ended: {:?}", result);
        result
    }
}

/// Send each input line to the server, stopping after `/exit`
async fn forward_input<I, W>(input: I, server: &mut W) -> Result<ClientExit>
where
    I: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(input, LinesCodec::new());

    while let Some(line) = lines.next().await {
        let line = line?;
        server.write_all(line.as_bytes()).await?;
        server.write_all(b"\n").await?;
        server.flush().await?;

        if line.trim() == EXIT_COMMAND {
            info!("Exiting chat...");
            return Ok(ClientExit::UserExit);
        }
    }

    Ok(ClientExit::InputClosed)
}
