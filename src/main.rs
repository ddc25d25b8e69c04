//! Line relay
//!
//! Usage:
//!   linerelay server                          # listen on 0.0.0.0:3335
//!   linerelay server --bind 127.0.0.1:5000    # listen elsewhere
//!   linerelay client --addr 127.0.0.1:3335    # terminal client

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use linerelay::{
    ChatClient, ChatServer, ClientConfig, DEFAULT_PORT, ServerConfig, TransportConfig,
};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "linerelay", version, about = "Line-oriented TCP chat relay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay server
    Server(ServerArgs),
    /// Connect a terminal to a running relay
    Client(ClientArgs),
}

#[derive(Debug, clap::Args)]
struct ServerArgs {
    /// Address to listen on
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    bind: SocketAddr,

    /// Transcript file (appended to, never truncated)
    #[arg(long, default_value = linerelay::transcript::DEFAULT_TRANSCRIPT_PATH)]
    transcript: PathBuf,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 10000)]
    max_connections: usize,

    /// Per-line write timeout towards a client, in milliseconds
    #[arg(long, default_value_t = 5000)]
    write_timeout_ms: u64,

    /// Lines queued per client before it is dropped as stalled
    #[arg(long, default_value_t = 256)]
    outbound_queue: usize,

    /// Longest accepted input line in bytes
    #[arg(long, default_value_t = 8192)]
    max_line_length: usize,

    /// Seconds between stats reports (0 disables)
    #[arg(long, default_value_t = 5)]
    stats_interval_secs: u64,
}

#[derive(Debug, clap::Args)]
struct ClientArgs {
    /// Server address
    #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))]
    addr: SocketAddr,
}

impl From<ServerArgs> for ServerConfig {
    fn from(args: ServerArgs) -> Self {
        let stats_interval =
            (args.stats_interval_secs > 0).then(|| Duration::from_secs(args.stats_interval_secs));

        ServerConfig::default()
            .with_bind_addr(args.bind)
            .with_transcript_path(args.transcript)
            .with_max_connections(args.max_connections)
            .with_max_line_length(args.max_line_length)
            .with_transport(TransportConfig {
                outbound_queue: args.outbound_queue,
                write_timeout: Duration::from_millis(args.write_timeout_ms),
            })
            .with_stats_interval(stats_interval)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Server(args) => run_server(args.into()).await,
        Command::Client(args) => run_client(args).await,
    }
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    info!("Starting chat relay...");
    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Transcript: {}", config.transcript_path.display());
    info!("  - Max connections: {}", config.max_connections);
    info!("  - Outbound queue: {}", config.transport.outbound_queue);
    info!("  - Write timeout: {:?}", config.transport.write_timeout);

    let server = ChatServer::new(config);
    let listener = server.bind().await.context("Error starting TCP server")?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        shutdown.cancel();
    });

    if let Err(e) = server.serve(listener).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

async fn run_client(args: ClientArgs) -> anyhow::Result<()> {
    let config = ClientConfig {
        server_addr: args.addr,
        ..Default::default()
    };

    let exit = ChatClient::new(config)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Error connecting to server")?;

    info!("Client finished: {:?}", exit);
    Ok(())
}
