//! Flamingo chat server binary.
//!
//! # Usage
//!
//! ```bash
//! # Listen on all interfaces, port 8000
//! flamingo-chat
//!
//! # Local only, with hex dumps of every inbound message
//! flamingo-chat --host 127.0.0.1 --port 9000 --log-binary
//! ```

use clap::Parser;
use flamingo_net::DEFAULT_READ_CHUNK_SIZE;
use flamingo_server::{ChatServer, ChatServerConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Flamingo chat server
#[derive(Parser, Debug)]
#[command(name = "flamingo-chat")]
#[command(about = "Flamingo chat server")]
#[command(version)]
struct Args {
    /// Interface to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Server name used in connection ids and logs
    #[arg(short, long, default_value = "ChatServer")]
    name: String,

    /// Log a hex dump of every inbound message
    #[arg(long)]
    log_binary: bool,

    /// Bytes requested per socket read
    #[arg(long, default_value_t = DEFAULT_READ_CHUNK_SIZE)]
    read_chunk_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(host = %args.host, port = args.port, name = %args.name, "chat server starting");

    let config = ChatServerConfig {
        host: args.host,
        port: args.port,
        name: args.name,
        log_binary: args.log_binary,
        read_chunk_size: args.read_chunk_size,
    };

    let server = ChatServer::new(config)?;
    let local = server.start().await?;
    tracing::info!("Server listening on {local}");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    server.stop().await;

    Ok(())
}
