//! Tabletop sync server binary.
//!
//! Usage: tabletop-server [--addr <host:port>] [--data <dir>] [--debug]
//!
//! Without `--data` sheets live in memory and are lost on exit.

use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::time::Duration;
use tabletop_sync::{ConnectionConfig, ServerConfig, SyncServer};

/// Real-time character sheet sync server.
#[derive(Parser, Debug)]
#[command(name = "tabletop-server")]
#[command(about = "WebSocket hub for shared character sheets")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "TABLETOP_ADDR", default_value = "127.0.0.1:4000")]
    addr: String,

    /// RocksDB directory for sheets. In-memory when omitted.
    #[arg(long, env = "TABLETOP_DATA")]
    data: Option<PathBuf>,

    /// Send full error text in NACK responses.
    #[arg(long, env = "TABLETOP_DEBUG")]
    debug: bool,

    /// Largest accepted inbound frame in bytes.
    #[arg(long, env = "TABLETOP_MAX_MESSAGE_SIZE", default_value = "4096")]
    max_message_size: usize,

    /// Seconds to wait for a pong before dropping a client.
    #[arg(long, env = "TABLETOP_PONG_WAIT_SECS", default_value = "60")]
    pong_wait_secs: u64,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let pong_wait = Duration::from_secs(self.pong_wait_secs.max(1));
        ServerConfig {
            bind_addr: self.addr,
            storage_path: self.data,
            debug: self.debug,
            connection: ConnectionConfig {
                max_message_size: self.max_message_size,
                pong_wait,
                ping_period: pong_wait * 9 / 10,
                ..ConnectionConfig::default()
            },
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Args::parse().into_config();
    match &config.storage_path {
        Some(path) => info!("Starting tabletop server with storage at {}", path.display()),
        None => info!("Starting tabletop server in memory"),
    }

    let server = SyncServer::new(config)?;
    server.run().await
}
