//! Folio presence server: live visitor count for the portfolio site.
//!
//! Accepts WebSocket connections on the configured path, welcomes each
//! visitor with the current count and keeps every open tab in sync.

use clap::Parser;
use log::info;

use folio_presence::{PresenceServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(version, about = "Live visitor presence channel")]
struct Args {
    #[arg(
        long,
        env = "FOLIO_BIND",
        value_name = "ADDR",
        help = "Listen address",
        default_value = "0.0.0.0:5000"
    )]
    bind: String,

    #[arg(
        long,
        env = "FOLIO_WS_PATH",
        value_name = "PATH",
        help = "Path accepted for WebSocket upgrades",
        default_value = "/ws"
    )]
    ws_path: String,

    #[arg(
        long,
        env = "FOLIO_HEARTBEAT_SECS",
        value_name = "SECS",
        help = "Seconds between liveness probes",
        default_value_t = 30
    )]
    heartbeat_secs: u64,

    #[arg(
        long,
        env = "FOLIO_OUTBOUND_CAPACITY",
        value_name = "FRAMES",
        help = "Frames buffered per visitor before it is dropped",
        default_value_t = 64,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    outbound_capacity: usize,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    debug: bool,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            bind_addr: args.bind,
            ws_path: args.ws_path,
            heartbeat_interval_secs: args.heartbeat_secs,
            outbound_capacity: args.outbound_capacity,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let server = PresenceServer::new(args.into());
    let bound = server.bind().await?;
    info!("Folio presence server ready on {}", bound.local_addr()?);

    tokio::select! {
        result = bound.serve() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, stopping...");
        }
    }

    info!("Done.");
    Ok(())
}
