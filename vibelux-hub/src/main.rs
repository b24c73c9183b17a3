//! Vibelux collaboration hub.
//!
//! Usage: `vibelux-hub [bind-addr]` (or `VIBELUX_HUB_ADDR`). Log level
//! comes from `RUST_LOG`, default `info`.

use log::{error, info};
use vibelux_collab::{ServerConfig, SyncServer};

const ADDR_ENV: &str = "VIBELUX_HUB_ADDR";

fn bind_addr() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(ADDR_ENV).ok())
        .unwrap_or_else(|| ServerConfig::default().bind_addr)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig {
        bind_addr: bind_addr(),
        ..ServerConfig::default()
    };
    info!("Starting Vibelux collaboration hub on {}", config.bind_addr);

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        error!("Hub stopped: {e}");
        std::process::exit(1);
    }
}
