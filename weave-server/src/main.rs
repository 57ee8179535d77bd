//! Weave sync server: hosts real-time project rooms over WebSocket.
//!
//! Runs a single instance backed by the in-memory store. Settings come from
//! `WEAVE_*` environment variables (see [`config`]); log output is
//! controlled with `RUST_LOG`.

mod config;

use log::{info, warn};
use std::sync::Arc;
use weave_collab::{MemoryStore, StaticTokenAuthenticator, SyncServer};

use config::Settings;

#[tokio::main]
async fn main() {
    env_logger::init();

    let settings = Settings::from_env();
    let auth = StaticTokenAuthenticator::parse(&settings.tokens);
    if auth.is_empty() {
        warn!("No tokens configured in {}; every connection will be rejected", config::ENV_TOKENS);
    } else {
        info!("Loaded {} access token(s)", auth.len());
    }

    let server = SyncServer::new(settings.server, Arc::new(MemoryStore::open()), Arc::new(auth));
    info!("Starting Weave sync server on {}", server.bind_addr());
    if let Err(e) = server.run().await {
        log::error!("Server error: {e}");
        std::process::exit(1);
    }
}
