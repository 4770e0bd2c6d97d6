//! Standalone grid hub.
//!
//! `QUILT_HUB_BIND` overrides the bind address (default `127.0.0.1:9090`).

use quilt_collab::hub::{GridHub, HubConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = HubConfig::default();
    if let Ok(bind_addr) = std::env::var("QUILT_HUB_BIND") {
        if !bind_addr.trim().is_empty() {
            config.bind_addr = bind_addr;
        }
    }

    let hub = GridHub::new(config);
    if let Err(e) = hub.run().await {
        log::error!("hub terminated: {e}");
        std::process::exit(1);
    }
}
