//! Example: a relay in front of a NATS cluster
//!
//! Accepts `GET /natsws/<clientId>` upgrades and bridges each one to the
//! first backend that answers a probe.
//!
//! Run with: cargo run --example relay -- 0.0.0.0:8080 ws://127.0.0.1:4223 ws://127.0.0.1:4224

use natsws::{Relay, RelayConfig, StaticManager};
use tokio::net::TcpListener;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    let mut args = std::env::args().skip(1);
    let listen = args.next().unwrap_or_else(|| "127.0.0.1:8080".to_string());
    let mut backends: Vec<String> = args.collect();
    if backends.is_empty() {
        backends.push("ws://127.0.0.1:4223".to_string());
    }

    let debug_mode = std::env::var("NATSWS_DEBUG").is_ok();
    let manager = StaticManager::new(debug_mode, backends.clone());
    let relay = Relay::new(manager, RelayConfig::default());

    let listener = TcpListener::bind(&listen).await?;
    info!("Relaying {} to {:?} (debug: {})", listen, backends, debug_mode);

    let serving = relay.clone();
    let server = tokio::spawn(async move { serving.serve(listener).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    relay.shutdown();
    server.await??;

    let snapshot = relay.metrics().snapshot();
    info!(
        "Sessions: {}, frames in: {}, frames out: {}, unavailable: {}",
        snapshot.sessions_total,
        snapshot.frames_client_to_backend_total,
        snapshot.frames_backend_to_client_total,
        snapshot.backend_unavailable_total
    );

    Ok(())
}
