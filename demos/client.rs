//! Example: a client connection that subscribes on connect and publishes
//!
//! Dials the endpoint in `NATSWS_DIALER` unmodified (a relay URL, or a NATS
//! WebSocket listener directly), otherwise the relay under
//! `http://127.0.0.1:8080`. The identity is kept in `natsws-state.json`.
//!
//! Run with: NATSWS_DIALER=ws://127.0.0.1:8080/natsws/demo cargo run --example client

use natsws::{ChangeReason, ClientConfig, ClientConnection, FileStore};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use url::Url;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let mut config = ClientConfig::from_env();
    if config.override_endpoint.is_none() {
        config.origin = Some(Url::parse("http://127.0.0.1:8080")?);
    }

    let store = FileStore::new("natsws-state.json");
    let conn = ClientConnection::start(config, &store)?;
    info!("Client name: {}", conn.client_name());

    // Observers run on the connection task; hand Connect over to main
    let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();
    conn.observe(move |snapshot| {
        info!("Connection {:?} ({:?})", snapshot.state, snapshot.change_reason);
        if snapshot.change_reason == Some(ChangeReason::Connect) {
            let _ = connected_tx.send(());
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    let mut counter = 0u64;

    loop {
        tokio::select! {
            Some(()) = connected_rx.recv() => {
                let result = conn
                    .subscribe("demo.>", |msg| {
                        info!("{}: {}", msg.subject, String::from_utf8_lossy(&msg.payload));
                    })
                    .await;
                if let Err(e) = result {
                    warn!("Subscribe failed: {}", e);
                }
            }
            _ = ticker.tick() => {
                counter += 1;
                if let Err(e) = conn.publish("demo.counter", counter.to_string()).await {
                    warn!("Publish {} skipped: {}", counter, e);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down...");
    conn.shutdown().await;
    Ok(())
}
