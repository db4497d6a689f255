//! # natsws
//!
//! Tunnel the NATS wire protocol over WebSocket.
//!
//! ## Features
//!
//! - **Relay** that probes backends, picks the first live one and bridges
//!   WebSocket frames to it until either side ends
//! - **Manager** policy trait supplying backends, TLS, an error sink and
//!   randomize/debug flags, with static and discovery-fed variants
//! - **Client connection** with a persisted identity, reconnects, keepalive,
//!   pub/sub and change observers
//! - **Transport adapter** exposing a WebSocket as a duplex byte stream
//! - **Metrics** for the relay
//!
//! ## Example
//!
//! ```ignore
//! use natsws::{Relay, RelayConfig, StaticManager};
//!
//! let manager = StaticManager::new(false, vec![
//!     "ws://10.0.0.1:4223".into(),
//!     "ws://10.0.0.2:4223".into(),
//! ]);
//! let relay = Relay::new(manager, RelayConfig::default());
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! relay.serve(listener).await?;
//! ```

pub mod broker;
mod config;
mod connection;
mod error;
mod health;
mod manager;
mod metrics;
mod observable;
mod relay;
mod storage;
mod transport;

pub use broker::{BrokerClient, BrokerOptions, BrokerStatus, Subscription};
pub use config::{
    BackoffConfig, ClientConfig, ClientConfigBuilder, ConfigError, RelayConfig, RelayConfigBuilder,
    OVERRIDE_ENDPOINT_ENV,
};
pub use connection::{ChangeReason, ClientConnection, ConnectionSnapshot, ConnectivityState};
pub use error::{Error, ErrorKind};
pub use health::{candidate_order, probe, select_backend, Backend};
pub use manager::{DynamicManager, Manager, StaticManager, StaticManagerBuilder};
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use observable::{Observable, ObserverId};
pub use relay::{Direction, Relay, RelaySession, MAX_CLOSE_REASON_LEN};
pub use storage::{establish_identity, FileStore, KeyValueStore, MemoryStore};
pub use transport::{connect, Dialer, WebSocketDialer, WsByteStream, WsStream};

/// Result type for natsws operations
pub type Result<T> = std::result::Result<T, Error>;
