use crate::config::ConfigError;
use std::io;
use tokio_tungstenite::tungstenite::{self, error::ProtocolError, protocol::frame::coding::CloseCode};

/// Categorizes errors for manager and caller decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be passed around without carrying the underlying source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Connection could not be established (dial, handshake, timeout)
    ConnectionFailed,
    /// No backend answered a liveness probe
    NoBackendAvailable,
    /// Peer closed a relayed socket with a close frame
    Closed,
    /// Session or client was cancelled
    Cancelled,
    /// Operation requires an established broker connection
    NotConnected,
    /// Broker wire protocol violation or server error
    Protocol,
    /// Client-local storage failure
    Storage,
    /// Other error
    Other,
}

/// Errors that can occur in natsws
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Connection to an endpoint failed
    #[error("Connection to {url} failed: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// None of the manager's backends passed the liveness probe
    #[error("No backend available")]
    NoBackendAvailable,

    /// Backend address is not a usable ws:// or wss:// URI
    #[error("Invalid backend {backend}: {reason}")]
    InvalidBackend { backend: String, reason: String },

    /// Peer sent a close frame
    #[error("Closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    /// The owning session or client was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Publish/subscribe attempted without a broker connection
    #[error("not connected")]
    NotConnected,

    /// Broker protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Persisted state could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Client or relay is shutting down
    #[error("Shutting down")]
    ShuttingDown,
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed { .. } | Error::Tls(_) => ErrorKind::ConnectionFailed,
            Error::NoBackendAvailable | Error::InvalidBackend { .. } => ErrorKind::NoBackendAvailable,
            Error::Closed { .. } => ErrorKind::Closed,
            Error::Cancelled | Error::ShuttingDown => ErrorKind::Cancelled,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Storage(_) => ErrorKind::Storage,
            Error::Io(_) | Error::Config(_) => ErrorKind::Other,
        }
    }

    /// Close code carried by the error, if the peer closed with one.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::Closed { code, .. } => Some(CloseCode::from(*code)),
            _ => None,
        }
    }

    /// Whether the error is an ordinary end of a WebSocket session.
    ///
    /// Normal closure, going-away, and a peer vanishing before the next frame
    /// header (what a browser does on page navigation) are benign.
    pub fn is_benign(&self) -> bool {
        if matches!(self.close_code(), Some(CloseCode::Normal | CloseCode::Away)) {
            return true;
        }
        match self {
            Error::WebSocket(e) => is_benign_ws(e),
            Error::Io(e) => e.kind() == io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }

    pub(crate) fn connection_failed(url: impl Into<String>, reason: impl ToString) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

fn is_benign_ws(e: &tungstenite::Error) -> bool {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Io(io) => io.kind() == io::ErrorKind::UnexpectedEof,
        _ => false,
    }
}
