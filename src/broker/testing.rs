//! In-memory broker endpoints for tests.

use crate::error::Error;
use crate::transport::Dialer;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::codec::{Framed, LinesCodec};

pub(crate) const TEST_INFO: &str =
    r#"INFO {"server_id":"test","version":"2.10.0","max_payload":1048576,"ws_connect_urls":["10.0.0.2:4223"]}"#;

/// Dialer handing out in-memory streams; the server end of every dial is
/// delivered to the paired receiver.
#[derive(Clone)]
pub(crate) struct DuplexDialer {
    servers: mpsc::UnboundedSender<MockServer>,
    failing: Arc<AtomicBool>,
}

impl DuplexDialer {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<MockServer>) {
        let (servers, rx) = mpsc::unbounded_channel();
        (
            Self {
                servers,
                failing: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Make subsequent dials fail
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Dialer for DuplexDialer {
    type Stream = DuplexStream;

    async fn dial(&self) -> Result<DuplexStream, Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::connection_failed("duplex", "dial refused"));
        }
        let (client, server) = duplex(64 * 1024);
        let _ = self.servers.send(MockServer::new(server));
        Ok(client)
    }

    fn endpoint(&self) -> String {
        "duplex".to_string()
    }
}

/// Scripted server end of a [`DuplexDialer`] stream
pub(crate) struct MockServer {
    framed: Framed<DuplexStream, LinesCodec>,
}

impl MockServer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new()),
        }
    }

    /// Send INFO, expect CONNECT and PING, answer PONG. Returns the CONNECT line.
    pub(crate) async fn handshake(&mut self) -> String {
        self.write(&format!("{}\r\n", TEST_INFO)).await;
        let connect = self.next_line().await;
        assert!(connect.starts_with("CONNECT "), "expected CONNECT, got {:?}", connect);
        assert_eq!(self.next_line().await, "PING");
        self.write("PONG\r\n").await;
        connect
    }

    /// Next line from the client, without its terminator
    pub(crate) async fn next_line(&mut self) -> String {
        timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("client line in time")
            .expect("client stream open")
            .expect("valid line")
    }

    /// Write raw protocol bytes to the client
    pub(crate) async fn write(&mut self, data: &str) {
        let stream = self.framed.get_mut();
        stream.write_all(data.as_bytes()).await.expect("client reachable");
        stream.flush().await.expect("client reachable");
    }
}
