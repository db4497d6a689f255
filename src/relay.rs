//! Reverse relay from inbound WebSocket upgrades to a live backend.
//!
//! Each upgrade request becomes one [`RelaySession`]: the relay reads the
//! request head, probes the manager's backends, dials the first live one,
//! accepts the upgrade and copies frames both ways until either side ends.

use crate::config::RelayConfig;
use crate::error::Error;
use crate::health::select_backend;
use crate::manager::Manager;
use crate::metrics::RelayMetrics;
use crate::transport::{self, set_tcp_options};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::{
    self,
    handshake::server::{ErrorResponse, Request, Response},
    http::{header, StatusCode},
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Longest close reason the WebSocket protocol can carry
pub const MAX_CLOSE_REASON_LEN: usize = 123;

/// Upper bound for sending a close frame to a peer that stopped reading
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest HTTP request head accepted from a client
const MAX_REQUEST_HEAD: usize = 16 * 1024;

/// Direction of a copy loop within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client->backend",
            Direction::BackendToClient => "client<-backend",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts WebSocket upgrades and bridges each one to a probed-live backend.
///
/// Cloning is cheap; clones share the manager, metrics and shutdown token.
pub struct Relay<M: Manager> {
    manager: Arc<M>,
    config: Arc<RelayConfig>,
    metrics: Arc<RelayMetrics>,
    shutdown: CancellationToken,
}

impl<M: Manager> Clone for Relay<M> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

/// What the handshake callback learned about the upgrade request
#[derive(Debug, Default)]
struct UpgradeInfo {
    client_id: String,
    compression_disabled: bool,
}

impl<M: Manager> Relay<M> {
    /// Create a new relay
    pub fn new(manager: M, config: RelayConfig) -> Self {
        Self::with_shared_manager(Arc::new(manager), config)
    }

    /// Create a relay around a manager the caller keeps a handle to, e.g.
    /// a [`DynamicManager`](crate::DynamicManager) fed by discovery.
    pub fn with_shared_manager(manager: Arc<M>, config: RelayConfig) -> Self {
        Self {
            manager,
            config: Arc::new(config),
            metrics: Arc::new(RelayMetrics::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the metrics for this relay
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        self.metrics.clone()
    }

    /// Get a reference to the manager
    pub fn manager(&self) -> &Arc<M> {
        &self.manager
    }

    /// Stop accepting and cancel every active session
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    ///
    /// Every connection is handled on its own task; a failing request never
    /// affects the accept loop or other sessions.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Error> {
        info!("[RELAY] Listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("[RELAY] Shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            set_tcp_options(&stream);
                            let relay = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = relay.handle(stream).await {
                                    debug!("[RELAY] Request from {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("[RELAY] Accept failed: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Handle one inbound upgrade request on `stream`.
    ///
    /// Returns once the session has ended. The request head is read before
    /// any backend is contacted; requests for other paths get a 404 and
    /// clients that stay silent past `handshake_timeout` are dropped.
    /// Selection, dial and upgrade failures are answered on the stream (503
    /// when no backend is usable) and returned; session failures are
    /// reported to the manager and end only this session.
    pub async fn handle<S>(&self, mut stream: S) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let head = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(Error::ShuttingDown),
            head = timeout(self.config.handshake_timeout, read_request_head(&mut stream)) => match head {
                Ok(head) => head?,
                Err(_) => {
                    self.metrics.record_upgrade_failure();
                    return Err(handshake_timed_out());
                }
            },
        };

        let path_known = client_id_from_path(&self.config.path_prefix, &head.path).is_some();
        let backend = if path_known {
            self.pick_backend().await
        } else {
            None
        };

        let available = backend.is_some();
        let upgrade = Arc::new(Mutex::new(None::<UpgradeInfo>));
        let captured = upgrade.clone();
        let config = self.config.clone();

        let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let Some(client_id) = client_id_from_path(&config.path_prefix, request.uri().path()) else {
                return Err(error_response(StatusCode::NOT_FOUND, "not found"));
            };

            if !available {
                return Err(error_response(StatusCode::SERVICE_UNAVAILABLE, "no backend available"));
            }

            let user_agent = request
                .headers()
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let compression_disabled = config.compression_disabled_for(user_agent);
            if compression_disabled {
                response.headers_mut().remove(header::SEC_WEBSOCKET_EXTENSIONS);
            }

            *captured.lock() = Some(UpgradeInfo {
                client_id,
                compression_disabled,
            });
            Ok(response)
        };

        let stream = Rewind::new(head.buffered.freeze(), stream);
        let accepted = tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::ShuttingDown),
            result = timeout(self.config.handshake_timeout, tokio_tungstenite::accept_hdr_async(stream, callback)) => {
                match result {
                    Ok(Ok(client)) => Ok(client),
                    Ok(Err(e)) => Err(Error::WebSocket(e)),
                    Err(_) => Err(handshake_timed_out()),
                }
            }
        };

        let client = match accepted {
            Ok(client) => client,
            Err(err) => {
                let Some((_, mut backend_ws)) = backend else {
                    if !path_known {
                        self.metrics.record_upgrade_failure();
                        return Err(Error::Protocol(format!("unknown upgrade path {}", head.path)));
                    }
                    // Already reported; the callback answered 503
                    return Err(Error::NoBackendAvailable);
                };
                let _ = timeout(CLOSE_TIMEOUT, backend_ws.close(None)).await;
                self.metrics.record_upgrade_failure();
                if !matches!(err, Error::ShuttingDown) {
                    self.manager.on_error("accept upgrade", &err);
                }
                return Err(err);
            }
        };

        let Some((backend_url, backend_ws)) = backend else {
            return Err(Error::NoBackendAvailable);
        };

        let info = upgrade.lock().take().unwrap_or_default();
        info!(
            "[RELAY] Client {} relayed to {} (compression disabled: {})",
            info.client_id, backend_url, info.compression_disabled
        );

        let session = RelaySession::new(self.shutdown.child_token(), client, backend_ws);
        self.metrics.record_session_start();
        let outcome = session
            .run(
                self.manager.clone(),
                self.metrics.clone(),
                self.config.debug_disconnect_payload.as_str(),
            )
            .await;
        self.metrics.record_session_end();

        if let Some((direction, err)) = outcome {
            if err.is_benign() {
                debug!("[SESSION] Client {} ended ({}): {}", info.client_id, direction, err);
            } else {
                self.metrics.record_error_reported();
                let message = match direction {
                    Direction::ClientToBackend => "Error copying from client to backend",
                    Direction::BackendToClient => "Error copying from backend to client",
                };
                self.manager.on_error(message, &err);
            }
        }

        Ok(())
    }

    /// Probe the manager's backends and dial the first live one; failures
    /// are reported to the manager and yield `None`
    async fn pick_backend(&self) -> Option<(String, transport::WsStream)> {
        let Some(url) = select_backend(self.manager.as_ref(), self.config.probe_timeout).await else {
            self.metrics.record_backend_unavailable();
            self.manager.on_error("select backend", &Error::NoBackendAvailable);
            return None;
        };

        match transport::connect(&url, self.manager.tls_config(), self.config.dial_timeout).await {
            Ok(ws) => Some((url, ws)),
            Err(e) => {
                self.metrics.record_backend_dial_failure();
                self.manager.on_error("dial backend", &e);
                None
            }
        }
    }
}

/// Client id carried in an upgrade path of the form `<prefix><id>`
fn client_id_from_path(prefix: &str, path: &str) -> Option<String> {
    match path.strip_prefix(prefix) {
        Some(id) if !id.is_empty() && !id.contains('/') => Some(id.to_string()),
        _ => None,
    }
}

fn handshake_timed_out() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::TimedOut, "client handshake timed out"))
}

/// Request head read ahead of the WebSocket handshake
struct RequestHead {
    /// Path without the query string
    path: String,
    /// Everything read so far, replayed to the handshake
    buffered: BytesMut,
}

async fn read_request_head<S>(stream: &mut S) -> Result<RequestHead, Error>
where
    S: AsyncRead + Unpin,
{
    let mut buffered = BytesMut::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buffered).await? == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the request head",
            )));
        }

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buffered) {
            Ok(httparse::Status::Complete(_)) => {
                let target = request.path.unwrap_or_default();
                let path = target.split('?').next().unwrap_or_default().to_string();
                return Ok(RequestHead { path, buffered });
            }
            Ok(httparse::Status::Partial) if buffered.len() < MAX_REQUEST_HEAD => continue,
            Ok(httparse::Status::Partial) => {
                return Err(Error::Protocol("request head too large".to_string()));
            }
            Err(e) => return Err(Error::Protocol(format!("invalid request head: {}", e))),
        }
    }
}

/// Stream that yields bytes already read from `inner` before reading on
struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn error_response(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}

/// One accepted upgrade bridged to one dialed backend.
///
/// Both copy loops share the session token: cancelling it, explicitly or
/// because one loop failed, ends the session as a unit.
pub struct RelaySession<C, B> {
    token: CancellationToken,
    client: WebSocketStream<C>,
    backend: WebSocketStream<B>,
}

/// Shared by both copy loops of a session
struct CopyContext<M> {
    token: CancellationToken,
    manager: Arc<M>,
    metrics: Arc<RelayMetrics>,
    debug_payload: Arc<str>,
}

impl<M> Clone for CopyContext<M> {
    fn clone(&self) -> Self {
        Self {
            token: self.token.clone(),
            manager: self.manager.clone(),
            metrics: self.metrics.clone(),
            debug_payload: self.debug_payload.clone(),
        }
    }
}

impl<C, B> RelaySession<C, B>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(token: CancellationToken, client: WebSocketStream<C>, backend: WebSocketStream<B>) -> Self {
        Self { token, client, backend }
    }

    /// Token that cancels this session
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Copy frames both ways until one direction fails.
    ///
    /// Returns the first failure with the direction whose channel carried
    /// it, or `None` if both loops ended without one.
    pub async fn run<M: Manager>(
        self,
        manager: Arc<M>,
        metrics: Arc<RelayMetrics>,
        debug_payload: &str,
    ) -> Option<(Direction, Error)> {
        let ctx = CopyContext {
            token: self.token.clone(),
            manager,
            metrics,
            debug_payload: Arc::from(debug_payload),
        };

        let (client_sink, client_stream) = self.client.split();
        let (backend_sink, backend_stream) = self.backend.split();

        // Single-slot channels, one per direction
        let (client_tx, mut client_rx) = mpsc::channel::<Error>(1);
        let (backend_tx, mut backend_rx) = mpsc::channel::<Error>(1);

        let to_backend = tokio::spawn(copy_frames(
            Direction::ClientToBackend,
            client_stream,
            backend_sink,
            client_tx.clone(),
            backend_tx.clone(),
            ctx.clone(),
        ));
        let to_client = tokio::spawn(copy_frames(
            Direction::BackendToClient,
            backend_stream,
            client_sink,
            backend_tx,
            client_tx,
            ctx,
        ));

        let outcome = tokio::select! {
            Some(err) = client_rx.recv() => Some((Direction::ClientToBackend, err)),
            Some(err) = backend_rx.recv() => Some((Direction::BackendToClient, err)),
            else => None,
        };

        self.token.cancel();

        let (to_backend, to_client) = tokio::join!(to_backend, to_client);
        if let Ok((_, sink)) = to_backend {
            close_sink(sink).await;
        }
        if let Ok((_, sink)) = to_client {
            close_sink(sink).await;
        }

        outcome
    }
}

async fn close_sink<W>(mut sink: W)
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let _ = timeout(CLOSE_TIMEOUT, sink.close()).await;
}

/// Copy messages from `from` to `to` until a read or write fails.
///
/// A read failure closes `to` with a derived close frame and lands in
/// `own`; a write failure lands in `opposite`. Pushes never block, so a
/// channel that already holds an error keeps its first one.
async fn copy_frames<M, R, W>(
    direction: Direction,
    mut from: R,
    mut to: W,
    own: mpsc::Sender<Error>,
    opposite: mpsc::Sender<Error>,
    ctx: CopyContext<M>,
) -> (R, W)
where
    M: Manager,
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
    W: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    loop {
        let read = tokio::select! {
            _ = ctx.token.cancelled() => Err(Error::Cancelled),
            next = from.next() => match next {
                Some(Ok(Message::Close(frame))) => Err(closed_error(frame)),
                Some(Ok(message)) => Ok(message),
                Some(Err(e)) => Err(Error::WebSocket(e)),
                None => Err(Error::WebSocket(tungstenite::Error::ConnectionClosed)),
            },
        };

        let message = match read {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => message,
            // Control frames are answered by the WebSocket layer
            Ok(_) => continue,
            Err(err) => {
                let frame = close_frame_for(&err);
                trace!("[SESSION] {} read ended: {} (closing with {})", direction, err, frame.code);
                let _ = own.try_send(err);
                let _ = timeout(CLOSE_TIMEOUT, to.send(Message::Close(Some(frame)))).await;
                break;
            }
        };

        let len = message.len();
        if ctx.manager.is_debug() {
            let payload = payload(&message);
            debug!("[SESSION] {} : {:?}", direction, String::from_utf8_lossy(payload));
            if payload == ctx.debug_payload.as_bytes() {
                warn!("[SESSION] Debug payload received, cancelling session");
                ctx.token.cancel();
            }
        }

        let written = tokio::select! {
            biased;
            _ = ctx.token.cancelled() => Err(Error::Cancelled),
            result = to.send(message) => result.map_err(Error::WebSocket),
        };

        match written {
            Ok(()) => ctx.metrics.record_frame(direction, len),
            Err(err) => {
                trace!("[SESSION] {} write failed: {}", direction, err);
                let _ = opposite.try_send(err);
                break;
            }
        }
    }

    (from, to)
}

fn payload(message: &Message) -> &[u8] {
    match message {
        Message::Text(text) => text.as_bytes(),
        Message::Binary(data) => data,
        _ => &[],
    }
}

fn closed_error(frame: Option<CloseFrame<'static>>) -> Error {
    match frame {
        Some(frame) => Error::Closed {
            code: frame.code.into(),
            reason: frame.reason.into_owned(),
        },
        None => Error::Closed {
            code: CloseCode::Status.into(),
            reason: String::new(),
        },
    }
}

/// Codes a peer may put in a close frame on the wire
fn is_sendable(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// Close frame for the destination of a failed read: the source's own
/// close code and reason when it sent one, normal closure with the error
/// text otherwise.
pub(crate) fn close_frame_for(err: &Error) -> CloseFrame<'static> {
    if let Error::Closed { code, reason } = err {
        if is_sendable(*code) {
            return CloseFrame {
                code: CloseCode::from(*code),
                reason: Cow::Owned(truncate_reason(reason)),
            };
        }
    }

    CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Owned(truncate_reason(&err.to_string())),
    }
}

/// Truncate to the close-frame reason limit on a character boundary
pub(crate) fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_LEN {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::TEST_INFO;
    use crate::config::ClientConfig;
    use crate::connection::ClientConnection;
    use crate::manager::StaticManager;
    use crate::storage::MemoryStore;
    use native_tls::TlsConnector;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_tungstenite::connect_async;
    use url::Url;

    /// Manager that records every error it is handed
    struct RecordingManager {
        backends: Vec<String>,
        debug: bool,
        errors: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingManager {
        fn new(backends: Vec<String>, debug: bool) -> (Self, Arc<Mutex<Vec<String>>>) {
            let errors = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    backends,
                    debug,
                    errors: errors.clone(),
                },
                errors,
            )
        }
    }

    impl Manager for RecordingManager {
        fn backends(&self) -> Vec<String> {
            self.backends.clone()
        }

        fn tls_config(&self) -> Option<TlsConnector> {
            None
        }

        fn on_error(&self, message: &str, err: &Error) {
            self.errors.lock().push(format!("{}: {}", message, err));
        }

        fn randomize(&self) -> bool {
            false
        }

        fn is_debug(&self) -> bool {
            self.debug
        }
    }

    /// Backend that reports every data frame and answers scripted ones:
    /// "PING" gets "PONG", "echo:*" is echoed, "close-me" gets close 4000.
    async fn spawn_backend() -> (SocketAddr, UnboundedReceiver<Message>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let frames_tx = frames_tx.clone();
                tokio::spawn(async move {
                    // Liveness probes connect and leave without a handshake
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else { return };
                    while let Some(Ok(message)) = ws.next().await {
                        let _ = frames_tx.send(message.clone());
                        let reply = match &message {
                            Message::Binary(data) if data.as_slice() == b"PING" => {
                                Some(Message::Binary(b"PONG".to_vec()))
                            }
                            Message::Binary(data) if data.starts_with(b"echo:") => Some(message.clone()),
                            Message::Text(text) if text == "close-me" => Some(Message::Close(Some(CloseFrame {
                                code: CloseCode::Library(4000),
                                reason: "bye".into(),
                            }))),
                            _ => None,
                        };
                        if let Some(reply) = reply {
                            if ws.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });

        (addr, frames_rx)
    }

    /// Plain TCP listener counting every connection made to it
    async fn spawn_counting_backend() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
        (addr, accepted)
    }

    /// NATS server over WebSocket that reports every protocol line it reads
    /// and answers PING with PONG
    async fn spawn_nats_backend() -> (SocketAddr, UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (lines_tx, lines_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let lines_tx = lines_tx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else { return };
                    let info = format!("{}\r\n", TEST_INFO).into_bytes();
                    if ws.send(Message::Binary(info)).await.is_err() {
                        return;
                    }

                    let mut pending = Vec::new();
                    while let Some(Ok(message)) = ws.next().await {
                        let Message::Binary(data) = message else { continue };
                        pending.extend_from_slice(&data);
                        while let Some(end) = pending.windows(2).position(|w| w == b"\r\n") {
                            let line: Vec<u8> = pending.drain(..end + 2).collect();
                            let line = String::from_utf8_lossy(&line[..end]).to_string();
                            if line == "PING" && ws.send(Message::Binary(b"PONG\r\n".to_vec())).await.is_err() {
                                return;
                            }
                            let _ = lines_tx.send(line);
                        }
                    }
                });
            }
        });

        (addr, lines_rx)
    }

    async fn next_line(lines: &mut UnboundedReceiver<String>) -> String {
        timeout(Duration::from_secs(5), lines.recv())
            .await
            .expect("backend line in time")
            .expect("backend alive")
    }

    async fn unreachable_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    async fn spawn_relay<M: Manager>(manager: M) -> (Relay<M>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Relay::new(manager, RelayConfig::default());
        let serving = relay.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        (relay, addr)
    }

    async fn next_data(frames: &mut UnboundedReceiver<Message>) -> Message {
        loop {
            let message = timeout(Duration::from_secs(5), frames.recv())
                .await
                .expect("backend frame in time")
                .expect("backend alive");
            if message.is_binary() || message.is_text() || message.is_close() {
                return message;
            }
        }
    }

    async fn wait_for_errors(errors: &Arc<Mutex<Vec<String>>>, count: usize) {
        for _ in 0..100 {
            if errors.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_truncate_reason() {
        assert_eq!(truncate_reason("short"), "short");

        let long = "x".repeat(200);
        assert_eq!(truncate_reason(&long).len(), MAX_CLOSE_REASON_LEN);

        // Multi-byte characters are never split
        let wide = "é".repeat(100);
        let truncated = truncate_reason(&wide);
        assert!(truncated.len() <= MAX_CLOSE_REASON_LEN);
        assert_eq!(truncated.len(), 122);
    }

    #[test]
    fn test_close_frame_reuses_peer_code() {
        let frame = close_frame_for(&Error::Closed {
            code: 4001,
            reason: "custom".into(),
        });
        assert_eq!(frame.code, CloseCode::Library(4001));
        assert_eq!(frame.reason, "custom");
    }

    #[test]
    fn test_close_frame_defaults_to_normal() {
        let frame = close_frame_for(&Error::Cancelled);
        assert_eq!(frame.code, CloseCode::Normal);
        assert_eq!(frame.reason, "Cancelled");

        // No status received cannot go on the wire
        let frame = close_frame_for(&Error::Closed {
            code: 1005,
            reason: String::new(),
        });
        assert_eq!(frame.code, CloseCode::Normal);
    }

    #[tokio::test]
    async fn test_relays_to_reachable_backend() {
        let dead = unreachable_addr().await;
        let (live, mut frames) = spawn_backend().await;
        let (manager, errors) = RecordingManager::new(
            vec![format!("ws://{}", dead), format!("ws://{}", live)],
            false,
        );
        let (relay, relay_addr) = spawn_relay(manager).await;

        let (mut client, _) = connect_async(format!("ws://{}/natsws/test-client", relay_addr))
            .await
            .expect("upgrade accepted");

        client.send(Message::Binary(b"PING".to_vec())).await.unwrap();
        assert_eq!(next_data(&mut frames).await, Message::Binary(b"PING".to_vec()));

        let reply = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("reply in time")
            .expect("stream open")
            .expect("valid frame");
        assert_eq!(reply, Message::Binary(b"PONG".to_vec()));

        assert_eq!(relay.metrics().sessions_active(), 1);
        assert!(errors.lock().is_empty());
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_unavailable_when_no_backend_reachable() {
        let (manager, errors) = RecordingManager::new(
            vec![
                format!("ws://{}", unreachable_addr().await),
                format!("ws://{}", unreachable_addr().await),
            ],
            false,
        );
        let (relay, relay_addr) = spawn_relay(manager).await;

        let result = connect_async(format!("ws://{}/natsws/test-client", relay_addr)).await;
        match result {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            }
            other => panic!("expected 503, got {:?}", other.map(|_| ())),
        }

        assert_eq!(relay.metrics().backend_unavailable(), 1);
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("No backend available"));
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_rejects_unknown_path() {
        let (backend, accepted) = spawn_counting_backend().await;
        let (manager, errors) = RecordingManager::new(vec![format!("ws://{}", backend)], false);
        let (relay, relay_addr) = spawn_relay(manager).await;

        let result = connect_async(format!("ws://{}/other", relay_addr)).await;
        match result {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND);
            }
            other => panic!("expected 404, got {:?}", other.map(|_| ())),
        }
        assert_eq!(relay.metrics().upgrade_failures(), 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 0, "backend contacted for a bad path");
        assert!(errors.lock().is_empty());
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_silent_client_never_reaches_backend() {
        let (backend, accepted) = spawn_counting_backend().await;
        let (manager, errors) = RecordingManager::new(vec![format!("ws://{}", backend)], false);
        let config = RelayConfig::builder()
            .handshake_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = listener.local_addr().unwrap();
        let relay = Relay::new(manager, config);
        let serving = relay.clone();
        tokio::spawn(async move { serving.serve(listener).await });

        let mut idle = Vec::new();
        for _ in 0..5 {
            idle.push(TcpStream::connect(relay_addr).await.unwrap());
        }

        // The relay gives up on each silent client by closing its socket
        for stream in &mut idle {
            let mut buf = [0u8; 16];
            let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("relay closes a silent client");
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 0);
        assert_eq!(relay.metrics().upgrade_failures(), 5);
        assert!(errors.lock().is_empty());
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_ends_pending_handshake() {
        let (backend, _accepted) = spawn_counting_backend().await;
        let (manager, _errors) = RecordingManager::new(vec![format!("ws://{}", backend)], false);
        let relay = Relay::new(manager, RelayConfig::default());

        let (mut client, server) = tokio::io::duplex(1024);
        let handling = tokio::spawn({
            let relay = relay.clone();
            async move { relay.handle(server).await }
        });
        client.write_all(b"GET /natsws/partial HTTP/1.1\r\n").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        relay.shutdown();

        let result = timeout(Duration::from_secs(5), handling)
            .await
            .expect("handle returns after shutdown")
            .unwrap();
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_client_connection_through_relay() {
        let (backend, mut lines) = spawn_nats_backend().await;
        let (manager, errors) = RecordingManager::new(vec![format!("ws://{}", backend)], false);
        let (relay, relay_addr) = spawn_relay(manager).await;

        let config = ClientConfig::builder()
            .origin(Url::parse(&format!("http://{}", relay_addr)).unwrap())
            .keepalive_interval(Duration::from_secs(60))
            .build()
            .unwrap();
        let conn = ClientConnection::start(config, &MemoryStore::new()).unwrap();

        let connect = next_line(&mut lines).await;
        assert!(connect.starts_with("CONNECT "), "got {:?}", connect);
        assert!(connect.contains(conn.client_name()));
        assert_eq!(next_line(&mut lines).await, "PING");

        for _ in 0..200 {
            if conn.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(conn.is_connected());

        conn.publish("greet.relay", "hi").await.unwrap();
        assert_eq!(next_line(&mut lines).await, "PUB greet.relay 2");
        assert_eq!(next_line(&mut lines).await, "hi");

        assert_eq!(relay.metrics().sessions_active(), 1);
        assert!(errors.lock().is_empty(), "errors: {:?}", errors.lock());
        conn.shutdown().await;
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_frames_arrive_unmodified_and_in_order() {
        let (live, mut frames) = spawn_backend().await;
        let (manager, _errors) = RecordingManager::new(vec![format!("ws://{}", live)], false);
        let (relay, relay_addr) = spawn_relay(manager).await;

        let (mut client, _) = connect_async(format!("ws://{}/natsws/ordered", relay_addr))
            .await
            .unwrap();

        let sent: Vec<Vec<u8>> = (0..50u8)
            .map(|i| {
                let mut frame = b"echo:".to_vec();
                frame.extend(std::iter::repeat(i).take(i as usize + 1));
                frame
            })
            .collect();

        for frame in &sent {
            client.send(Message::Binary(frame.clone())).await.unwrap();
        }

        for frame in &sent {
            assert_eq!(next_data(&mut frames).await, Message::Binary(frame.clone()));
        }
        for frame in &sent {
            let echoed = timeout(Duration::from_secs(5), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(echoed, Message::Binary(frame.clone()));
        }

        let metrics = relay.metrics();
        assert_eq!(metrics.frames(Direction::ClientToBackend), 50);
        assert_eq!(metrics.frames(Direction::BackendToClient), 50);
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_backend_close_code_reaches_client() {
        let (live, _frames) = spawn_backend().await;
        let (manager, errors) = RecordingManager::new(vec![format!("ws://{}", live)], false);
        let (relay, relay_addr) = spawn_relay(manager).await;

        let (mut client, _) = connect_async(format!("ws://{}/natsws/closer", relay_addr))
            .await
            .unwrap();
        client.send(Message::Text("close-me".to_string())).await.unwrap();

        let frame = loop {
            let message = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("close in time")
                .expect("stream open")
                .expect("valid frame");
            if let Message::Close(frame) = message {
                break frame.expect("close frame carries a code");
            }
        };
        assert_eq!(frame.code, CloseCode::Library(4000));
        assert_eq!(frame.reason, "bye");

        // Exactly one report for the session
        wait_for_errors(&errors, 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let errors = errors.lock().clone();
        assert_eq!(errors.len(), 1, "errors: {:?}", errors);
        assert!(errors[0].contains("4000"));
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_client_normal_close_is_not_reported() {
        let (live, mut frames) = spawn_backend().await;
        let (manager, errors) = RecordingManager::new(vec![format!("ws://{}", live)], false);
        let (relay, relay_addr) = spawn_relay(manager).await;

        let (mut client, _) = connect_async(format!("ws://{}/natsws/leaver", relay_addr))
            .await
            .unwrap();
        client
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            }))
            .await
            .unwrap();

        // Backend sees a close derived from the client's
        let message = next_data(&mut frames).await;
        match message {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("expected close frame, got {:?}", other),
        }

        for _ in 0..100 {
            if relay.metrics().sessions_active() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(relay.metrics().sessions_active(), 0);
        assert!(errors.lock().is_empty(), "errors: {:?}", errors.lock());
        relay.shutdown();
    }

    #[tokio::test]
    async fn test_debug_payload_cancels_session() {
        let (live, _frames) = spawn_backend().await;
        let manager = StaticManager::builder()
            .backends(vec![format!("ws://{}", live)])
            .debug(true)
            .build();
        let (relay, relay_addr) = spawn_relay(manager).await;

        let (mut client, _) = connect_async(format!("ws://{}/natsws/debugger", relay_addr))
            .await
            .unwrap();
        client
            .send(Message::Binary(b"PUB demo.disconnect 0\r\n\r\n".to_vec()))
            .await
            .unwrap();

        let ended = timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(ended.is_ok(), "session should end after the debug payload");
        relay.shutdown();
    }
}
