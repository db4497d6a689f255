//! WebSocket transport adapter.
//!
//! Gives a broker client a duplex byte stream over WebSocket in place of a
//! raw socket: every write becomes one binary message and reads consume the
//! messages in order.

use crate::error::Error;
use bytes::{Buf, Bytes};
use futures_util::{ready, Sink, Stream};
use native_tls::TlsConnector;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite, tungstenite::client::IntoClientRequest,
    tungstenite::Message, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace};
use url::Url;

/// WebSocket stream to a dialed endpoint
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Produces a live duplex byte stream to a target endpoint on demand.
///
/// The broker client calls this wherever it would otherwise open a raw
/// socket, once per connection attempt.
pub trait Dialer: Send + Sync + 'static {
    /// The stream handed to the broker client
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Establish a new stream. Failures surface as connection errors; no
    /// partially established stream is ever returned.
    fn dial(&self) -> impl Future<Output = Result<Self::Stream, Error>> + Send;

    /// Endpoint description for logs
    fn endpoint(&self) -> String;
}

/// Dials a WebSocket URL and exposes it as a byte stream.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: String,
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
}

impl WebSocketDialer {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            tls: None,
            connect_timeout,
        }
    }

    /// Use a specific TLS configuration for `wss` URLs
    pub fn with_tls(mut self, tls: TlsConnector) -> Self {
        self.tls = Some(tls);
        self
    }
}

impl Dialer for WebSocketDialer {
    type Stream = WsByteStream<MaybeTlsStream<TcpStream>>;

    async fn dial(&self) -> Result<Self::Stream, Error> {
        let ws = connect(&self.url, self.tls.clone(), self.connect_timeout).await?;
        Ok(WsByteStream::new(ws))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

/// Dial a WebSocket endpoint with a timeout covering TCP connect, TLS and
/// the upgrade handshake.
pub async fn connect(
    url: &str,
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
) -> Result<WsStream, Error> {
    match timeout(connect_timeout, connect_inner(url, tls)).await {
        Ok(result) => result,
        Err(_) => Err(Error::connection_failed(url, "connection timeout")),
    }
}

async fn connect_inner(url: &str, tls: Option<TlsConnector>) -> Result<WsStream, Error> {
    let parsed_url = Url::parse(url).map_err(|e| Error::connection_failed(url, format!("invalid URL: {}", e)))?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| Error::connection_failed(url, "no host in URL"))?;

    let is_tls = match parsed_url.scheme() {
        "wss" => true,
        "ws" => false,
        scheme => {
            return Err(Error::connection_failed(
                url,
                format!("unsupported scheme: {}", scheme),
            ))
        }
    };
    let port = parsed_url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = url
        .into_client_request()
        .map_err(|e| Error::connection_failed(url, format!("invalid WebSocket request: {}", e)))?;

    let tcp_stream = connect_direct(host, port).await?;
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = match tls {
            Some(tls) => tls,
            None => TlsConnector::new()?,
        };
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector)
        .await
        .map_err(|e| match e {
            tungstenite::Error::Http(response) => Error::connection_failed(
                url,
                format!("upgrade rejected with status {}", response.status()),
            ),
            other => Error::WebSocket(other),
        })?;

    debug!("[TRANSPORT] Connected to {}", url);
    Ok(ws_stream)
}

/// Resolve and connect a TCP stream
pub(crate) async fn connect_direct(host: &str, port: u16) -> Result<TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::connection_failed(&dest_str, format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| Error::connection_failed(&dest_str, "no addresses found"))?;

    TcpStream::connect(dest_addr)
        .await
        .map_err(|e| Error::connection_failed(&dest_str, format!("TCP connect to {} failed: {}", dest_addr, e)))
}

/// Set TCP options for low latency
pub(crate) fn set_tcp_options(stream: &TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Enable TCP_NODELAY (disable Nagle's algorithm)
    let _ = sock2.set_nodelay(true);

    // Set keepalive to detect dead connections
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}

/// Duplex byte stream over a WebSocket.
///
/// Application bytes travel as binary messages. Text messages are read as
/// their UTF-8 bytes, control frames are skipped, and a close frame or the
/// end of the stream reads as EOF.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
    eof: bool,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            eof: false,
        }
    }

    /// Get the underlying WebSocket back
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.inner
    }
}

fn to_io_error(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(io) => io,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, e)
        }
        other => io::Error::other(other),
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    trace!("[TRANSPORT] Read {} bytes", data.len());
                    this.pending = Bytes::from(data);
                }
                Some(Ok(Message::Text(text))) => {
                    this.pending = Bytes::from(text.into_bytes());
                }
                Some(Ok(Message::Close(_))) | None => {
                    this.eof = true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(to_io_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(to_io_error)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(to_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(to_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(to_io_error)
    }
}
