use crate::broker::codec::{validate_subject, ClientOp, ConnectInfo, NatsCodec, ServerInfo, ServerOp, DEFAULT_MAX_PAYLOAD};
use crate::config::{BackoffConfig, ConfigError};
use crate::error::Error;
use crate::transport::Dialer;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Duration, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// A message delivered to a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Handler invoked for every message on a subscription
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Lifecycle callback
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// Invoked when an established connection is lost (`Some`) or closed (`None`)
pub type DisconnectCallback = Arc<dyn Fn(Option<&Error>) + Send + Sync>;

/// Invoked with the websocket endpoints a server advertises, when they change
pub type DiscoveryCallback = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Connection status of a [`BrokerClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerStatus {
    /// First connection attempt in progress
    Connecting,
    Connected,
    /// Connection lost, retrying with backoff
    Reconnecting,
    /// Closed for good
    Closed,
}

/// Options for a [`BrokerClient`]
#[derive(Clone)]
pub struct BrokerOptions {
    pub name: Option<String>,
    /// Keep retrying in the background when the first attempt fails
    pub retry_on_failed_connect: bool,
    pub backoff: BackoffConfig,
    /// Time allowed for dial plus handshake
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    /// Unanswered pings tolerated before the connection is considered stale
    pub max_pings_outstanding: u32,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    pub max_payload: usize,
    on_connect: Option<EventCallback>,
    on_reconnect: Option<EventCallback>,
    on_disconnect: Option<DisconnectCallback>,
    on_closed: Option<EventCallback>,
    on_discovered_servers: Option<DiscoveryCallback>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            name: None,
            retry_on_failed_connect: false,
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(120),
            max_pings_outstanding: 2,
            max_reconnect_attempts: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            on_connect: None,
            on_reconnect: None,
            on_disconnect: None,
            on_closed: None,
            on_discovered_servers: None,
        }
    }
}

impl fmt::Debug for BrokerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerOptions")
            .field("name", &self.name)
            .field("retry_on_failed_connect", &self.retry_on_failed_connect)
            .field("backoff", &self.backoff)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("max_pings_outstanding", &self.max_pings_outstanding)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish_non_exhaustive()
    }
}

impl BrokerOptions {
    /// Create a new builder
    pub fn builder() -> BrokerOptionsBuilder {
        BrokerOptionsBuilder::default()
    }

    pub(crate) fn set_on_discovered_servers(&mut self, f: impl Fn(&[String]) + Send + Sync + 'static) {
        self.on_discovered_servers = Some(Arc::new(f));
    }
}

/// Builder for BrokerOptions
#[derive(Default)]
pub struct BrokerOptionsBuilder {
    options: BrokerOptions,
}

impl BrokerOptionsBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    pub fn retry_on_failed_connect(mut self, retry: bool) -> Self {
        self.options.retry_on_failed_connect = retry;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.options.backoff = backoff;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.options.connect_timeout = connect_timeout;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.options.ping_interval = interval;
        self
    }

    pub fn max_pings_outstanding(mut self, max: u32) -> Self {
        self.options.max_pings_outstanding = max;
        self
    }

    pub fn max_reconnect_attempts(mut self, max: u32) -> Self {
        self.options.max_reconnect_attempts = Some(max);
        self
    }

    pub fn max_payload(mut self, max: usize) -> Self {
        self.options.max_payload = max;
        self
    }

    /// Called after the first successful connection
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.options.on_connect = Some(Arc::new(f));
        self
    }

    /// Called after every successful reconnection
    pub fn on_reconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.options.on_reconnect = Some(Arc::new(f));
        self
    }

    /// Called when an established connection ends
    pub fn on_disconnect(mut self, f: impl Fn(Option<&Error>) + Send + Sync + 'static) -> Self {
        self.options.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Called once the client is closed for good
    pub fn on_closed(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.options.on_closed = Some(Arc::new(f));
        self
    }

    /// Called with [`BrokerClient::discovered_servers`] whenever a server
    /// advertises a different set of websocket endpoints
    pub fn on_discovered_servers(mut self, f: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        self.options.set_on_discovered_servers(f);
        self
    }

    pub fn build(self) -> Result<BrokerOptions, ConfigError> {
        self.options.backoff.validate()?;
        if self.options.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("connect_timeout must be > 0".into()));
        }
        if self.options.ping_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout("ping_interval must be > 0".into()));
        }
        Ok(self.options)
    }
}

enum Command {
    Publish { subject: String, payload: Bytes },
    Subscribe { sid: u64, subject: String },
    Unsubscribe { sid: u64 },
}

struct SubscriptionEntry {
    subject: String,
    handler: MessageHandler,
}

/// State shared between client handles and the connection task
struct Shared {
    name: Option<String>,
    status: RwLock<BrokerStatus>,
    subscriptions: RwLock<HashMap<u64, SubscriptionEntry>>,
    next_sid: AtomicU64,
    server_info: RwLock<Option<ServerInfo>>,
    /// Largest payload a publish may carry; tightened by the server's INFO
    max_payload: AtomicUsize,
    token: CancellationToken,
}

impl Shared {
    fn set_status(&self, status: BrokerStatus) {
        *self.status.write() = status;
    }

    fn status(&self) -> BrokerStatus {
        *self.status.read()
    }
}

/// NATS client speaking the core protocol over any [`Dialer`] stream.
///
/// A background task owns the connection, reconnects with backoff and
/// restores subscriptions. Cloning is cheap; clones share the connection.
///
/// # Example
///
/// ```ignore
/// let dialer = WebSocketDialer::new("ws://localhost:8080/natsws/abc", Duration::from_secs(10));
/// let client = BrokerClient::connect(dialer, BrokerOptions::default()).await?;
///
/// let sub = client.subscribe("updates.>", |msg| println!("{:?}", msg.payload))?;
/// client.publish("updates.greeting", "hello")?;
/// ```
#[derive(Clone)]
pub struct BrokerClient {
    shared: Arc<Shared>,
    command_tx: mpsc::UnboundedSender<Command>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerClient")
            .field("name", &self.shared.name)
            .field("status", &self.shared.status())
            .finish()
    }
}

impl BrokerClient {
    /// Connect using `dialer` and wait for the first attempt.
    ///
    /// Returns the first attempt's error unless `retry_on_failed_connect`
    /// is set, in which case the client keeps retrying in the background.
    pub async fn connect<D: Dialer>(dialer: D, options: BrokerOptions) -> Result<Self, Error> {
        let shared = Arc::new(Shared {
            name: options.name.clone(),
            status: RwLock::new(BrokerStatus::Connecting),
            subscriptions: RwLock::new(HashMap::new()),
            next_sid: AtomicU64::new(1),
            server_info: RwLock::new(None),
            max_payload: AtomicUsize::new(options.max_payload),
            token: CancellationToken::new(),
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let connection = Connection {
            dialer,
            options,
            shared: shared.clone(),
            command_rx,
            ready_tx: Some(ready_tx),
        };
        let handle = tokio::spawn(connection.run());

        // Stops the task if this future is dropped before the first attempt ends
        let guard = shared.token.clone().drop_guard();

        match ready_rx.await {
            Ok(Ok(())) => {
                guard.disarm();
                Ok(Self {
                    shared,
                    command_tx,
                    task: Arc::new(Mutex::new(Some(handle))),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.await;
                Err(e)
            }
            Err(_) => Err(Error::ShuttingDown),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    pub fn status(&self) -> BrokerStatus {
        self.shared.status()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == BrokerStatus::Connected
    }

    pub fn is_reconnecting(&self) -> bool {
        self.status() == BrokerStatus::Reconnecting
    }

    pub fn is_closed(&self) -> bool {
        self.status() == BrokerStatus::Closed
    }

    /// INFO from the most recent server
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.server_info.read().clone()
    }

    /// WebSocket endpoints the cluster advertised, as `ws://host:port`
    pub fn discovered_servers(&self) -> Vec<String> {
        self.shared
            .server_info
            .read()
            .as_ref()
            .map(websocket_urls)
            .unwrap_or_default()
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.read().len()
    }

    /// Publish `payload` on `subject`.
    ///
    /// While reconnecting the message is buffered and sent once the
    /// connection is back. Payloads above the negotiated `max_payload`
    /// are rejected here and never reach the connection.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<(), Error> {
        validate_subject(subject, false)?;
        let payload = payload.into();
        let max_payload = self.shared.max_payload.load(Ordering::Relaxed);
        if payload.len() > max_payload {
            return Err(Error::Protocol(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                max_payload
            )));
        }
        self.send(Command::Publish {
            subject: subject.to_string(),
            payload,
        })
    }

    /// Subscribe to `subject`; `handler` runs on the connection task for
    /// every message. The subscription survives reconnects.
    pub fn subscribe<F>(&self, subject: &str, handler: F) -> Result<Subscription, Error>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        validate_subject(subject, true)?;
        if self.is_closed() {
            return Err(Error::ShuttingDown);
        }

        let sid = self.shared.next_sid.fetch_add(1, Ordering::Relaxed);
        self.shared.subscriptions.write().insert(
            sid,
            SubscriptionEntry {
                subject: subject.to_string(),
                handler: Arc::new(handler),
            },
        );

        if let Err(e) = self.send(Command::Subscribe {
            sid,
            subject: subject.to_string(),
        }) {
            self.shared.subscriptions.write().remove(&sid);
            return Err(e);
        }

        debug!("[BROKER] Subscribed to {} (sid {})", subject, sid);
        Ok(Subscription {
            sid,
            subject: subject.to_string(),
            client: self.clone(),
        })
    }

    fn unsubscribe(&self, sid: u64) -> Result<(), Error> {
        if self.shared.subscriptions.write().remove(&sid).is_none() {
            return Ok(());
        }
        self.send(Command::Unsubscribe { sid })
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        if self.shared.token.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.command_tx.send(command).map_err(|_| Error::ShuttingDown)
    }

    /// Close the connection and wait for the connection task to finish
    pub async fn close(&self) {
        self.shared.token.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Handle to a live subscription
#[derive(Debug)]
pub struct Subscription {
    sid: u64,
    subject: String,
    client: BrokerClient,
}

impl Subscription {
    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Stop delivery and tell the server
    pub fn unsubscribe(self) -> Result<(), Error> {
        self.client.unsubscribe(self.sid)
    }
}

/// Outcome of a connected session
enum SessionEnd {
    /// Close requested
    Stop,
    Lost(Error),
}

/// Background task owning the broker connection
struct Connection<D: Dialer> {
    dialer: D,
    options: BrokerOptions,
    shared: Arc<Shared>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    /// Signals the outcome of the first attempt to `BrokerClient::connect`
    ready_tx: Option<oneshot::Sender<Result<(), Error>>>,
}

impl<D: Dialer> Connection<D> {
    async fn run(mut self) {
        let mut attempt = 0u32;
        let mut has_connected = false;
        let token = self.shared.token.clone();

        loop {
            if attempt > 0 {
                let delay = self.options.backoff.delay_for_attempt(attempt - 1);
                debug!(
                    "[BROKER] Reconnecting to {} in {:?} (attempt {})",
                    self.dialer.endpoint(),
                    delay,
                    attempt
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let established = tokio::select! {
                _ = token.cancelled() => break,
                result = timeout(self.options.connect_timeout, self.establish()) => match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::connection_failed(&self.dialer.endpoint(), "connect timeout")),
                },
            };

            let mut framed = match established {
                Ok(framed) => framed,
                Err(e) => {
                    debug!("[BROKER] Connect to {} failed: {}", self.dialer.endpoint(), e);
                    if let Some(ready_tx) = self.ready_tx.take() {
                        if !self.options.retry_on_failed_connect {
                            self.shared.set_status(BrokerStatus::Closed);
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                        self.shared.set_status(BrokerStatus::Reconnecting);
                        let _ = ready_tx.send(Ok(()));
                    }

                    attempt += 1;
                    if let Some(max) = self.options.max_reconnect_attempts {
                        if attempt > max {
                            error!("[BROKER] Max reconnection attempts ({}) reached", max);
                            break;
                        }
                    }
                    continue;
                }
            };

            if let Err(e) = self.restore(&mut framed).await {
                warn!("[BROKER] Restoring session failed: {}", e);
                attempt += 1;
                continue;
            }

            self.shared.set_status(BrokerStatus::Connected);
            info!("[BROKER] Connected to {}", self.dialer.endpoint());

            let callback = if has_connected {
                self.options.on_reconnect.clone()
            } else {
                self.options.on_connect.clone()
            };
            has_connected = true;
            if let Some(callback) = callback {
                callback();
            }
            if let Some(ready_tx) = self.ready_tx.take() {
                let _ = ready_tx.send(Ok(()));
            }

            match self.drive(&mut framed, &token).await {
                SessionEnd::Stop => {
                    let closing = async {
                        self.flush_pending(&mut framed).await?;
                        framed.close().await?;
                        Ok::<(), Error>(())
                    };
                    if let Ok(Err(e)) = timeout(Duration::from_secs(1), closing).await {
                        debug!("[BROKER] Flushing on close failed: {}", e);
                    }
                    break;
                }
                SessionEnd::Lost(e) => {
                    if e.is_benign() {
                        info!("[BROKER] Connection to {} closed: {}", self.dialer.endpoint(), e);
                    } else {
                        warn!("[BROKER] Connection to {} lost: {}", self.dialer.endpoint(), e);
                    }
                    self.shared.set_status(BrokerStatus::Reconnecting);
                    if let Some(callback) = &self.options.on_disconnect {
                        callback(Some(&e));
                    }
                    attempt = 1;
                }
            }
        }

        let was_connected = self.shared.status() == BrokerStatus::Connected;
        self.shared.set_status(BrokerStatus::Closed);
        if was_connected {
            if let Some(callback) = &self.options.on_disconnect {
                callback(None);
            }
        }
        if let Some(callback) = &self.options.on_closed {
            callback();
        }
        if let Some(ready_tx) = self.ready_tx.take() {
            let _ = ready_tx.send(Err(Error::ShuttingDown));
        }
        info!("[BROKER] Connection to {} closed", self.dialer.endpoint());
    }

    /// Dial and run the INFO / CONNECT / PING / PONG handshake
    async fn establish(&self) -> Result<Framed<D::Stream, NatsCodec>, Error> {
        let stream = self.dialer.dial().await?;
        let mut framed = Framed::new(stream, NatsCodec::new(self.options.max_payload));

        match framed.next().await {
            Some(Ok(ServerOp::Info(info))) => self.update_info(*info),
            Some(Ok(op)) => return Err(Error::Protocol(format!("expected INFO, got {:?}", op))),
            Some(Err(e)) => return Err(e),
            None => return Err(eof()),
        }

        framed
            .send(ClientOp::Connect(ConnectInfo::new(self.options.name.clone())))
            .await?;
        framed.send(ClientOp::Ping).await?;

        loop {
            match framed.next().await {
                Some(Ok(ServerOp::Pong)) => return Ok(framed),
                Some(Ok(ServerOp::Ok)) => {}
                Some(Ok(ServerOp::Ping)) => framed.send(ClientOp::Pong).await?,
                Some(Ok(ServerOp::Info(info))) => self.update_info(*info),
                Some(Ok(ServerOp::Err(message))) => return Err(Error::Protocol(message)),
                Some(Ok(ServerOp::Msg { .. })) => {}
                Some(Err(e)) => return Err(e),
                None => return Err(eof()),
            }
        }
    }

    /// Replay subscriptions and flush publishes buffered during the outage
    async fn restore<S>(&mut self, framed: &mut Framed<S, NatsCodec>) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Subscribe/unsubscribe commands are superseded by the registry
        let mut pending = Vec::new();
        while let Ok(command) = self.command_rx.try_recv() {
            if let Command::Publish { subject, payload } = command {
                pending.push(ClientOp::Pub {
                    subject,
                    reply: None,
                    payload,
                });
            }
        }

        let subscriptions: Vec<(u64, String)> = self
            .shared
            .subscriptions
            .read()
            .iter()
            .map(|(sid, entry)| (*sid, entry.subject.clone()))
            .collect();

        if !subscriptions.is_empty() {
            debug!("[BROKER] Restoring {} subscriptions", subscriptions.len());
        }
        for (sid, subject) in subscriptions {
            framed.feed(ClientOp::Sub {
                subject,
                queue_group: None,
                sid,
            })
            .await?;
        }
        for op in pending {
            framed.feed(op).await?;
        }
        framed.flush().await
    }

    /// Write commands still queued when a close was requested
    async fn flush_pending<S>(&mut self, framed: &mut Framed<S, NatsCodec>) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Ok(command) = self.command_rx.try_recv() {
            let op = match command {
                Command::Publish { subject, payload } => ClientOp::Pub {
                    subject,
                    reply: None,
                    payload,
                },
                Command::Subscribe { sid, subject } => ClientOp::Sub {
                    subject,
                    queue_group: None,
                    sid,
                },
                Command::Unsubscribe { sid } => ClientOp::Unsub { sid, max: None },
            };
            framed.feed(op).await?;
        }
        framed.flush().await
    }

    async fn drive<S>(&mut self, framed: &mut Framed<S, NatsCodec>, token: &CancellationToken) -> SessionEnd
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ping_interval = self.options.ping_interval;
        let mut ping_timer = interval_at(Instant::now() + ping_interval, ping_interval);
        let mut pings_outstanding = 0u32;

        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return SessionEnd::Stop,

                op = framed.next() => match op {
                    Some(Ok(ServerOp::Msg { subject, sid, reply, payload })) => {
                        self.dispatch(sid, Message { subject, reply, payload });
                        Ok(())
                    }
                    Some(Ok(ServerOp::Ping)) => framed.send(ClientOp::Pong).await,
                    Some(Ok(ServerOp::Pong)) => {
                        trace!("[BROKER] Received pong");
                        pings_outstanding = 0;
                        Ok(())
                    }
                    Some(Ok(ServerOp::Info(info))) => {
                        self.update_info(*info);
                        Ok(())
                    }
                    Some(Ok(ServerOp::Ok)) => Ok(()),
                    Some(Ok(ServerOp::Err(message))) => {
                        warn!("[BROKER] Server error: {}", message);
                        if message.to_ascii_lowercase().contains("stale connection") {
                            Err(Error::Protocol(message))
                        } else {
                            Ok(())
                        }
                    }
                    Some(Err(e)) => Err(e),
                    None => Err(eof()),
                },

                command = self.command_rx.recv() => match command {
                    Some(Command::Publish { subject, payload }) => {
                        framed.send(ClientOp::Pub { subject, reply: None, payload }).await
                    }
                    Some(Command::Subscribe { sid, subject }) => {
                        framed.send(ClientOp::Sub { subject, queue_group: None, sid }).await
                    }
                    Some(Command::Unsubscribe { sid }) => {
                        framed.send(ClientOp::Unsub { sid, max: None }).await
                    }
                    // All client handles are gone
                    None => return SessionEnd::Stop,
                },

                _ = ping_timer.tick() => {
                    if pings_outstanding >= self.options.max_pings_outstanding {
                        Err(Error::Protocol("stale connection".into()))
                    } else {
                        pings_outstanding += 1;
                        framed.send(ClientOp::Ping).await
                    }
                }
            };

            if let Err(e) = result {
                return SessionEnd::Lost(e);
            }
        }
    }

    fn dispatch(&self, sid: u64, message: Message) {
        let handler = self.shared.subscriptions.read().get(&sid).map(|entry| entry.handler.clone());
        match handler {
            Some(handler) => handler(message),
            None => trace!("[BROKER] Dropping message for unknown sid {}", sid),
        }
    }

    fn update_info(&self, info: ServerInfo) {
        trace!(
            "[BROKER] Server {} advertises {} websocket endpoints",
            info.server_id,
            info.ws_connect_urls.len()
        );
        if info.max_payload > 0 {
            let limit = info.max_payload.min(self.options.max_payload);
            self.shared.max_payload.store(limit, Ordering::Relaxed);
        }

        let discovered = websocket_urls(&info);
        let previous = self.shared.server_info.write().replace(info);
        let changed = previous.map_or(true, |previous| websocket_urls(&previous) != discovered);
        if changed && !discovered.is_empty() {
            if let Some(callback) = &self.options.on_discovered_servers {
                callback(&discovered);
            }
        }
    }
}

/// Advertised websocket endpoints as `ws://host:port`
fn websocket_urls(info: &ServerInfo) -> Vec<String> {
    info.ws_connect_urls
        .iter()
        .map(|url| {
            if url.contains("://") {
                url.clone()
            } else {
                format!("ws://{}", url)
            }
        })
        .collect()
}

fn eof() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server"))
}
