use crate::broker::{BrokerClient, BrokerOptions, Message, MessageHandler, Subscription};
use crate::config::ClientConfig;
use crate::error::Error;
use crate::observable::{Observable, ObserverId};
use crate::storage::{establish_identity, KeyValueStore};
use crate::transport::{Dialer, WebSocketDialer};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Cause of the latest connection transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeReason {
    /// First connection of a broker client; subscribe here
    Connect,
    /// The broker client restored a lost connection with its subscriptions
    Reconnect,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected,
}

/// What observers receive on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub client_name: String,
    pub state: ConnectivityState,
    pub change_reason: Option<ChangeReason>,
    /// Subscriptions tracked when the snapshot was taken
    pub subscriptions: usize,
}

/// Commands handled by the supervising task
enum Command {
    Subscribe {
        subject: String,
        handler: MessageHandler,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Publish {
        subject: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Reconnect,
}

/// Resilient broker connection with a persisted identity.
///
/// One supervising task per connection owns the broker client, the tracked
/// subscriptions and the last change reason. Lifecycle callbacks from the
/// broker client are queued to that task, which publishes a new
/// [`ConnectionSnapshot`] to observers for each of them.
///
/// Cloning is cheap; clones share the same connection.
///
/// # Example
///
/// ```ignore
/// let config = ClientConfig::builder()
///     .origin(Url::parse("https://app.example.com")?)
///     .build()?;
/// let conn = ClientConnection::start(config, &FileStore::new("state.json"))?;
///
/// conn.observe(move |snapshot| {
///     if snapshot.change_reason == Some(ChangeReason::Connect) {
///         // subscribe from a task, not inside the observer
///     }
/// });
/// ```
#[derive(Clone)]
pub struct ClientConnection {
    client_name: Arc<str>,
    state: Arc<Observable<ConnectionSnapshot>>,
    subscriptions: Arc<AtomicUsize>,
    command_tx: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("client_name", &self.client_name)
            .field("state", &self.state.get())
            .finish()
    }
}

impl ClientConnection {
    /// Establish the identity and start connecting through the relay URL
    /// derived from `config`.
    pub fn start(config: ClientConfig, store: &dyn KeyValueStore) -> Result<Self, Error> {
        let client_name = establish_identity(store, &config.identity_key);
        let url = config.endpoint_url(&client_name)?;
        let dialer = WebSocketDialer::new(url, config.connect_timeout);
        Ok(Self::spawn(config, client_name, dialer))
    }

    /// Like [`start`](Self::start) with a caller-supplied transport
    pub fn start_with_dialer<D>(config: ClientConfig, store: &dyn KeyValueStore, dialer: D) -> Self
    where
        D: Dialer + Clone,
    {
        let client_name = establish_identity(store, &config.identity_key);
        Self::spawn(config, client_name, dialer)
    }

    fn spawn<D: Dialer + Clone>(config: ClientConfig, client_name: String, dialer: D) -> Self {
        let client_name: Arc<str> = Arc::from(client_name);
        let state = Arc::new(Observable::new(
            config.state_key.clone(),
            ConnectionSnapshot {
                client_name: client_name.to_string(),
                state: ConnectivityState::Connecting,
                change_reason: None,
                subscriptions: 0,
            },
        ));
        let subscriptions = Arc::new(AtomicUsize::new(0));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        info!("[CLIENT] Starting connection {} via {}", client_name, dialer.endpoint());

        let supervisor = Supervisor {
            config,
            client_name: client_name.clone(),
            dialer,
            state: state.clone(),
            subscription_count: subscriptions.clone(),
            broker: None,
            subscriptions: Vec::new(),
            connectivity: ConnectivityState::Connecting,
            change_reason: None,
            events_tx,
            events_rx,
        };
        let handle = tokio::spawn(supervisor.run(command_rx, token.clone()));

        Self {
            client_name,
            state,
            subscriptions,
            command_tx,
            token,
            task: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Identity this connection presents to the relay and the broker
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state.get().state == ConnectivityState::Connected
    }

    pub fn change_reason(&self) -> Option<ChangeReason> {
        self.state.get().change_reason
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }

    /// Key the snapshots are published under
    pub fn state_key(&self) -> &str {
        self.state.key()
    }

    /// Register an observer, invoked once per published snapshot
    pub fn observe(&self, observer: impl Fn(&ConnectionSnapshot) + Send + Sync + 'static) -> ObserverId {
        self.state.observe(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.state.remove_observer(id)
    }

    /// Subscribe `handler` to `subject`.
    ///
    /// Fails with [`Error::NotConnected`] without side effects unless the
    /// broker connection is up.
    pub async fn subscribe<F>(&self, subject: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            subject: subject.to_string(),
            handler: Arc::new(handler),
            reply,
        })?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Publish `payload` on `subject`; same precondition as
    /// [`subscribe`](Self::subscribe).
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Publish {
            subject: subject.to_string(),
            payload: payload.into(),
            reply,
        })?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Drop the broker connection and its subscriptions, then connect again
    /// after the configured reconnect delay.
    pub fn reconnect(&self) -> Result<(), Error> {
        self.send(Command::Reconnect)
    }

    /// Unsubscribe everything, close the broker connection and stop the
    /// supervising task. Terminal.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        if self.token.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.command_tx.send(command).map_err(|_| Error::ShuttingDown)
    }
}

/// Single writer of the connection state
struct Supervisor<D> {
    config: ClientConfig,
    client_name: Arc<str>,
    dialer: D,
    state: Arc<Observable<ConnectionSnapshot>>,
    subscription_count: Arc<AtomicUsize>,
    broker: Option<BrokerClient>,
    subscriptions: Vec<Subscription>,
    connectivity: ConnectivityState,
    change_reason: Option<ChangeReason>,
    events_tx: mpsc::UnboundedSender<ChangeReason>,
    events_rx: mpsc::UnboundedReceiver<ChangeReason>,
}

impl<D: Dialer + Clone> Supervisor<D> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, token: CancellationToken) {
        // The initial connect is due immediately
        let mut connect_at = Some(Instant::now());

        let period = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = connect_at.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                Some(reason) = self.events_rx.recv() => self.apply(reason),

                command = commands.recv() => match command {
                    Some(Command::Subscribe { subject, handler, reply }) => {
                        let _ = reply.send(self.subscribe(&subject, handler));
                    }
                    Some(Command::Publish { subject, payload, reply }) => {
                        let _ = reply.send(self.publish(&subject, payload));
                    }
                    Some(Command::Reconnect) => {
                        info!(
                            "[CLIENT] {} reconnecting in {:?}",
                            self.client_name, self.config.reconnect_delay
                        );
                        self.teardown().await;
                        connect_at = Some(Instant::now() + self.config.reconnect_delay);
                    }
                    // Every handle is gone
                    None => break,
                },

                _ = sleep_until(deadline), if connect_at.is_some() => {
                    connect_at = None;
                    match self.connect(&token).await {
                        Ok(()) | Err(Error::Cancelled) => {}
                        Err(e) => {
                            warn!("[CLIENT] {} failed to start broker client: {}", self.client_name, e);
                            connect_at = Some(Instant::now() + self.config.reconnect_delay);
                        }
                    }
                }

                _ = keepalive.tick() => self.keepalive(),
            }
        }

        self.teardown().await;
        // Deliver what the closing broker client reported
        while let Ok(reason) = self.events_rx.try_recv() {
            self.apply(reason);
        }
        info!("[CLIENT] {} stopped", self.client_name);
    }

    async fn connect(&mut self, token: &CancellationToken) -> Result<(), Error> {
        let (on_connect, on_reconnect, on_disconnect) =
            (self.events_tx.clone(), self.events_tx.clone(), self.events_tx.clone());

        let options = BrokerOptions::builder()
            .name(&*self.client_name)
            .retry_on_failed_connect(true)
            .backoff(self.config.backoff.clone())
            .connect_timeout(self.config.connect_timeout)
            .on_connect(move || {
                let _ = on_connect.send(ChangeReason::Connect);
            })
            .on_reconnect(move || {
                let _ = on_reconnect.send(ChangeReason::Reconnect);
            })
            .on_disconnect(move |err| {
                if let Some(err) = err {
                    debug!("[CLIENT] Broker connection lost: {}", err);
                }
                let _ = on_disconnect.send(ChangeReason::Disconnect);
            })
            .build()?;

        let broker = tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            broker = BrokerClient::connect(self.dialer.clone(), options) => broker?,
        };
        self.broker = Some(broker);
        Ok(())
    }

    fn connected_broker(&self) -> Result<&BrokerClient, Error> {
        match &self.broker {
            Some(broker) if broker.is_connected() => Ok(broker),
            _ => Err(Error::NotConnected),
        }
    }

    fn subscribe(&mut self, subject: &str, handler: MessageHandler) -> Result<(), Error> {
        let broker = self.connected_broker()?;
        let subscription = broker.subscribe(subject, move |message| handler(message))?;
        self.subscriptions.push(subscription);
        self.subscription_count.store(self.subscriptions.len(), Ordering::Relaxed);
        debug!("[CLIENT] {} subscribed to {}", self.client_name, subject);
        Ok(())
    }

    fn publish(&self, subject: &str, payload: Bytes) -> Result<(), Error> {
        self.connected_broker()?.publish(subject, payload)
    }

    fn keepalive(&self) {
        let Some(broker) = &self.broker else { return };
        if broker.is_reconnecting() {
            trace!("[CLIENT] {} reconnecting, skipping keepalive", self.client_name);
            return;
        }
        let payload = format!("ping from {}", self.client_name);
        if let Err(e) = broker.publish(&self.config.keepalive_subject, payload) {
            trace!("[CLIENT] Keepalive not sent: {}", e);
        }
    }

    /// Unsubscribe everything and close the broker client
    async fn teardown(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            let subject = subscription.subject().to_string();
            if let Err(e) = subscription.unsubscribe() {
                debug!("[CLIENT] Unsubscribing {} failed: {}", subject, e);
            }
        }
        self.subscription_count.store(0, Ordering::Relaxed);

        if let Some(broker) = self.broker.take() {
            broker.close().await;
        }
    }

    fn apply(&mut self, reason: ChangeReason) {
        self.change_reason = Some(reason);
        self.connectivity = match reason {
            ChangeReason::Connect | ChangeReason::Reconnect => ConnectivityState::Connected,
            ChangeReason::Disconnect => ConnectivityState::Disconnected,
        };
        info!("[CLIENT] {} {:?}", self.client_name, reason);

        self.state.set(ConnectionSnapshot {
            client_name: self.client_name.to_string(),
            state: self.connectivity,
            change_reason: self.change_reason,
            subscriptions: self.subscriptions.len(),
        });
    }
}
