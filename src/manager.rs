use crate::broker::{BrokerClient, BrokerOptions};
use crate::error::Error;
use crate::transport::Dialer;
use native_tls::TlsConnector;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Policy consulted by the relay for every upgrade request.
///
/// Implementations are read-only from the relay's point of view and are
/// shared across sessions without locking, so `backends()` is called fresh
/// for every request and topology changes take effect on the next one.
///
/// # Example
///
/// ```ignore
/// use natsws::{Manager, StaticManager};
///
/// let manager = StaticManager::builder()
///     .backends(vec!["ws://10.0.0.1:4223".into(), "ws://10.0.0.2:4223".into()])
///     .randomize(true)
///     .build();
/// ```
pub trait Manager: Send + Sync + 'static {
    /// Current backend endpoints, `ws://host:port` or `wss://host:port`.
    fn backends(&self) -> Vec<String>;

    /// TLS client configuration used for probing and dialing `wss` backends.
    fn tls_config(&self) -> Option<TlsConnector> {
        None
    }

    /// Sink for non-fatal relay errors.
    ///
    /// The default drops benign closures and logs everything else.
    fn on_error(&self, message: &str, err: &Error) {
        if err.is_benign() {
            debug!("[RELAY] {}: {}", message, err);
        } else {
            warn!("natsws.Manager message={} err={}", message, err);
        }
    }

    /// Shuffle `backends()` before probing.
    fn randomize(&self) -> bool;

    /// Log every relayed payload and honor the debug disconnect payload.
    fn is_debug(&self) -> bool;
}

/// Manager with a fixed backend list.
#[derive(Debug, Clone)]
pub struct StaticManager {
    backends: Vec<String>,
    randomize: bool,
    debug: bool,
    tls: Option<TlsConnector>,
}

impl StaticManager {
    /// Static manager that shuffles backends, the common setup for a fleet
    /// of relays in front of a cluster.
    pub fn new(debug: bool, backends: Vec<String>) -> Self {
        Self {
            backends,
            randomize: true,
            debug,
            tls: None,
        }
    }

    /// Create a new builder
    pub fn builder() -> StaticManagerBuilder {
        StaticManagerBuilder::default()
    }
}

impl Manager for StaticManager {
    fn backends(&self) -> Vec<String> {
        self.backends.clone()
    }

    fn tls_config(&self) -> Option<TlsConnector> {
        self.tls.clone()
    }

    fn randomize(&self) -> bool {
        self.randomize
    }

    fn is_debug(&self) -> bool {
        self.debug
    }
}

/// Builder for StaticManager
#[derive(Debug, Clone)]
pub struct StaticManagerBuilder {
    manager: StaticManager,
}

impl Default for StaticManagerBuilder {
    fn default() -> Self {
        Self {
            manager: StaticManager::new(false, Vec::new()),
        }
    }
}

impl StaticManagerBuilder {
    /// Set the backend list
    pub fn backends(mut self, backends: Vec<String>) -> Self {
        self.manager.backends = backends;
        self
    }

    /// Enable or disable shuffling before probing
    pub fn randomize(mut self, randomize: bool) -> Self {
        self.manager.randomize = randomize;
        self
    }

    /// Enable or disable payload debugging
    pub fn debug(mut self, debug: bool) -> Self {
        self.manager.debug = debug;
        self
    }

    /// Set the TLS configuration for `wss` backends
    pub fn tls_config(mut self, tls: TlsConnector) -> Self {
        self.manager.tls = Some(tls);
        self
    }

    pub fn build(self) -> StaticManager {
        self.manager
    }
}

/// Manager whose backend list is replaced at runtime, e.g. from servers a
/// broker client discovered.
#[derive(Debug)]
pub struct DynamicManager {
    backends: RwLock<Vec<String>>,
    randomize: bool,
    debug: bool,
    tls: Option<TlsConnector>,
}

impl DynamicManager {
    pub fn new(backends: Vec<String>, randomize: bool, debug: bool) -> Self {
        Self {
            backends: RwLock::new(backends),
            randomize,
            debug,
            tls: None,
        }
    }

    /// Set the TLS configuration for `wss` backends
    pub fn with_tls_config(mut self, tls: TlsConnector) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Replace the backend list; the next relay request sees it.
    pub fn set_backends(&self, backends: Vec<String>) {
        debug!("[RELAY] Backends are now {:?}", backends);
        *self.backends.write() = backends;
    }

    /// Replace the backend list with the connected server followed by the
    /// other servers it advertised, skipping duplicates.
    pub fn update_from_discovery(&self, connected: Option<&str>, discovered: &[String]) {
        let mut backends: Vec<String> = Vec::with_capacity(discovered.len() + 1);
        for url in connected.into_iter().map(str::to_string).chain(discovered.iter().cloned()) {
            if !backends.contains(&url) {
                backends.push(url);
            }
        }
        self.set_backends(backends);
    }

    /// Connect a monitoring client to the cluster through `dialer` and keep
    /// the backend list in step with the websocket endpoints its servers
    /// advertise. The dialed endpoint stays first in the list.
    ///
    /// The manager is updated for as long as the returned client lives.
    pub async fn monitor<D: Dialer>(
        self: &Arc<Self>,
        dialer: D,
        mut options: BrokerOptions,
    ) -> Result<BrokerClient, Error> {
        let connected = dialer.endpoint();
        let manager = Arc::downgrade(self);
        options.set_on_discovered_servers(move |servers| {
            if let Some(manager) = manager.upgrade() {
                manager.update_from_discovery(Some(&connected), servers);
            }
        });
        BrokerClient::connect(dialer, options).await
    }
}

impl Manager for DynamicManager {
    fn backends(&self) -> Vec<String> {
        self.backends.read().clone()
    }

    fn tls_config(&self) -> Option<TlsConnector> {
        self.tls.clone()
    }

    fn randomize(&self) -> bool {
        self.randomize
    }

    fn is_debug(&self) -> bool {
        self.debug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::DuplexDialer;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_static_manager_defaults() {
        let manager = StaticManager::new(true, vec!["ws://a:1".into()]);
        assert!(manager.randomize());
        assert!(manager.is_debug());
        assert!(manager.tls_config().is_none());
        assert_eq!(manager.backends(), vec!["ws://a:1".to_string()]);
    }

    #[test]
    fn test_static_manager_builder() {
        let manager = StaticManager::builder()
            .backends(vec!["ws://a:1".into(), "wss://b:2".into()])
            .randomize(false)
            .build();
        assert!(!manager.randomize());
        assert!(!manager.is_debug());
        assert_eq!(manager.backends().len(), 2);
    }

    #[test]
    fn test_dynamic_manager_reads_fresh_list() {
        let manager = DynamicManager::new(vec!["ws://a:1".into()], false, false);
        assert_eq!(manager.backends(), vec!["ws://a:1".to_string()]);

        manager.set_backends(vec!["ws://b:1".into(), "ws://c:1".into()]);
        assert_eq!(
            manager.backends(),
            vec!["ws://b:1".to_string(), "ws://c:1".to_string()]
        );
    }

    #[test]
    fn test_update_from_discovery_puts_connected_first() {
        let manager = DynamicManager::new(Vec::new(), false, false);
        manager.update_from_discovery(
            Some("ws://a:1"),
            &["ws://b:1".to_string(), "ws://a:1".to_string()],
        );
        assert_eq!(
            manager.backends(),
            vec!["ws://a:1".to_string(), "ws://b:1".to_string()]
        );

        manager.update_from_discovery(None, &["ws://c:1".to_string()]);
        assert_eq!(manager.backends(), vec!["ws://c:1".to_string()]);
    }

    #[tokio::test]
    async fn test_monitor_feeds_discovered_servers() {
        let manager = Arc::new(DynamicManager::new(Vec::new(), false, false));
        let (dialer, mut servers) = DuplexDialer::new();

        let monitoring = tokio::spawn({
            let manager = manager.clone();
            async move { manager.monitor(dialer, BrokerOptions::default()).await }
        });
        let mut server = timeout(Duration::from_secs(5), servers.recv())
            .await
            .unwrap()
            .unwrap();
        server.handshake().await;
        let client = monitoring.await.unwrap().unwrap();

        assert_eq!(
            manager.backends(),
            vec!["duplex".to_string(), "ws://10.0.0.2:4223".to_string()]
        );
        client.close().await;
    }
}
