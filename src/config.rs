use std::time::Duration;
use url::Url;

/// Environment variable holding a literal endpoint that replaces the
/// origin-derived relay URL (local development without a relay).
pub const OVERRIDE_ENDPOINT_ENV: &str = "NATSWS_DIALER";

/// Configuration for the relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Timeout for each backend liveness probe
    pub probe_timeout: Duration,
    /// Timeout for dialing the chosen backend's WebSocket
    pub dial_timeout: Duration,
    /// Time a client gets to send its request head, and again to complete
    /// the upgrade once a backend is chosen
    pub handshake_timeout: Duration,
    /// Upgrade path prefix; the client id follows it
    pub path_prefix: String,
    /// User-agent fragments of browsers that mishandle per-message compression
    pub compression_incompatible_agents: Vec<String>,
    /// Payload that cancels the session when the manager is in debug mode
    pub debug_disconnect_payload: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            path_prefix: "/natsws/".to_string(),
            // https://github.com/gorilla/websocket/issues/731
            compression_incompatible_agents: vec!["Safari".to_string()],
            debug_disconnect_payload: "PUB demo.disconnect 0\r\n\r\n".to_string(),
        }
    }
}

impl RelayConfig {
    /// Create a new builder for configuration
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Whether compression must be disabled for this user agent
    pub fn compression_disabled_for(&self, user_agent: &str) -> bool {
        self.compression_incompatible_agents
            .iter()
            .any(|agent| user_agent.contains(agent.as_str()))
    }
}

/// Builder for RelayConfig
#[derive(Debug, Clone, Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    /// Set the liveness probe timeout
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    /// Set the backend dial timeout
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    /// Set the client handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the upgrade path prefix
    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.path_prefix = prefix.into();
        self
    }

    /// Set the user agents that get compression disabled
    pub fn compression_incompatible_agents(mut self, agents: Vec<String>) -> Self {
        self.config.compression_incompatible_agents = agents;
        self
    }

    /// Set the debug disconnect payload
    pub fn debug_disconnect_payload(mut self, payload: impl Into<String>) -> Self {
        self.config.debug_disconnect_payload = payload.into();
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<RelayConfig, ConfigError> {
        if self.config.probe_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "probe_timeout must be > 0".to_string(),
            ));
        }

        if self.config.dial_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "dial_timeout must be > 0".to_string(),
            ));
        }

        if self.config.handshake_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "handshake_timeout must be > 0".to_string(),
            ));
        }

        if !self.config.path_prefix.starts_with('/') || !self.config.path_prefix.ends_with('/') {
            return Err(ConfigError::InvalidPath(format!(
                "path_prefix must start and end with '/': {}",
                self.config.path_prefix
            )));
        }

        Ok(self.config)
    }
}

/// Configuration for a client connection
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Page origin the relay URL is derived from
    pub origin: Option<Url>,
    /// Literal endpoint used unmodified instead of the origin-derived URL
    pub override_endpoint: Option<String>,
    /// Path under which the relay accepts upgrades
    pub path_prefix: String,
    /// Key the connection state is published under
    pub state_key: String,
    /// Client-local storage key of the persisted identity
    pub identity_key: String,
    /// Subject of keepalive pings
    pub keepalive_subject: String,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// Delay before reconnecting after `reconnect()`
    pub reconnect_delay: Duration,
    /// Timeout for dial plus broker handshake
    pub connect_timeout: Duration,
    /// Backoff used by the broker client between reconnection attempts
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let state_key = "natsws.Connection".to_string();
        Self {
            origin: None,
            override_endpoint: None,
            path_prefix: "/natsws".to_string(),
            identity_key: format!("{state_key}.clientName"),
            keepalive_subject: format!("{state_key}.ping"),
            state_key,
            keepalive_interval: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new builder for configuration
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Default configuration with the override endpoint taken from
    /// [`OVERRIDE_ENDPOINT_ENV`] when it is set and non-empty.
    pub fn from_env() -> Self {
        let override_endpoint = std::env::var(OVERRIDE_ENDPOINT_ENV)
            .ok()
            .filter(|v| !v.is_empty());
        Self {
            override_endpoint,
            ..Self::default()
        }
    }

    /// WebSocket URL the client dials for the given identity.
    ///
    /// The override endpoint wins unmodified. Otherwise the origin's scheme
    /// is mapped (`http`→`ws`, `https`→`wss`) and the path becomes
    /// `<path_prefix>/<identity>`.
    pub fn endpoint_url(&self, identity: &str) -> Result<String, ConfigError> {
        if let Some(endpoint) = &self.override_endpoint {
            return Ok(endpoint.clone());
        }

        let origin = self
            .origin
            .as_ref()
            .ok_or_else(|| ConfigError::InvalidEndpoint("no origin or override endpoint".to_string()))?;

        let scheme = match origin.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConfigError::InvalidEndpoint(format!(
                    "unsupported origin scheme: {}",
                    other
                )))
            }
        };
        let host = origin
            .host_str()
            .ok_or_else(|| ConfigError::InvalidEndpoint("origin has no host".to_string()))?;
        let authority = match origin.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(format!(
            "{}://{}{}/{}",
            scheme,
            authority,
            self.path_prefix.trim_end_matches('/'),
            identity
        ))
    }
}

/// Builder for ClientConfig
#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the page origin
    pub fn origin(mut self, origin: Url) -> Self {
        self.config.origin = Some(origin);
        self
    }

    /// Set a literal endpoint that bypasses the origin-derived URL
    pub fn override_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.override_endpoint = Some(endpoint.into());
        self
    }

    /// Set the relay path prefix
    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.path_prefix = prefix.into();
        self
    }

    /// Set the state key; identity and keepalive keys are derived from it
    pub fn state_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.config.identity_key = format!("{key}.clientName");
        self.config.keepalive_subject = format!("{key}.ping");
        self.config.state_key = key;
        self
    }

    /// Set the keepalive interval
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Set the delay before reconnecting
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        self.config.backoff.validate()?;

        if self.config.keepalive_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "keepalive_interval must be > 0".to_string(),
            ));
        }

        if self.config.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "connect_timeout must be > 0".to_string(),
            ));
        }

        if self.config.override_endpoint.is_none() && self.config.origin.is_none() {
            return Err(ConfigError::InvalidEndpoint(
                "either origin or override_endpoint is required".to_string(),
            ));
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid timeout or interval
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Invalid path
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    /// Endpoint cannot be derived
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true, // Full jitter
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay < self.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if self.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
