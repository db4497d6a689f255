use crate::error::Error;
use crate::manager::Manager;
use crate::transport::connect_direct;
use native_tls::TlsConnector;
use rand::seq::SliceRandom;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace};
use url::Url;

/// A parsed backend endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// The endpoint exactly as the manager supplied it
    pub url: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Backend {
    /// Parse a `ws://host:port` or `wss://host:port` endpoint
    pub fn parse(url: &str) -> Result<Self, Error> {
        let invalid = |reason: &str| Error::InvalidBackend {
            backend: url.to_string(),
            reason: reason.to_string(),
        };

        let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
        let tls = match parsed.scheme() {
            "ws" => false,
            "wss" => true,
            _ => return Err(invalid("scheme must be ws or wss")),
        };
        let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = parsed.port().unwrap_or(if tls { 443 } else { 80 });

        Ok(Self {
            url: url.to_string(),
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            tls,
        })
    }
}

/// Order backends for probing: a uniformly random permutation when
/// `randomize` is set, the declared order otherwise.
pub fn candidate_order(mut backends: Vec<String>, randomize: bool) -> Vec<String> {
    if randomize {
        backends.shuffle(&mut rand::thread_rng());
    }
    backends
}

/// Liveness probe: a TCP connect for `ws`, a TLS handshake for `wss`.
/// The probe connection is closed as soon as it succeeds.
pub async fn probe(backend: &Backend, tls: Option<&TlsConnector>, probe_timeout: Duration) -> Result<(), Error> {
    let attempt = async {
        let tcp = connect_direct(&backend.host, backend.port).await?;
        if backend.tls {
            let connector = match tls {
                Some(tls) => tls.clone(),
                None => TlsConnector::new()?,
            };
            let stream = tokio_native_tls::TlsConnector::from(connector)
                .connect(&backend.host, tcp)
                .await?;
            drop(stream);
        } else {
            drop(tcp);
        }
        Ok::<(), Error>(())
    };

    match timeout(probe_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(Error::connection_failed(&backend.url, "probe timeout")),
    }
}

/// Pick the first backend that passes a liveness probe.
///
/// The manager's list is read fresh on every call. Probing stops at the
/// first success; entries that fail to parse are skipped.
pub async fn select_backend<M: Manager + ?Sized>(manager: &M, probe_timeout: Duration) -> Option<String> {
    let candidates = candidate_order(manager.backends(), manager.randomize());
    let tls = manager.tls_config();

    for candidate in candidates {
        let backend = match Backend::parse(&candidate) {
            Ok(backend) => backend,
            Err(e) => {
                debug!("[RELAY] Skipping backend: {}", e);
                continue;
            }
        };

        match probe(&backend, tls.as_ref(), probe_timeout).await {
            Ok(()) => {
                trace!("[RELAY] Backend {} is live", backend.url);
                return Some(backend.url);
            }
            Err(e) => {
                debug!("[RELAY] Backend {} failed probe: {}", backend.url, e);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::StaticManager;
    use tokio::net::TcpListener;

    async fn unreachable_addr() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[test]
    fn test_parse_backend() {
        let backend = Backend::parse("ws://10.0.0.1:4223").unwrap();
        assert_eq!(backend.host, "10.0.0.1");
        assert_eq!(backend.port, 4223);
        assert!(!backend.tls);

        let backend = Backend::parse("wss://nats.example.com").unwrap();
        assert_eq!(backend.port, 443);
        assert!(backend.tls);
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(matches!(
            Backend::parse("http://a:1"),
            Err(Error::InvalidBackend { .. })
        ));
        assert!(Backend::parse("nats://a:4222").is_err());
        assert!(Backend::parse("not a url").is_err());
    }

    #[test]
    fn test_declared_order_preserved_without_randomize() {
        let backends: Vec<String> = (0..10).map(|i| format!("ws://h{}:1", i)).collect();
        assert_eq!(candidate_order(backends.clone(), false), backends);
    }

    #[test]
    fn test_randomize_yields_permutation() {
        let backends: Vec<String> = (0..10).map(|i| format!("ws://h{}:1", i)).collect();

        let mut saw_reorder = false;
        for _ in 0..20 {
            let shuffled = candidate_order(backends.clone(), true);
            let mut sorted = shuffled.clone();
            sorted.sort();
            let mut expected = backends.clone();
            expected.sort();
            assert_eq!(sorted, expected);
            if shuffled != backends {
                saw_reorder = true;
            }
        }
        // 20 identity permutations of 10 items is practically impossible
        assert!(saw_reorder);
    }

    #[tokio::test]
    async fn test_selects_first_reachable() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();
        let dead_addr = unreachable_addr().await;

        let manager = StaticManager::builder()
            .backends(vec![
                format!("ws://{}", dead_addr),
                format!("ws://{}", live_addr),
            ])
            .randomize(false)
            .build();

        let selected = select_backend(&manager, Duration::from_secs(2)).await;
        assert_eq!(selected, Some(format!("ws://{}", live_addr)));
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let manager = StaticManager::builder()
            .backends(vec![
                format!("ws://{}", first.local_addr().unwrap()),
                format!("ws://{}", second.local_addr().unwrap()),
            ])
            .randomize(false)
            .build();

        let selected = select_backend(&manager, Duration::from_secs(2)).await;
        assert_eq!(selected, Some(format!("ws://{}", first.local_addr().unwrap())));
    }

    #[tokio::test]
    async fn test_none_when_all_unreachable() {
        let manager = StaticManager::builder()
            .backends(vec![
                format!("ws://{}", unreachable_addr().await),
                format!("ws://{}", unreachable_addr().await),
                "bogus".to_string(),
            ])
            .build();

        assert_eq!(select_backend(&manager, Duration::from_secs(2)).await, None);
    }

    #[tokio::test]
    async fn test_empty_backend_list() {
        let manager = StaticManager::new(false, Vec::new());
        assert_eq!(select_backend(&manager, Duration::from_secs(1)).await, None);
    }
}
