use crate::relay::Direction;
use std::sync::atomic::{AtomicU64, Ordering};

/// Relay metrics for observability
///
/// Counters are updated lock-free from every session. Use `snapshot()` to
/// get a point-in-time view of all metrics, or the individual getters.
///
/// # Example
/// ```ignore
/// let metrics = relay.metrics();
///
/// println!("Active sessions: {}", metrics.sessions_active());
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct RelayMetrics {
    sessions_total: AtomicU64,
    sessions_active: AtomicU64,
    backend_unavailable_total: AtomicU64,
    backend_dial_failures_total: AtomicU64,
    upgrade_failures_total: AtomicU64,
    frames_client_to_backend_total: AtomicU64,
    frames_backend_to_client_total: AtomicU64,
    bytes_relayed_total: AtomicU64,
    errors_reported_total: AtomicU64,
}

/// Point-in-time snapshot of all relay metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_total: u64,
    pub sessions_active: u64,
    pub backend_unavailable_total: u64,
    pub backend_dial_failures_total: u64,
    pub upgrade_failures_total: u64,
    pub frames_client_to_backend_total: u64,
    pub frames_backend_to_client_total: u64,
    pub bytes_relayed_total: u64,
    pub errors_reported_total: u64,
}

impl RelayMetrics {
    /// Create a new RelayMetrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total sessions established
    pub fn sessions_total(&self) -> u64 {
        self.sessions_total.load(Ordering::Relaxed)
    }

    /// Get sessions currently relaying
    pub fn sessions_active(&self) -> u64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    /// Get requests answered with "service unavailable" because no backend passed a probe
    pub fn backend_unavailable(&self) -> u64 {
        self.backend_unavailable_total.load(Ordering::Relaxed)
    }

    /// Get failed WebSocket dials to a probed backend
    pub fn backend_dial_failures(&self) -> u64 {
        self.backend_dial_failures_total.load(Ordering::Relaxed)
    }

    /// Get failed inbound upgrades
    pub fn upgrade_failures(&self) -> u64 {
        self.upgrade_failures_total.load(Ordering::Relaxed)
    }

    /// Get frames relayed in one direction
    pub fn frames(&self, direction: Direction) -> u64 {
        match direction {
            Direction::ClientToBackend => self.frames_client_to_backend_total.load(Ordering::Relaxed),
            Direction::BackendToClient => self.frames_backend_to_client_total.load(Ordering::Relaxed),
        }
    }

    /// Get total payload bytes relayed in both directions
    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed_total.load(Ordering::Relaxed)
    }

    /// Get errors forwarded to the manager
    pub fn errors_reported(&self) -> u64 {
        self.errors_reported_total.load(Ordering::Relaxed)
    }

    /// Get a full snapshot for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_total: self.sessions_total(),
            sessions_active: self.sessions_active(),
            backend_unavailable_total: self.backend_unavailable(),
            backend_dial_failures_total: self.backend_dial_failures(),
            upgrade_failures_total: self.upgrade_failures(),
            frames_client_to_backend_total: self.frames(Direction::ClientToBackend),
            frames_backend_to_client_total: self.frames(Direction::BackendToClient),
            bytes_relayed_total: self.bytes_relayed(),
            errors_reported_total: self.errors_reported(),
        }
    }

    // ========== Recorders ==========

    pub(crate) fn record_session_start(&self) {
        self.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_session_end(&self) {
        // Saturating so a stray double end can never wrap the gauge
        let _ = self
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub(crate) fn record_backend_unavailable(&self) {
        self.backend_unavailable_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backend_dial_failure(&self) {
        self.backend_dial_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upgrade_failure(&self) {
        self.upgrade_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame(&self, direction: Direction, bytes: usize) {
        match direction {
            Direction::ClientToBackend => self.frames_client_to_backend_total.fetch_add(1, Ordering::Relaxed),
            Direction::BackendToClient => self.frames_backend_to_client_total.fetch_add(1, Ordering::Relaxed),
        };
        self.bytes_relayed_total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_error_reported(&self) {
        self.errors_reported_total.fetch_add(1, Ordering::Relaxed);
    }
}
