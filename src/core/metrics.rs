use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Per-service counters for accepted connections, handshakes and relayed
/// bytes.
pub trait ServiceMetrics: Send + Sync {
    /// A client connection was accepted
    fn record_connection_accepted(&self);

    /// Credentials could not be resolved; no backend was dialed
    fn record_resolve_failure(&self);

    /// The connector authenticated the backend
    async fn record_handshake_success(&self, latency: Duration);

    /// The connector failed
    fn record_handshake_failure(&self);

    /// A session finished streaming
    fn record_session_closed(&self, client_to_backend: u64, backend_to_client: u64);

    async fn get_snapshot(&self) -> MetricsSnapshot;

    /// Reset all metrics (useful for testing)
    async fn reset(&self);

    fn service_name(&self) -> &str;
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub service_name: String,
    pub connections_accepted: u64,
    pub resolve_failures: u64,
    pub handshake_successes: u64,
    pub handshake_failures: u64,
    pub active_sessions: u64,
    pub bytes_client_to_backend: u64,
    pub bytes_backend_to_client: u64,
    pub average_handshake_ms: f64,
    pub p95_handshake_ms: f64,
    pub p99_handshake_ms: f64,
    pub success_rate: f64,
    pub last_handshake_time: Option<Instant>,
}

#[derive(Debug)]
pub struct AtomicServiceMetrics {
    service_name: String,

    connections_accepted: AtomicU64,
    resolve_failures: AtomicU64,
    handshake_successes: AtomicU64,
    handshake_failures: AtomicU64,
    active_sessions: AtomicU64,

    bytes_client_to_backend: AtomicU64,
    bytes_backend_to_client: AtomicU64,

    latency_tracker: RwLock<LatencyTracker>,
    last_handshake_time: RwLock<Option<Instant>>,
}

impl AtomicServiceMetrics {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            connections_accepted: AtomicU64::new(0),
            resolve_failures: AtomicU64::new(0),
            handshake_successes: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            bytes_client_to_backend: AtomicU64::new(0),
            bytes_backend_to_client: AtomicU64::new(0),
            latency_tracker: RwLock::new(LatencyTracker::new()),
            last_handshake_time: RwLock::new(None),
        }
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }
}

impl ServiceMetrics for AtomicServiceMetrics {
    fn record_connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_resolve_failure(&self) {
        self.resolve_failures.fetch_add(1, Ordering::Relaxed);
    }

    async fn record_handshake_success(&self, latency: Duration) {
        self.handshake_successes.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);

        *self.last_handshake_time.write().await = Some(Instant::now());
        self.latency_tracker.write().await.record_latency(latency);
    }

    fn record_handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_session_closed(&self, client_to_backend: u64, backend_to_client: u64) {
        self.bytes_client_to_backend
            .fetch_add(client_to_backend, Ordering::Relaxed);
        self.bytes_backend_to_client
            .fetch_add(backend_to_client, Ordering::Relaxed);
        // Saturating: a reset while sessions are live must not wrap.
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    async fn get_snapshot(&self) -> MetricsSnapshot {
        let successes = self.handshake_successes.load(Ordering::Relaxed);
        let failures = self.handshake_failures.load(Ordering::Relaxed);
        let total = successes + failures;

        let success_rate = if total > 0 {
            (successes as f64) / (total as f64) * 100.0
        } else {
            0.0
        };

        let (avg_latency, p95_latency, p99_latency) = {
            let tracker = self.latency_tracker.read().await;
            (
                tracker.average_latency_ms(),
                tracker.percentile_latency_ms(95.0),
                tracker.percentile_latency_ms(99.0),
            )
        };

        MetricsSnapshot {
            service_name: self.service_name.clone(),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            resolve_failures: self.resolve_failures.load(Ordering::Relaxed),
            handshake_successes: successes,
            handshake_failures: failures,
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            bytes_client_to_backend: self.bytes_client_to_backend.load(Ordering::Relaxed),
            bytes_backend_to_client: self.bytes_backend_to_client.load(Ordering::Relaxed),
            average_handshake_ms: avg_latency,
            p95_handshake_ms: p95_latency,
            p99_handshake_ms: p99_latency,
            success_rate,
            last_handshake_time: *self.last_handshake_time.read().await,
        }
    }

    async fn reset(&self) {
        self.connections_accepted.store(0, Ordering::Relaxed);
        self.resolve_failures.store(0, Ordering::Relaxed);
        self.handshake_successes.store(0, Ordering::Relaxed);
        self.handshake_failures.store(0, Ordering::Relaxed);
        self.active_sessions.store(0, Ordering::Relaxed);
        self.bytes_client_to_backend.store(0, Ordering::Relaxed);
        self.bytes_backend_to_client.store(0, Ordering::Relaxed);

        self.latency_tracker.write().await.reset();
        *self.last_handshake_time.write().await = None;
    }

    fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// Handshake latencies over a sliding window, for percentiles
#[derive(Debug)]
struct LatencyTracker {
    latencies: Vec<Duration>,
    max_samples: usize,
    next_index: usize,
}

impl LatencyTracker {
    fn new() -> Self {
        Self {
            latencies: Vec::with_capacity(1000),
            max_samples: 1000,
            next_index: 0,
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() < self.max_samples {
            self.latencies.push(latency);
        } else {
            self.latencies[self.next_index] = latency;
            self.next_index = (self.next_index + 1) % self.max_samples;
        }
    }

    fn average_latency_ms(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }

        let total_ms: f64 = self
            .latencies
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .sum();

        total_ms / self.latencies.len() as f64
    }

    fn percentile_latency_ms(&self, percentile: f64) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }

        let mut sorted_latencies = self.latencies.clone();
        sorted_latencies.sort();

        let index = ((percentile / 100.0) * sorted_latencies.len() as f64) as usize;
        let index = index.min(sorted_latencies.len() - 1);

        sorted_latencies[index].as_secs_f64() * 1000.0
    }

    fn reset(&mut self) {
        self.latencies.clear();
        self.next_index = 0;
    }
}
