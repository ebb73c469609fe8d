use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;

/// In-process HTTP request counters.
///
/// Cheap to clone (shared atomics); the middleware records one observation
/// per finished request and the daemon logs a snapshot periodically.
#[derive(Clone, Default)]
pub struct ApiMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    requests_total: AtomicU64,
    responses_2xx: AtomicU64,
    responses_4xx: AtomicU64,
    responses_5xx: AtomicU64,
    by_path: Mutex<AHashMap<String, u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub responses_2xx: u64,
    pub responses_4xx: u64,
    pub responses_5xx: u64,
}

impl ApiMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished request.
    pub fn observe(&self, path: &str, status: u16) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        match status {
            200..=299 => self.inner.responses_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.inner.responses_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => self.inner.responses_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        let mut by_path = self.inner.by_path.lock().expect("metrics lock poisoned");
        *by_path.entry(path.to_string()).or_default() += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            responses_2xx: self.inner.responses_2xx.load(Ordering::Relaxed),
            responses_4xx: self.inner.responses_4xx.load(Ordering::Relaxed),
            responses_5xx: self.inner.responses_5xx.load(Ordering::Relaxed),
        }
    }

    /// Requests observed for a single path (tests and debug logging).
    pub fn path_count(&self, path: &str) -> u64 {
        self.inner
            .by_path
            .lock()
            .expect("metrics lock poisoned")
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_buckets_by_status_class() {
        let metrics = ApiMetrics::new();
        metrics.observe("/api/v1/experiments", 200);
        metrics.observe("/api/v1/experiments", 201);
        metrics.observe("/api/v1/experiments", 404);
        metrics.observe("/api/v1/agents", 500);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 4);
        assert_eq!(snapshot.responses_2xx, 2);
        assert_eq!(snapshot.responses_4xx, 1);
        assert_eq!(snapshot.responses_5xx, 1);
        assert_eq!(metrics.path_count("/api/v1/experiments"), 3);
    }

    #[test]
    fn clones_share_counters() {
        let metrics = ApiMetrics::new();
        let clone = metrics.clone();
        metrics.observe("/x", 200);
        assert_eq!(clone.snapshot().requests_total, 1);
    }
}
