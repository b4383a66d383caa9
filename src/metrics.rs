//! Load metrics: sliding-window latency, error, and request-rate signals
//!
//! A [`LoadMetrics`] instance is shared (`Arc`) between a pool, which feeds it
//! per-request observations, and the auto-scaling manager, which reads
//! normalized component scores out of it. All history buffers are bounded
//! rings so the memory footprint is fixed regardless of uptime.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Maximum latency samples retained
const LATENCY_HISTORY_CAP: usize = 1000;

/// Minimum samples before percentiles are reported
const PERCENTILE_MIN_SAMPLES: usize = 10;

/// Window for the request-rate estimate
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Effective sample count for the exponentially-weighted error proportion
const ERROR_EW_WINDOW: u64 = 100;

/// Bounded ring of request latencies with nearest-rank percentiles.
#[derive(Debug, Default)]
pub struct LatencyHistory {
    samples: VecDeque<Duration>,
}

impl LatencyHistory {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(LATENCY_HISTORY_CAP),
        }
    }

    pub fn record(&mut self, latency: Duration) {
        if self.samples.len() >= LATENCY_HISTORY_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean latency over the window, or zero when empty
    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    /// Nearest-rank 95th percentile: `sorted[floor(0.95 * n)]`.
    ///
    /// Returns `None` until the window holds at least ten samples.
    pub fn p95(&self) -> Option<Duration> {
        self.nearest_rank(0.95, false)
    }

    /// Nearest-rank 99th percentile: `sorted[max(floor(0.99 * n), n - 1)]`.
    pub fn p99(&self) -> Option<Duration> {
        self.nearest_rank(0.99, true)
    }

    fn nearest_rank(&self, quantile: f64, clamp_to_last: bool) -> Option<Duration> {
        let n = self.samples.len();
        if n < PERCENTILE_MIN_SAMPLES {
            return None;
        }
        let mut sorted: Vec<Duration> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let mut idx = (quantile * n as f64).floor() as usize;
        if clamp_to_last {
            idx = idx.max(n - 1);
        }
        idx = idx.min(n - 1);
        Some(sorted[idx])
    }
}

#[derive(Debug)]
struct MetricsInner {
    latency: LatencyHistory,
    request_times: VecDeque<Instant>,
    total_requests: u64,
    error_rate: f64,
    waiting: u64,
    utilization: f64,
}

/// Shared sliding-window signal store feeding the load score.
#[derive(Debug)]
pub struct LoadMetrics {
    inner: Mutex<MetricsInner>,
}

impl Default for LoadMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadMetrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner {
                latency: LatencyHistory::new(),
                request_times: VecDeque::new(),
                total_requests: 0,
                error_rate: 0.0,
                waiting: 0,
                utilization: 0.0,
            }),
        }
    }

    /// Record a completed request.
    ///
    /// The error rate is an exponentially-weighted running proportion over
    /// total requests: early on every request counts fully, converging to a
    /// fixed-weight window once enough traffic has been seen.
    pub fn record_request(&self, latency: Duration, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_requests += 1;
        inner.latency.record(latency);

        let now = Instant::now();
        inner.request_times.push_back(now);
        while let Some(front) = inner.request_times.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                inner.request_times.pop_front();
            } else {
                break;
            }
        }

        let alpha = 1.0 / inner.total_requests.min(ERROR_EW_WINDOW) as f64;
        let observed = if success { 0.0 } else { 1.0 };
        inner.error_rate += alpha * (observed - inner.error_rate);
    }

    /// Update the wait-queue depth gauge
    pub fn set_waiting(&self, waiting: u64) {
        self.inner.lock().unwrap().waiting = waiting;
    }

    /// Update the pool utilization gauge (active / max, in [0, 1])
    pub fn set_utilization(&self, utilization: f64) {
        self.inner.lock().unwrap().utilization = utilization.clamp(0.0, 1.0);
    }

    /// Take an immutable snapshot of the current signals
    pub fn snapshot(&self) -> LoadSnapshot {
        let inner = self.inner.lock().unwrap();
        LoadSnapshot {
            avg_latency_ms: inner.latency.average().as_secs_f64() * 1000.0,
            p95_latency_ms: inner
                .latency
                .p95()
                .map(|d| d.as_secs_f64() * 1000.0),
            p99_latency_ms: inner
                .latency
                .p99()
                .map(|d| d.as_secs_f64() * 1000.0),
            error_rate: inner.error_rate,
            requests_per_sec: inner.request_times.len() as f64 / RATE_WINDOW.as_secs_f64(),
            total_requests: inner.total_requests,
            waiting: inner.waiting,
            utilization: inner.utilization,
        }
    }
}

/// Point-in-time view of the load signals, JSON-serializable.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSnapshot {
    pub avg_latency_ms: f64,
    pub p95_latency_ms: Option<f64>,
    pub p99_latency_ms: Option<f64>,
    pub error_rate: f64,
    pub requests_per_sec: f64,
    pub total_requests: u64,
    pub waiting: u64,
    pub utilization: f64,
}

impl LoadSnapshot {
    /// Latency normalized against a 5-second ceiling
    pub fn latency_score(&self) -> f64 {
        (self.avg_latency_ms / 5000.0).clamp(0.0, 1.0)
    }

    /// Utilization is already in [0, 1]
    pub fn utilization_score(&self) -> f64 {
        self.utilization.clamp(0.0, 1.0)
    }

    /// Error rate scaled so 20% errors saturates the score
    pub fn error_score(&self) -> f64 {
        (self.error_rate * 5.0).clamp(0.0, 1.0)
    }

    /// Queue depth normalized against a 50-waiter ceiling
    pub fn queue_score(&self) -> f64 {
        (self.waiting as f64 / 50.0).clamp(0.0, 1.0)
    }

    /// Combined scalar load score in [0, 1]
    pub fn load_score(&self) -> f64 {
        0.3 * self.latency_score()
            + 0.3 * self.utilization_score()
            + 0.2 * self.error_score()
            + 0.2 * self.queue_score()
    }
}
