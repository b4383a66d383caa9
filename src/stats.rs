//! Pool statistics: immutable snapshots with atomic replace
//!
//! Counters are accumulated under a mutex and published as an immutable
//! [`PoolStats`] snapshot behind an `Arc`. Writers build a fresh snapshot and
//! swap the pointer; readers clone the `Arc` and never observe a torn or
//! partially-updated view. Derived values (average wait time from the ring
//! buffer, peak connections) are computed at swap time, which is why the
//! mutators go through a mutex rather than independent atomics.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Maximum wait-time samples retained for the rolling average
const WAIT_SAMPLE_CAP: usize = 256;

/// Immutable snapshot of pool counters and gauges.
///
/// Invariant: `active + idle <= total`; all counters are non-negative and
/// monotonic within a pool's lifetime (gauges excepted).
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Connections currently checked out
    pub active: u64,
    /// Connections sitting in the idle queue
    pub idle: u64,
    /// Total live connections (active + idle)
    pub total: u64,
    /// Callers currently blocked in the wait queue
    pub waiting: u64,
    /// Connection creation/backend errors observed
    pub errors: u64,
    /// Connections created over the pool lifetime
    pub creations: u64,
    /// Connections closed or retired over the pool lifetime
    pub closures: u64,
    /// Acquires served from an idle connection
    pub hits: u64,
    /// Acquires that had to create a new connection
    pub misses: u64,
    /// Acquires that failed because the wait queue timed out
    pub exhaustions: u64,
    /// Total acquire calls attempted
    pub acquisition_attempts: u64,
    /// Rolling average time spent waiting to acquire, in milliseconds
    pub avg_wait_ms: f64,
    /// Highest `total` ever observed
    pub peak_connections: u64,
}

impl PoolStats {
    /// Pool utilization in [0, 1] against a capacity
    pub fn utilization(&self, max_size: usize) -> f64 {
        if max_size == 0 {
            0.0
        } else {
            (self.active as f64 / max_size as f64).clamp(0.0, 1.0)
        }
    }
}

/// Mutable accumulator behind the published snapshot
#[derive(Debug)]
struct StatsInner {
    stats: PoolStats,
    wait_samples: VecDeque<Duration>,
    snapshot: Arc<PoolStats>,
}

/// Copy-on-write stats holder shared between a pool and its observers.
///
/// Mutation happens under the lock; `load()` only copies the `Arc` pointer.
#[derive(Debug)]
pub struct StatsCell {
    inner: Mutex<StatsInner>,
}

impl Default for StatsCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                stats: PoolStats::default(),
                wait_samples: VecDeque::with_capacity(WAIT_SAMPLE_CAP),
                snapshot: Arc::new(PoolStats::default()),
            }),
        }
    }

    /// Latest published snapshot
    pub fn load(&self) -> Arc<PoolStats> {
        self.inner.lock().unwrap().snapshot.clone()
    }

    /// Apply a mutation and publish a fresh snapshot
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PoolStats),
    {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.stats);
        inner.stats.peak_connections = inner.stats.peak_connections.max(inner.stats.total);
        inner.snapshot = Arc::new(inner.stats.clone());
    }

    /// Record an acquire wait and refresh the rolling average
    pub fn record_wait(&self, waited: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if inner.wait_samples.len() >= WAIT_SAMPLE_CAP {
            inner.wait_samples.pop_front();
        }
        inner.wait_samples.push_back(waited);

        let sum_ms: f64 = inner
            .wait_samples
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .sum();
        inner.stats.avg_wait_ms = sum_ms / inner.wait_samples.len() as f64;
        inner.snapshot = Arc::new(inner.stats.clone());
    }
}
