//! Lifecycle-aware connection pool with circuit-breaker-guarded acquire
//!
//! On top of the base acquire/release contract, this pool tracks a
//! [`ConnectionRecord`] per connection (age, use count, latency, health
//! failures) and retires records that fail the lifecycle predicate. Waiters
//! at capacity are served strictly FIFO: a released record is handed directly
//! to the oldest waiter through a oneshot channel, so there is no
//! thundering-herd wakeup and no barging by late arrivals.
//!
//! Inner state lives behind a `std::sync::Mutex` — every critical section is
//! short and never awaits, which lets the RAII guard return its record
//! synchronously from `Drop`.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, Permit};
use crate::error::PoolError;
use crate::metrics::LoadMetrics;
use crate::pool::{ConnectionFactory, PoolConfig};
use crate::stats::{PoolStats, StatsCell};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Configuration for a [`SmartConnectionPool`]
#[derive(Debug, Clone)]
pub struct SmartPoolConfig {
    /// Base sizing and timeout knobs
    pub base: PoolConfig,
    /// Retire a connection after this many uses
    pub max_uses: Option<u64>,
    /// Retire a connection after this many consecutive failed health probes
    pub max_health_failures: u32,
    /// Breaker guarding this pool's connection class
    pub breaker: CircuitBreakerConfig,
}

impl Default for SmartPoolConfig {
    fn default() -> Self {
        Self {
            base: PoolConfig::default(),
            max_uses: Some(10_000),
            max_health_failures: 3,
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Per-connection lifecycle bookkeeping. Owned exclusively by the pool;
/// callers only ever see the opaque handle through the guard.
#[derive(Debug)]
pub struct ConnectionRecord<T> {
    pub(crate) id: u64,
    pub(crate) conn: T,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) use_count: u64,
    pub(crate) total_latency: Duration,
    pub(crate) error_count: u64,
    pub(crate) health_failures: u32,
    pub(crate) healthy: bool,
}

impl<T> ConnectionRecord<T> {
    fn new(id: u64, conn: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            conn,
            created_at: now,
            last_used: now,
            use_count: 0,
            total_latency: Duration::ZERO,
            error_count: 0,
            health_failures: 0,
            healthy: true,
        }
    }

    /// Retirement predicate: a record failing any lifecycle bound leaves
    /// the pool instead of returning to the idle queue.
    fn should_retire(&self, config: &SmartPoolConfig) -> bool {
        if !self.healthy || self.health_failures >= config.max_health_failures {
            return true;
        }
        if let Some(max_lifetime) = config.base.max_lifetime {
            if self.created_at.elapsed() > max_lifetime {
                return true;
            }
        }
        if let Some(max_uses) = config.max_uses {
            if self.use_count >= max_uses {
                return true;
            }
        }
        if let Some(idle_timeout) = config.base.idle_timeout {
            if self.last_used.elapsed() > idle_timeout {
                return true;
            }
        }
        false
    }
}

struct Waiter<T> {
    id: u64,
    tx: oneshot::Sender<ConnectionRecord<T>>,
}

/// Admission path resolved under one lock hold. The lock is released before
/// the create/wait awaits so the acquire future stays `Send`.
enum AcquireRoute<T> {
    /// An idle record was claimed for reuse
    Reuse(ConnectionRecord<T>),
    /// A capacity slot (and record id) was claimed; creation happens unlocked
    Create(u64),
    /// At capacity: wait for a handoff from the release path
    Wait(u64, oneshot::Receiver<ConnectionRecord<T>>),
}

struct SmartState<T> {
    idle: VecDeque<ConnectionRecord<T>>,
    waiters: VecDeque<Waiter<T>>,
    /// Live records: idle + checked out
    total: usize,
    /// Scaling target; acquire creates lazily while `total < target`
    target: usize,
    next_record_id: u64,
    next_waiter_id: u64,
    closed: bool,
    health_probes: u64,
    health_probe_failures: u64,
}

struct PoolCore<T: Send + 'static> {
    config: SmartPoolConfig,
    factory: Arc<dyn ConnectionFactory<T>>,
    breaker: CircuitBreaker,
    state: Mutex<SmartState<T>>,
    metrics: Arc<LoadMetrics>,
    stats: Arc<StatsCell>,
}

impl<T: Send + 'static> PoolCore<T> {
    /// Drop wait-queue entries whose receiver has gone away (cancelled
    /// callers), keeping the `waiting` gauge honest.
    fn prune_cancelled_waiters(&self, state: &mut SmartState<T>) {
        let before = state.waiters.len();
        state.waiters.retain(|w| !w.tx.is_closed());
        if state.waiters.len() != before {
            let waiting = state.waiters.len() as u64;
            self.stats.update(|s| s.waiting = waiting);
            self.metrics.set_waiting(waiting);
        }
    }

    fn publish_gauges(&self, state: &SmartState<T>) {
        let idle = state.idle.len() as u64;
        let total = state.total as u64;
        let active = total - idle;
        let waiting = state.waiters.len() as u64;
        self.stats.update(|s| {
            s.idle = idle;
            s.total = total;
            s.active = active;
            s.waiting = waiting;
        });
        self.metrics.set_waiting(waiting);
        self.metrics
            .set_utilization(active as f64 / self.config.base.max_size as f64);
    }

    /// Dispose of a retired record's connection without blocking the caller.
    fn dispose(&self, record: ConnectionRecord<T>) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let factory = Arc::clone(&self.factory);
            handle.spawn(async move {
                factory.close(record.conn).await;
            });
        }
        // Outside a runtime the connection is simply dropped.
    }

    /// Return a record to the pool: retire it, or hand it to the oldest
    /// waiter, or push it onto the idle queue.
    fn give_back(&self, mut record: ConnectionRecord<T>, held: Duration, failed: bool) {
        record.last_used = Instant::now();
        record.total_latency += held;
        if failed {
            record.error_count += 1;
        }
        self.metrics.record_request(held, !failed);

        let mut state = self.state.lock().unwrap();
        self.prune_cancelled_waiters(&mut state);

        let over_target = state.total > state.target;
        if state.closed || over_target || record.should_retire(&self.config) {
            state.total -= 1;
            self.stats.update(|s| s.closures += 1);
            debug!(
                pool = %self.config.base.name,
                record = record.id,
                uses = record.use_count,
                "retiring connection"
            );
            self.publish_gauges(&state);
            drop(state);
            self.dispose(record);
            return;
        }

        // FIFO handoff: only the oldest live waiter is woken.
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(record) {
                Ok(()) => {
                    self.publish_gauges(&state);
                    return;
                }
                Err(returned) => record = returned, // waiter cancelled, try next
            }
        }

        state.idle.push_back(record);
        self.publish_gauges(&state);
    }
}

/// RAII handle to a pooled connection.
///
/// Dropping the guard returns the connection to the pool; call
/// [`record_failure`](Self::record_failure) first when the request it served
/// failed, so the error rate and the circuit breaker see the outcome.
pub struct SmartConnection<T: Send + 'static> {
    record: Option<ConnectionRecord<T>>,
    core: Arc<PoolCore<T>>,
    permit: Option<Permit>,
    acquired_at: Instant,
    failed: AtomicBool,
}

impl<T: Send + 'static> SmartConnection<T> {
    /// Identifier of the underlying connection record
    pub fn id(&self) -> u64 {
        self.record.as_ref().map(|r| r.id).unwrap_or_default()
    }

    /// Mark the request served by this connection as failed
    pub fn record_failure(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

// The handle type stays opaque; only the pool-side metadata is printed.
impl<T: Send + 'static> fmt::Debug for SmartConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmartConnection")
            .field("id", &self.id())
            .field("failed", &self.failed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Deref for SmartConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.record.as_ref().expect("record present until drop").conn
    }
}

impl<T: Send + 'static> Drop for SmartConnection<T> {
    fn drop(&mut self) {
        let failed = self.failed.load(Ordering::SeqCst);

        if let Some(permit) = self.permit.take() {
            if failed {
                self.core.breaker.on_failure(permit);
            } else {
                self.core.breaker.on_success(permit);
            }
        }

        if let Some(record) = self.record.take() {
            self.core.give_back(record, self.acquired_at.elapsed(), failed);
        }
    }
}

/// Connection pool with per-connection lifecycle management, a circuit
/// breaker gate, FIFO waiter fairness, and a background health loop.
pub struct SmartConnectionPool<T: Send + 'static> {
    core: Arc<PoolCore<T>>,
}

impl<T: Send + 'static> Clone for SmartConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + 'static> SmartConnectionPool<T> {
    pub fn new(factory: Arc<dyn ConnectionFactory<T>>, config: SmartPoolConfig) -> Self {
        let target = config.base.max_size;
        let breaker = CircuitBreaker::new(config.breaker.clone());
        Self {
            core: Arc::new(PoolCore {
                config,
                factory,
                breaker,
                state: Mutex::new(SmartState {
                    idle: VecDeque::new(),
                    waiters: VecDeque::new(),
                    total: 0,
                    target,
                    next_record_id: 0,
                    next_waiter_id: 0,
                    closed: false,
                    health_probes: 0,
                    health_probe_failures: 0,
                }),
                metrics: Arc::new(LoadMetrics::new()),
                stats: Arc::new(StatsCell::new()),
            }),
        }
    }

    pub fn config(&self) -> &SmartPoolConfig {
        &self.core.config
    }

    /// Shared load-signal store (feeds the auto-scaling manager)
    pub fn metrics(&self) -> Arc<LoadMetrics> {
        Arc::clone(&self.core.metrics)
    }

    /// Breaker guarding this pool
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.core.breaker
    }

    /// Latest stats snapshot
    pub fn stats(&self) -> Arc<PoolStats> {
        self.core.stats.load()
    }

    /// Current live connection count and scaling target
    pub fn size(&self) -> (usize, usize) {
        let state = self.core.state.lock().unwrap();
        (state.total, state.target)
    }

    /// Set the lazy scaling target, clamped to `[min_size, max_size]`.
    ///
    /// The pool grows toward the target on demand and sheds surplus idle
    /// connections from the release path and the health loop; records are
    /// never torn out from under an active caller.
    pub fn set_target(&self, target: usize) {
        let clamped = target.clamp(self.core.config.base.min_size, self.core.config.base.max_size);
        let mut state = self.core.state.lock().unwrap();
        if state.target != clamped {
            info!(
                pool = %self.core.config.base.name,
                from = state.target,
                to = clamped,
                "scaling target changed"
            );
            state.target = clamped;
        }
    }

    /// Validate the config and pre-warm `min_size` connections. Idempotent.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        self.core.config.base.validate()?;

        loop {
            let id = {
                let mut state = self.core.state.lock().unwrap();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if state.total >= self.core.config.base.min_size {
                    return Ok(());
                }
                // Claim the slot while still holding the lock.
                state.total += 1;
                state.next_record_id += 1;
                state.next_record_id
            };
            let record = self.create_record(id).await?;
            let mut state = self.core.state.lock().unwrap();
            state.idle.push_back(record);
            self.core.publish_gauges(&state);
        }
    }

    /// Create the connection for an already-claimed slot. The caller has
    /// incremented `total` under the lock; a failure here gives the slot back.
    async fn create_record(&self, id: u64) -> Result<ConnectionRecord<T>, PoolError> {
        let created = tokio::time::timeout(
            self.core.config.base.connect_timeout,
            self.core.factory.create(),
        )
        .await;

        match created {
            Ok(Ok(conn)) => {
                self.core.stats.update(|s| s.creations += 1);
                Ok(ConnectionRecord::new(id, conn))
            }
            other => {
                let mut state = self.core.state.lock().unwrap();
                state.total -= 1;
                self.core.publish_gauges(&state);
                drop(state);
                self.core.stats.update(|s| s.errors += 1);
                match other {
                    Ok(Err(e)) => Err(e),
                    _ => Err(PoolError::Timeout(self.core.config.base.connect_timeout)),
                }
            }
        }
    }

    fn wrap(&self, mut record: ConnectionRecord<T>, permit: Permit) -> SmartConnection<T> {
        record.use_count += 1;
        SmartConnection {
            record: Some(record),
            core: Arc::clone(&self.core),
            permit: Some(permit),
            acquired_at: Instant::now(),
            failed: AtomicBool::new(false),
        }
    }

    /// Acquire a connection.
    ///
    /// Fails fast with [`PoolError::CircuitOpen`] when the breaker rejects
    /// the call. Otherwise reuses an idle valid record, creates a new one
    /// while below the scaling target, or joins the FIFO wait queue bounded
    /// by `acquire_timeout`.
    pub async fn acquire(&self) -> Result<SmartConnection<T>, PoolError> {
        let permit = self.core.breaker.try_acquire()?;
        self.core.stats.update(|s| s.acquisition_attempts += 1);
        let wait_start = Instant::now();

        // One critical section decides the admission path; the lock guard is
        // gone before any await. Reuse, the capacity-slot claim (total += 1),
        // and wait-queue entry are all atomic with the checks that justify
        // them, so concurrent acquirers can never overshoot the target.
        let route = {
            let mut state = self.core.state.lock().unwrap();
            if state.closed {
                return Err(PoolError::Closed);
            }
            self.core.prune_cancelled_waiters(&mut state);

            let mut retired = Vec::new();
            let mut found = None;
            while let Some(record) = state.idle.pop_front() {
                if record.should_retire(&self.core.config) {
                    state.total -= 1;
                    retired.push(record);
                } else {
                    found = Some(record);
                    break;
                }
            }
            if !retired.is_empty() {
                self.core
                    .stats
                    .update(|s| s.closures += retired.len() as u64);
            }

            let route = if let Some(record) = found {
                self.core.stats.update(|s| s.hits += 1);
                AcquireRoute::Reuse(record)
            } else if state.total < state.target {
                state.total += 1;
                state.next_record_id += 1;
                AcquireRoute::Create(state.next_record_id)
            } else {
                state.next_waiter_id += 1;
                let waiter_id = state.next_waiter_id;
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter { id: waiter_id, tx });
                AcquireRoute::Wait(waiter_id, rx)
            };
            self.core.publish_gauges(&state);
            drop(state);
            for r in retired {
                self.core.dispose(r);
            }
            route
        };

        match route {
            AcquireRoute::Reuse(record) => {
                self.core.stats.record_wait(wait_start.elapsed());
                Ok(self.wrap(record, permit))
            }
            AcquireRoute::Create(id) => match self.create_record(id).await {
                Ok(record) => {
                    self.core.stats.update(|s| s.misses += 1);
                    self.core.stats.record_wait(wait_start.elapsed());
                    Ok(self.wrap(record, permit))
                }
                Err(e) => {
                    warn!(
                        pool = %self.core.config.base.name,
                        error = %e,
                        "connection creation failed"
                    );
                    self.core.breaker.on_failure(permit);
                    Err(e)
                }
            },
            AcquireRoute::Wait(waiter_id, mut rx) => {
                // Borrowing the receiver keeps it alive past a timeout, so a
                // record that raced into the channel can still be recovered.
                match tokio::time::timeout(self.core.config.base.acquire_timeout, &mut rx).await {
                    Ok(Ok(record)) => {
                        self.core.stats.update(|s| s.hits += 1);
                        self.core.stats.record_wait(wait_start.elapsed());
                        Ok(self.wrap(record, permit))
                    }
                    Ok(Err(_)) => {
                        // Sender side went away: pool shut down mid-wait.
                        Err(PoolError::Closed)
                    }
                    Err(_) => {
                        let was_queued = {
                            let mut state = self.core.state.lock().unwrap();
                            let was_queued = state.waiters.iter().any(|w| w.id == waiter_id);
                            state.waiters.retain(|w| w.id != waiter_id);
                            self.core.publish_gauges(&state);
                            was_queued
                        };

                        if !was_queued {
                            // The release path already popped this waiter; the
                            // record is either in the channel or still with
                            // the sender.
                            if let Ok(record) = rx.try_recv() {
                                self.core.stats.update(|s| s.hits += 1);
                                self.core.stats.record_wait(wait_start.elapsed());
                                return Ok(self.wrap(record, permit));
                            }
                        }

                        self.core.stats.update(|s| s.exhaustions += 1);
                        Err(PoolError::Exhausted)
                    }
                }
            }
        }
    }

    /// One health sweep: probes every idle record, bumps or resets its
    /// failure counter, retires the ones past their limit, and sheds surplus
    /// idle connections above the scaling target.
    pub async fn run_health_sweep(&self) -> HealthSweep {
        let borrowed: Vec<ConnectionRecord<T>> = {
            let mut state = self.core.state.lock().unwrap();
            if state.closed {
                return HealthSweep::default();
            }
            state.idle.drain(..).collect()
        };

        let mut healthy_records = Vec::new();
        let mut retired = Vec::new();
        let mut probes = 0u64;
        let mut failures = 0u64;

        for mut record in borrowed {
            probes += 1;
            if self.core.factory.is_healthy(&record.conn).await {
                record.health_failures = 0;
                record.healthy = true;
                healthy_records.push(record);
            } else {
                failures += 1;
                record.health_failures += 1;
                if record.health_failures >= self.core.config.max_health_failures {
                    record.healthy = false;
                    retired.push(record);
                } else {
                    healthy_records.push(record);
                }
            }
        }

        let sweep = {
            let mut state = self.core.state.lock().unwrap();
            state.health_probes += probes;
            state.health_probe_failures += failures;

            // Shed surplus idle connections above the scaling target.
            while state.total > state.target {
                match healthy_records.pop() {
                    Some(record) => {
                        state.total -= 1;
                        retired.push(record);
                    }
                    None => break,
                }
            }

            // Health-retired records leave the total here; target-shed ones
            // were already subtracted above.
            let health_retired = retired.iter().filter(|r| !r.healthy).count();
            state.total -= health_retired;

            for record in healthy_records {
                state.idle.push_back(record);
            }
            // Serve any waiters that piled up during the sweep.
            while let Some(waiter) = state.waiters.pop_front() {
                match state.idle.pop_front() {
                    Some(record) => {
                        if let Err(returned) = waiter.tx.send(record) {
                            state.idle.push_front(returned);
                        }
                    }
                    None => {
                        state.waiters.push_front(waiter);
                        break;
                    }
                }
            }

            self.core.stats.update(|s| s.closures += retired.len() as u64);
            self.core.publish_gauges(&state);

            HealthSweep {
                probed: probes,
                failed: failures,
                retired: retired.len() as u64,
                success_rate: if state.health_probes == 0 {
                    1.0
                } else {
                    1.0 - state.health_probe_failures as f64 / state.health_probes as f64
                },
            }
        };

        for record in retired {
            self.core.dispose(record);
        }

        if sweep.failed > 0 {
            warn!(
                pool = %self.core.config.base.name,
                probed = sweep.probed,
                failed = sweep.failed,
                retired = sweep.retired,
                "health sweep found failing connections"
            );
        }
        sweep
    }

    /// Spawn the background health loop. Runs until `shutdown` flips.
    pub fn spawn_health_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let interval = pool.core.config.base.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.run_health_sweep().await;
                        // Keep the warm floor after retirements.
                        if let Err(e) = pool.initialize().await {
                            if !matches!(e, PoolError::Closed) {
                                warn!(error = %e, "failed to re-warm pool after sweep");
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!(pool = %pool.core.config.base.name, "health loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Drain idle connections and fail pending waiters. Idempotent; further
    /// acquires fail with [`PoolError::Closed`].
    pub async fn close(&self) -> Result<(), PoolError> {
        let (idle, waiters) = {
            let mut state = self.core.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.total -= idle.len();
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            self.core.stats.update(|s| s.closures += idle.len() as u64);
            self.core.publish_gauges(&state);
            (idle, waiters)
        };

        // Dropping the senders wakes every waiter with a Closed error.
        drop(waiters);
        for record in idle {
            self.core.factory.close(record.conn).await;
        }
        info!(pool = %self.core.config.base.name, "pool closed");
        Ok(())
    }
}

/// Result of one health sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSweep {
    pub probed: u64,
    pub failed: u64,
    pub retired: u64,
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct TestConnection {
        id: usize,
        healthy: Arc<AtomicBool>,
    }

    struct TestFactory {
        counter: AtomicUsize,
        fail_creates: AtomicBool,
        unhealthy: AtomicBool,
    }

    impl TestFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counter: AtomicUsize::new(0),
                fail_creates: AtomicBool::new(false),
                unhealthy: AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl ConnectionFactory<TestConnection> for TestFactory {
        async fn create(&self) -> Result<TestConnection, PoolError> {
            if self.fail_creates.load(Ordering::SeqCst) {
                return Err(PoolError::Transient("backend refused".into()));
            }
            Ok(TestConnection {
                id: self.counter.fetch_add(1, Ordering::SeqCst) + 1,
                healthy: Arc::new(AtomicBool::new(true)),
            })
        }

        async fn is_healthy(&self, conn: &TestConnection) -> bool {
            !self.unhealthy.load(Ordering::SeqCst) && conn.healthy.load(Ordering::SeqCst)
        }
    }

    fn test_config(max_size: usize) -> SmartPoolConfig {
        SmartPoolConfig {
            base: PoolConfig {
                min_size: 1,
                max_size,
                acquire_timeout: Duration::from_millis(200),
                health_check_interval: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_reuses_record() {
        let factory = TestFactory::new();
        let pool = SmartConnectionPool::new(factory.clone(), test_config(4));

        let conn = pool.acquire().await.unwrap();
        let first_id = conn.id();
        drop(conn);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), first_id);
        assert_eq!(factory.counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invariant_totals() {
        let factory = TestFactory::new();
        let pool = SmartConnectionPool::new(factory, test_config(4));

        let c1 = pool.acquire().await.unwrap();
        let c2 = pool.acquire().await.unwrap();
        drop(c1);

        let stats = pool.stats();
        assert!(stats.active + stats.idle <= stats.total);
        assert!(stats.total <= 4);
        drop(c2);
    }

    #[tokio::test]
    async fn test_fifo_waiter_handoff() {
        let factory = TestFactory::new();
        let pool = SmartConnectionPool::new(factory, test_config(1));

        let held = pool.acquire().await.unwrap();

        // Two waiters join in order.
        let p1 = pool.clone();
        let first = tokio::spawn(async move { p1.acquire().await.map(|c| c.id()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let p2 = pool.clone();
        let second = tokio::spawn(async move { p2.acquire().await.map(|c| c.id()) });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(pool.stats().waiting, 2);
        drop(held);

        // The oldest waiter is served first; the second gets the record
        // when the first releases it.
        let first_id = first.await.unwrap().unwrap();
        let second_id = second.await.unwrap().unwrap();
        assert_eq!(first_id, second_id);
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_wait_timeout_is_exhaustion() {
        let factory = TestFactory::new();
        let pool = SmartConnectionPool::new(factory, test_config(1));

        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::Exhausted)));
        assert_eq!(pool.stats().exhaustions, 1);
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_no_entry() {
        let factory = TestFactory::new();
        let pool = SmartConnectionPool::new(factory, test_config(1));

        let held = pool.acquire().await.unwrap();

        // Caller cancels while queued.
        let result =
            tokio::time::timeout(Duration::from_millis(30), pool.acquire()).await;
        assert!(result.is_err());

        // Release prunes the dead waiter instead of handing the record to it.
        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_create_failures() {
        let factory = TestFactory::new();
        let mut config = test_config(2);
        config.breaker.failure_threshold = 3;
        config.breaker.recovery_timeout = Duration::from_secs(60);
        let pool = SmartConnectionPool::new(factory.clone(), config);

        factory.fail_creates.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            assert!(pool.acquire().await.is_err());
        }

        // Fourth call fails fast without touching the factory.
        let created_before = factory.counter.load(Ordering::SeqCst);
        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::CircuitOpen)));
        assert_eq!(factory.counter.load(Ordering::SeqCst), created_before);
    }

    #[tokio::test]
    async fn test_request_failures_feed_breaker_and_error_rate() {
        let factory = TestFactory::new();
        let mut config = test_config(2);
        config.breaker.failure_threshold = 2;
        let pool = SmartConnectionPool::new(factory, config);

        for _ in 0..2 {
            let conn = pool.acquire().await.unwrap();
            conn.record_failure();
            drop(conn);
        }

        assert!(matches!(
            pool.acquire().await,
            Err(PoolError::CircuitOpen)
        ));
        assert!(pool.metrics().snapshot().error_rate > 0.5);
    }

    #[tokio::test]
    async fn test_retirement_after_max_uses() {
        let factory = TestFactory::new();
        let mut config = test_config(2);
        config.max_uses = Some(2);
        let pool = SmartConnectionPool::new(factory.clone(), config);

        for _ in 0..2 {
            drop(pool.acquire().await.unwrap());
        }
        // Second use hit the cap; the record retired on release.
        assert_eq!(pool.stats().idle, 0);

        // Next acquire creates a fresh connection.
        let conn = pool.acquire().await.unwrap();
        assert_eq!(factory.counter.load(Ordering::SeqCst), 2);
        drop(conn);
    }

    #[tokio::test]
    async fn test_health_sweep_retires_after_threshold() {
        let factory = TestFactory::new();
        let mut config = test_config(2);
        config.max_health_failures = 2;
        let pool = SmartConnectionPool::new(factory.clone(), config);
        pool.initialize().await.unwrap();

        factory.unhealthy.store(true, Ordering::SeqCst);
        let sweep = pool.run_health_sweep().await;
        assert_eq!(sweep.failed, 1);
        assert_eq!(sweep.retired, 0); // one strike, still pooled

        let sweep = pool.run_health_sweep().await;
        assert_eq!(sweep.retired, 1); // second strike retires
        assert_eq!(pool.stats().total, 0);
        assert!(sweep.success_rate < 0.5);
    }

    #[tokio::test]
    async fn test_scale_down_sheds_idle() {
        let factory = TestFactory::new();
        let pool = SmartConnectionPool::new(factory, test_config(4));

        let conns: Vec<_> = futures::future::join_all((0..4).map(|_| pool.acquire()))
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        drop(conns);
        assert_eq!(pool.stats().idle, 4);

        pool.set_target(2);
        pool.run_health_sweep().await;
        let (total, target) = pool.size();
        assert_eq!(target, 2);
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_set_target_clamps() {
        let factory = TestFactory::new();
        let pool = SmartConnectionPool::new(factory, test_config(4));

        pool.set_target(100);
        assert_eq!(pool.size().1, 4);
        pool.set_target(0);
        assert_eq!(pool.size().1, 1); // min_size floor
    }

    #[tokio::test]
    async fn test_acquire_future_is_send() {
        fn require_send<F: std::future::Future + Send>(f: F) -> F {
            f
        }

        let factory = TestFactory::new();
        let pool = SmartConnectionPool::new(factory, test_config(2));

        // Spawnable from a multi-threaded runtime: no lock guard may live
        // across the create/wait awaits.
        let conn = require_send(pool.acquire()).await.unwrap();
        drop(conn);
    }

    #[tokio::test]
    async fn test_guard_debug_omits_handle() {
        let factory = TestFactory::new();
        let pool = SmartConnectionPool::new(factory, test_config(2));

        let conn = pool.acquire().await.unwrap();
        let repr = format!("{conn:?}");
        assert!(repr.contains("SmartConnection"));
        assert!(repr.contains("id"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquires_never_overshoot_capacity() {
        struct GaugedFactory {
            in_flight: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl ConnectionFactory<TestConnection> for GaugedFactory {
            async fn create(&self) -> Result<TestConnection, PoolError> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(TestConnection {
                    id: 0,
                    healthy: Arc::new(AtomicBool::new(true)),
                })
            }

            async fn is_healthy(&self, conn: &TestConnection) -> bool {
                conn.healthy.load(Ordering::SeqCst)
            }
        }

        let factory = Arc::new(GaugedFactory {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let pool = SmartConnectionPool::new(factory.clone(), test_config(1));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let conn = pool.acquire().await.unwrap();
                    drop(conn);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // The slot claim is atomic with the capacity check, so parallel
        // acquirers can never drive concurrent creates past max_size.
        assert!(factory.peak.load(Ordering::SeqCst) <= 1);
        let (total, _) = pool.size();
        assert!(total <= 1);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_and_poisons() {
        let factory = TestFactory::new();
        let pool = SmartConnectionPool::new(factory, test_config(1));

        let _held = pool.acquire().await.unwrap();
        let waiter_pool = pool.clone();
        let waiter =
            tokio::spawn(async move { waiter_pool.acquire().await.map(|c| c.id()) });
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close().await.unwrap();
        pool.close().await.unwrap(); // idempotent

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(PoolError::Closed)));
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }
}
