//! Generic connection pool base
//!
//! Provides the acquire/release contract over an opaque connection type `T`
//! produced by a caller-supplied [`ConnectionFactory`]. Backend specifics
//! (dialects, retry, protocol pings) live in the adapter layer; this base
//! owns capacity accounting, idle reuse with expiry, and stat bookkeeping.

use crate::error::PoolError;
use crate::stats::{PoolStats, StatsCell};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

/// Configuration for a pool instance.
///
/// Invariant: `0 < min_size <= max_size`.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name used in logs and reports
    pub name: String,
    /// Connections created at initialization and kept warm
    pub min_size: usize,
    /// Hard upper bound on live connections
    pub max_size: usize,
    /// Idle connections older than this are retired
    pub idle_timeout: Option<Duration>,
    /// Time allowed for the factory to produce one connection
    pub connect_timeout: Duration,
    /// Time a caller may wait for a free slot
    pub acquire_timeout: Duration,
    /// Cadence of the background health loop
    pub health_check_interval: Duration,
    /// Connections older than this are retired regardless of use
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_size: 2,
            max_size: 10,
            idle_timeout: Some(Duration::from_secs(300)),
            connect_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            max_lifetime: Some(Duration::from_secs(1800)),
        }
    }
}

impl PoolConfig {
    /// Validate the size invariant
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_size == 0 {
            return Err(PoolError::InvalidConfig(
                "min_size must be greater than zero".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Factory trait for creating and validating connections
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Create a new connection
    async fn create(&self) -> Result<T, PoolError>;

    /// Check if a connection is still healthy.
    ///
    /// Must be a single O(1) round trip — for SQL backends a `SELECT 1`
    /// outside any transaction, for key-value backends a ping.
    async fn is_healthy(&self, conn: &T) -> bool;

    /// Close a connection (optional cleanup)
    async fn close(&self, conn: T) {
        drop(conn);
    }
}

/// A connection wrapper that tracks reuse metadata
#[derive(Debug)]
struct IdleConnection<T> {
    conn: T,
    created_at: Instant,
    last_used: Instant,
}

impl<T> IdleConnection<T> {
    fn new(conn: T) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
        }
    }

    fn is_expired(&self, config: &PoolConfig) -> bool {
        if let Some(idle_timeout) = config.idle_timeout {
            if self.last_used.elapsed() > idle_timeout {
                return true;
            }
        }
        if let Some(max_lifetime) = config.max_lifetime {
            if self.created_at.elapsed() > max_lifetime {
                return true;
            }
        }
        false
    }
}

struct PoolState<T> {
    idle: Vec<IdleConnection<T>>,
    active_count: usize,
    initialized: bool,
    closed: bool,
}

impl<T> PoolState<T> {
    fn total(&self) -> usize {
        self.idle.len() + self.active_count
    }
}

/// Generic pool over an opaque connection handle.
///
/// Acquire suspends the caller behind a semaphore when at capacity; all
/// suspensions are bounded by `acquire_timeout`. Capacity and stat mutation
/// go through one mutex per pool instance.
pub struct ConnectionPool<T> {
    config: Arc<PoolConfig>,
    factory: Arc<dyn ConnectionFactory<T>>,
    state: Arc<Mutex<PoolState<T>>>,
    semaphore: Arc<Semaphore>,
    stats: Arc<StatsCell>,
}

impl<T: Send + 'static> ConnectionPool<T> {
    pub fn new(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig) -> Self {
        let max_size = config.max_size;
        Self {
            config: Arc::new(config),
            factory,
            state: Arc::new(Mutex::new(PoolState {
                idle: Vec::new(),
                active_count: 0,
                initialized: false,
                closed: false,
            })),
            semaphore: Arc::new(Semaphore::new(max_size)),
            stats: Arc::new(StatsCell::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Set up backend resources exactly once: validates the config and
    /// pre-warms `min_size` connections. Safe to call repeatedly.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        self.config.validate()?;

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(PoolError::Closed);
        }
        if state.initialized {
            return Ok(());
        }

        for _ in 0..self.config.min_size {
            let conn = self.create_connection().await?;
            state.idle.push(IdleConnection::new(conn));
            self.stats.update(|s| {
                s.creations += 1;
                s.idle += 1;
                s.total += 1;
            });
        }

        state.initialized = true;
        debug!(pool = %self.config.name, warmed = self.config.min_size, "pool initialized");
        Ok(())
    }

    async fn create_connection(&self) -> Result<T, PoolError> {
        match tokio::time::timeout(self.config.connect_timeout, self.factory.create()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => {
                self.stats.update(|s| s.errors += 1);
                Err(e)
            }
            Err(_) => {
                self.stats.update(|s| s.errors += 1);
                Err(PoolError::Timeout(self.config.connect_timeout))
            }
        }
    }

    /// Acquire a connection, reusing an idle one or creating a new one.
    ///
    /// Waits up to `acquire_timeout` for a free slot when at capacity, then
    /// fails with [`PoolError::Exhausted`]. Exactly one of hits/misses is
    /// counted per call, regardless of how many stale idle connections were
    /// discarded along the way.
    pub async fn acquire(&self) -> Result<T, PoolError> {
        {
            let state = self.state.lock().await;
            if state.closed {
                return Err(PoolError::Closed);
            }
            if !state.initialized {
                drop(state);
                self.initialize().await?;
            }
        }

        self.stats.update(|s| s.acquisition_attempts += 1);
        let wait_start = Instant::now();

        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.acquire(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                self.stats.update(|s| s.exhaustions += 1);
                return Err(PoolError::Exhausted);
            }
        };
        // Permit is managed manually across the acquire/release pair.
        permit.forget();
        self.stats.record_wait(wait_start.elapsed());

        let mut state = self.state.lock().await;
        if state.closed {
            self.semaphore.add_permits(1);
            return Err(PoolError::Closed);
        }

        // Drop expired idle connections before considering reuse.
        let before = state.idle.len();
        state.idle.retain(|c| !c.is_expired(&self.config));
        let expired = before - state.idle.len();
        if expired > 0 {
            self.stats.update(|s| {
                s.closures += expired as u64;
                s.idle = s.idle.saturating_sub(expired as u64);
                s.total = s.total.saturating_sub(expired as u64);
            });
        }

        while let Some(mut idle) = state.idle.pop() {
            if self.factory.is_healthy(&idle.conn).await {
                idle.last_used = Instant::now();
                state.active_count += 1;
                self.stats.update(|s| {
                    s.hits += 1;
                    s.active += 1;
                    s.idle = s.idle.saturating_sub(1);
                });
                return Ok(idle.conn);
            }
            self.stats.update(|s| {
                s.closures += 1;
                s.idle = s.idle.saturating_sub(1);
                s.total = s.total.saturating_sub(1);
            });
            self.factory.close(idle.conn).await;
        }

        // No reusable idle connection: this call is a miss.
        state.active_count += 1;
        drop(state);

        match self.create_connection().await {
            Ok(conn) => {
                self.stats.update(|s| {
                    s.misses += 1;
                    s.creations += 1;
                    s.active += 1;
                    s.total += 1;
                });
                Ok(conn)
            }
            Err(e) => {
                self.semaphore.add_permits(1);
                let mut state = self.state.lock().await;
                state.active_count -= 1;
                warn!(pool = %self.config.name, error = %e, "connection creation failed");
                Err(e)
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// Unhealthy or over-capacity connections are closed instead of pooled.
    pub async fn release(&self, conn: T) {
        let mut state = self.state.lock().await;
        state.active_count = state.active_count.saturating_sub(1);

        let keep = !state.closed
            && state.total() < self.config.max_size
            && self.factory.is_healthy(&conn).await;

        if keep {
            state.idle.push(IdleConnection::new(conn));
            self.stats.update(|s| {
                s.active = s.active.saturating_sub(1);
                s.idle += 1;
            });
        } else {
            self.stats.update(|s| {
                s.active = s.active.saturating_sub(1);
                s.total = s.total.saturating_sub(1);
                s.closures += 1;
            });
            drop(state);
            self.factory.close(conn).await;
        }

        self.semaphore.add_permits(1);
    }

    /// Drain and dispose of all idle connections; further acquires fail with
    /// [`PoolError::Closed`]. Idempotent.
    pub async fn close(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let idle = std::mem::take(&mut state.idle);
        let drained = idle.len();
        drop(state);

        for pooled in idle {
            self.factory.close(pooled.conn).await;
        }
        self.stats.update(|s| {
            s.closures += drained as u64;
            s.idle = 0;
            s.total = s.total.saturating_sub(drained as u64);
        });

        debug!(pool = %self.config.name, drained, "pool closed");
        Ok(())
    }

    /// One O(1) backend round trip: probes an idle connection if present,
    /// otherwise creates (and pools) a fresh one.
    pub async fn health_check(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return false;
        }

        if let Some(idle) = state.idle.pop() {
            if self.factory.is_healthy(&idle.conn).await {
                state.idle.push(idle);
                return true;
            }
            self.stats.update(|s| {
                s.closures += 1;
                s.idle = s.idle.saturating_sub(1);
                s.total = s.total.saturating_sub(1);
            });
            self.factory.close(idle.conn).await;
            return false;
        }
        drop(state);

        match self.create_connection().await {
            Ok(conn) => {
                let healthy = self.factory.is_healthy(&conn).await;
                let mut state = self.state.lock().await;
                if healthy && !state.closed && state.total() < self.config.max_size {
                    state.idle.push(IdleConnection::new(conn));
                    self.stats.update(|s| {
                        s.creations += 1;
                        s.idle += 1;
                        s.total += 1;
                    });
                } else {
                    drop(state);
                    self.factory.close(conn).await;
                }
                healthy
            }
            Err(_) => false,
        }
    }

    /// Latest stats snapshot
    pub fn stats(&self) -> Arc<PoolStats> {
        self.stats.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestConnection {
        id: usize,
        healthy: Arc<AtomicBool>,
    }

    struct TestFactory {
        counter: AtomicUsize,
        fail_creates: AtomicBool,
    }

    impl TestFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counter: AtomicUsize::new(0),
                fail_creates: AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl ConnectionFactory<TestConnection> for TestFactory {
        async fn create(&self) -> Result<TestConnection, PoolError> {
            if self.fail_creates.load(Ordering::SeqCst) {
                return Err(PoolError::Transient("refused".into()));
            }
            let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TestConnection {
                id,
                healthy: Arc::new(AtomicBool::new(true)),
            })
        }

        async fn is_healthy(&self, conn: &TestConnection) -> bool {
            conn.healthy.load(Ordering::SeqCst)
        }
    }

    fn small_config() -> PoolConfig {
        PoolConfig {
            min_size: 1,
            max_size: 3,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        let mut config = PoolConfig::default();
        config.min_size = 0;
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));

        config.min_size = 20;
        config.max_size = 10;
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));

        assert!(PoolConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory.clone(), small_config());

        pool.initialize().await.unwrap();
        pool.initialize().await.unwrap();

        // min_size = 1: only one connection was warmed despite two calls.
        assert_eq!(factory.counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_acquire_release_counts_hit() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory, small_config());

        // First acquire consumes the warmed connection — a hit.
        let conn = pool.acquire().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.acquisition_attempts, 1);

        pool.release(conn).await;
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_acquire_beyond_warm_counts_miss() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory, small_config());

        let c1 = pool.acquire().await.unwrap();
        let c2 = pool.acquire().await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total, 2);
        assert!(stats.active + stats.idle <= stats.total);

        pool.release(c1).await;
        pool.release(c2).await;
    }

    #[tokio::test]
    async fn test_exhaustion_at_capacity() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory, small_config());

        let _c1 = pool.acquire().await.unwrap();
        let _c2 = pool.acquire().await.unwrap();
        let _c3 = pool.acquire().await.unwrap();

        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::Exhausted)));
        assert_eq!(pool.stats().exhaustions, 1);
    }

    #[tokio::test]
    async fn test_reuse_same_connection() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory, small_config());

        let conn = pool.acquire().await.unwrap();
        let id = conn.id;
        pool.release(conn).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id, id);
        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_unhealthy_connection_not_pooled() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory, small_config());

        let conn = pool.acquire().await.unwrap();
        conn.healthy.store(false, Ordering::SeqCst);
        pool.release(conn).await;

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert!(stats.closures >= 1);
    }

    #[tokio::test]
    async fn test_create_failure_surfaces_and_frees_slot() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory.clone(), small_config());
        pool.initialize().await.unwrap();

        let c1 = pool.acquire().await.unwrap();
        factory.fail_creates.store(true, Ordering::SeqCst);

        let result = pool.acquire().await;
        assert!(result.is_err());
        assert!(pool.stats().errors >= 1);

        // The slot freed by the failed create is usable again.
        factory.fail_creates.store(false, Ordering::SeqCst);
        let c2 = pool.acquire().await.unwrap();
        pool.release(c1).await;
        pool.release(c2).await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_poisons() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory, small_config());
        pool.initialize().await.unwrap();

        pool.close().await.unwrap();
        pool.close().await.unwrap();

        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_health_check_probes_one_connection() {
        let factory = TestFactory::new();
        let pool = ConnectionPool::new(factory.clone(), small_config());
        pool.initialize().await.unwrap();

        assert!(pool.health_check().await);
        // Probe reused the idle connection; nothing new was created.
        assert_eq!(factory.counter.load(Ordering::SeqCst), 1);
    }
}
