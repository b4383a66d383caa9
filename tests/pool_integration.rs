//! End-to-end pool behavior
//!
//! Exercises the smart pool, circuit breaker, scaling manager, and the pool
//! manager together: contention fairness, breaker trip/recover sequences,
//! scaling hysteresis under an oscillating load signal, waiter cancellation,
//! and idempotent lifecycle.

use perigee::pool::{ConnectionFactory, PoolConfig};
use perigee::scaling::{AutoScalingConfig, AutoScalingManager, ScaleDecision};
use perigee::{
    CircuitBreakerConfig, CircuitState, LoadMetrics, PoolError, PoolManager, SmartConnectionPool,
    SmartPoolConfig,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

struct TestConnection {
    #[allow(dead_code)]
    serial: usize,
}

struct TestFactory {
    created: AtomicUsize,
    fail_creates: AtomicBool,
}

impl TestFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            fail_creates: AtomicBool::new(false),
        })
    }

    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConnectionFactory<TestConnection> for TestFactory {
    async fn create(&self) -> Result<TestConnection, PoolError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            self.created.fetch_add(1, Ordering::SeqCst);
            return Err(PoolError::Transient("backend refused".into()));
        }
        Ok(TestConnection {
            serial: self.created.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn is_healthy(&self, _conn: &TestConnection) -> bool {
        true
    }
}

fn pool_config(name: &str, min: usize, max: usize) -> SmartPoolConfig {
    SmartPoolConfig {
        base: PoolConfig {
            name: name.to_string(),
            min_size: min,
            max_size: max,
            acquire_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        },
        ..SmartPoolConfig::default()
    }
}

#[tokio::test]
async fn test_fifty_concurrent_acquires_against_ten_slots() {
    let factory = TestFactory::new();
    let pool = SmartConnectionPool::new(factory.clone(), pool_config("contended", 2, 10));
    pool.initialize().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let conn = pool.acquire().await?;
            sleep(Duration::from_millis(5)).await;
            drop(conn);
            Ok::<(), PoolError>(())
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Never more than max_size live connections, and the pool settles with
    // no one waiting.
    let (total, _) = pool.size();
    assert!(total <= 10, "total = {total}");
    assert_eq!(pool.stats().waiting, 0);
    assert!(factory.created() <= 10);

    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_waiters_served_in_fifo_order() {
    let factory = TestFactory::new();
    let pool = SmartConnectionPool::new(factory, pool_config("fifo", 1, 1));

    let held = pool.acquire().await.unwrap();

    let served: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..5 {
        let pool = pool.clone();
        let served = Arc::clone(&served);
        handles.push(tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            served.lock().unwrap().push(i);
            sleep(Duration::from_millis(5)).await;
            drop(conn);
        }));
        // Stagger spawns so queue positions match task indices.
        sleep(Duration::from_millis(30)).await;
    }

    drop(held);
    for handle in handles {
        handle.await.unwrap();
    }

    let order = served.lock().unwrap().clone();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);

    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_breaker_trips_fast_fails_and_recovers() {
    let factory = TestFactory::new();
    let mut config = pool_config("flaky", 1, 4);
    config.breaker = CircuitBreakerConfig {
        failure_threshold: 3,
        recovery_timeout: Duration::from_millis(100),
    };
    let pool = SmartConnectionPool::new(factory.clone(), config);

    factory.fail_creates.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        assert!(pool.acquire().await.is_err());
    }
    assert_eq!(pool.breaker().state(), CircuitState::Open);

    // Fast-fail without touching the factory.
    let attempts_before = factory.created();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::CircuitOpen));
    assert_eq!(factory.created(), attempts_before);

    // After the recovery window a single probe is admitted; its success
    // closes the breaker and resets the failure count.
    sleep(Duration::from_millis(150)).await;
    factory.fail_creates.store(false, Ordering::SeqCst);
    let conn = pool.acquire().await.unwrap();
    drop(conn);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.breaker().state(), CircuitState::Closed);
    assert_eq!(pool.breaker().failure_count(), 0);

    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_scaling_hysteresis_no_flapping() {
    let metrics = Arc::new(LoadMetrics::new());
    let config = AutoScalingConfig {
        min_connections: 2,
        max_connections: 20,
        scale_up_cooldown: Duration::from_secs(60),
        scale_down_cooldown: Duration::from_secs(60),
        ..AutoScalingConfig::default()
    };
    let manager = AutoScalingManager::new(config, Arc::clone(&metrics), 4).unwrap();

    let saturate = || {
        metrics.set_utilization(1.0);
        metrics.set_waiting(50);
        for _ in 0..10 {
            metrics.record_request(Duration::from_secs(5), false);
        }
    };
    let relax = || {
        metrics.set_utilization(0.5);
        metrics.set_waiting(0);
    };

    // Load oscillating around the thresholds inside one cooldown window:
    // only the first breach may change the size.
    let mut changes = 0;
    for round in 0..10 {
        if round % 2 == 0 {
            saturate();
        } else {
            relax();
        }
        if let ScaleDecision::ScaleTo(_) = manager.evaluate() {
            changes += 1;
        }
    }
    assert!(changes <= 1, "size changed {changes} times in one window");

    let report = manager.report();
    assert!(report.scale_up_cooldown_remaining_secs > 0.0);
}

#[tokio::test]
async fn test_cancelled_waiter_leaves_no_queue_entry() {
    let factory = TestFactory::new();
    let pool = SmartConnectionPool::new(factory, pool_config("cancel", 1, 1));

    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let _ = pool.acquire().await;
        })
    };
    sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.stats().waiting, 1);

    waiter.abort();
    let _ = waiter.await;

    // The release path prunes the dead waiter and republishes gauges.
    drop(held);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.stats().waiting, 0);

    // The slot is still usable.
    let conn = pool.acquire().await.unwrap();
    drop(conn);

    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_manager_lifecycle_and_stats() {
    let manager = PoolManager::new();
    manager
        .register("db", TestFactory::new(), pool_config("db", 2, 8), None)
        .unwrap();
    manager
        .register(
            "cache",
            TestFactory::new(),
            pool_config("cache", 1, 4),
            Some(AutoScalingConfig {
                min_connections: 1,
                max_connections: 4,
                ..AutoScalingConfig::default()
            }),
        )
        .unwrap();

    manager.start().await.unwrap();
    manager.start().await.unwrap(); // second start is a no-op

    let conn = manager.get_connection("db").await.unwrap();
    let stats = manager.get_stats();
    assert_eq!(stats["db"].active, 1);
    assert!(stats["db"].total >= 2); // warmed to min_size
    drop(conn);

    let health = manager.force_health_check().await;
    assert_eq!(health.pools.len(), 2);
    assert_eq!(health.pools["db"].failed, 0);

    let scaling = manager.scaling_metrics();
    assert!(scaling.pools.contains_key("cache"));
    assert!(!scaling.pools.contains_key("db"));

    manager.stop().await.unwrap();
    manager.stop().await.unwrap(); // second stop is a no-op

    let err = manager.get_connection("db").await.unwrap_err();
    assert!(matches!(err, PoolError::Closed));
}

#[tokio::test]
async fn test_stats_snapshot_reflects_hits_and_misses() {
    let factory = TestFactory::new();
    let pool = SmartConnectionPool::new(factory, pool_config("counted", 1, 4));

    // First acquire creates (miss), second reuses (hit).
    let conn = pool.acquire().await.unwrap();
    drop(conn);
    sleep(Duration::from_millis(10)).await;
    let conn = pool.acquire().await.unwrap();
    drop(conn);
    sleep(Duration::from_millis(10)).await;

    let stats = pool.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.acquisition_attempts, 2);
    assert_eq!(stats.active, 0);

    let json = serde_json::to_string(&*stats).unwrap();
    assert!(json.contains("\"hits\":1"));

    pool.close().await.unwrap();
}
