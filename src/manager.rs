//! Pool manager — explicit registry with lifecycle control
//!
//! One `PoolManager` is constructed at process start and passed to
//! consumers; there are no module-level singletons and no implicit
//! start-on-first-use. `start` and `stop` are idempotent and own the
//! background health and scaling loops through a shared shutdown signal.

use crate::error::PoolError;
use crate::pool::ConnectionFactory;
use crate::scaling::{AutoScalingConfig, AutoScalingManager, ScalingReport};
use crate::smart::{HealthSweep, SmartConnection, SmartConnectionPool, SmartPoolConfig};
use crate::stats::PoolStats;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct PoolEntry<T: Send + 'static> {
    pool: SmartConnectionPool<T>,
    scaling: Option<AutoScalingConfig>,
    scaler: Option<Arc<AutoScalingManager>>,
}

/// Health report across every registered pool
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub pools: HashMap<String, HealthSweep>,
}

/// Scaling report across every registered pool with a scaler
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerScalingReport {
    pub pools: HashMap<String, PoolScalingEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolScalingEntry {
    /// Live connections and the size the pool is converging toward
    pub current_size: usize,
    pub target_size: usize,
    #[serde(flatten)]
    pub report: ScalingReport,
}

/// Registry of named pools with explicit lifecycle.
///
/// All pools in one manager share a handle type; run one manager per
/// backend family.
pub struct PoolManager<T: Send + 'static> {
    pools: RwLock<HashMap<String, PoolEntry<T>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> Default for PoolManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> PoolManager<T> {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a pool under `kind`. Fails on duplicate kinds; pools
    /// registered after `start` get their loops on the next `start`.
    pub fn register(
        &self,
        kind: impl Into<String>,
        factory: Arc<dyn ConnectionFactory<T>>,
        config: SmartPoolConfig,
        scaling: Option<AutoScalingConfig>,
    ) -> Result<(), PoolError> {
        config.base.validate()?;
        if let Some(ref scaling) = scaling {
            scaling.validate()?;
        }
        let kind = kind.into();
        let mut pools = self.pools.write().unwrap();
        if pools.contains_key(&kind) {
            return Err(PoolError::InvalidConfig(format!(
                "pool kind '{kind}' already registered"
            )));
        }
        let pool = SmartConnectionPool::new(factory, config);
        pools.insert(
            kind,
            PoolEntry {
                pool,
                scaling,
                scaler: None,
            },
        );
        Ok(())
    }

    fn pool(&self, kind: &str) -> Result<SmartConnectionPool<T>, PoolError> {
        let pools = self.pools.read().unwrap();
        pools
            .get(kind)
            .map(|entry| entry.pool.clone())
            .ok_or_else(|| PoolError::InvalidConfig(format!("unknown pool kind '{kind}'")))
    }

    /// Warm every pool and spawn its health and scaling loops. Idempotent.
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let shutdown = self.shutdown.lock().unwrap();
            if shutdown.is_some() {
                return Ok(());
            }
        }
        let (tx, rx) = watch::channel(false);

        let to_warm: Vec<(String, SmartConnectionPool<T>)> = {
            let pools = self.pools.read().unwrap();
            pools
                .iter()
                .map(|(kind, entry)| (kind.clone(), entry.pool.clone()))
                .collect()
        };

        let mut tasks = Vec::new();
        for (kind, pool) in &to_warm {
            pool.initialize().await?;
            tasks.push(pool.spawn_health_loop(rx.clone()));
            info!(pool = %kind, "pool started");
        }

        // Scalers resize through set_target; the pool converges lazily.
        {
            let mut pools = self.pools.write().unwrap();
            for entry in pools.values_mut() {
                if let Some(config) = entry.scaling.clone() {
                    let pool = entry.pool.clone();
                    let (_, target) = pool.size();
                    let apply_pool = pool.clone();
                    let scaler = Arc::new(
                        AutoScalingManager::new(config, pool.metrics(), target)?.with_scale_fn(
                            Box::new(move |new_target| {
                                let pool = apply_pool.clone();
                                Box::pin(async move {
                                    pool.set_target(new_target);
                                })
                            }),
                        ),
                    );
                    entry.scaler = Some(Arc::clone(&scaler));
                    tasks.push(tokio::spawn(scaler.run(rx.clone())));
                }
            }
        }

        *self.tasks.lock().unwrap() = tasks;
        *self.shutdown.lock().unwrap() = Some(tx);
        Ok(())
    }

    /// Stop background loops and close every pool. Idempotent.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let tx = self.shutdown.lock().unwrap().take();
        let Some(tx) = tx else {
            return Ok(());
        };
        if tx.send(true).is_err() {
            warn!("all background loops already exited");
        }

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "background loop panicked");
                }
            }
        }

        let pools: Vec<SmartConnectionPool<T>> = {
            let mut pools = self.pools.write().unwrap();
            pools
                .values_mut()
                .map(|entry| {
                    entry.scaler = None;
                    entry.pool.clone()
                })
                .collect()
        };
        for pool in pools {
            pool.close().await?;
        }
        info!("pool manager stopped");
        Ok(())
    }

    /// Acquire a connection from the pool registered under `kind`
    pub async fn get_connection(&self, kind: &str) -> Result<SmartConnection<T>, PoolError> {
        self.pool(kind)?.acquire().await
    }

    /// Point-in-time stats snapshot per pool, JSON-serializable
    pub fn get_stats(&self) -> HashMap<String, PoolStats> {
        let pools = self.pools.read().unwrap();
        pools
            .iter()
            .map(|(kind, entry)| (kind.clone(), (*entry.pool.stats()).clone()))
            .collect()
    }

    /// Run an immediate health sweep on every pool, outside the timer
    pub async fn force_health_check(&self) -> HealthReport {
        let targets: Vec<(String, SmartConnectionPool<T>)> = {
            let pools = self.pools.read().unwrap();
            pools
                .iter()
                .map(|(kind, entry)| (kind.clone(), entry.pool.clone()))
                .collect()
        };

        let mut report = HealthReport::default();
        for (kind, pool) in targets {
            let sweep = pool.run_health_sweep().await;
            report.pools.insert(kind, sweep);
        }
        report
    }

    /// Scaling state per pool: sizes, load score, prediction, cooldowns
    pub fn scaling_metrics(&self) -> ManagerScalingReport {
        let pools = self.pools.read().unwrap();
        let mut report = ManagerScalingReport::default();
        for (kind, entry) in pools.iter() {
            let Some(ref scaler) = entry.scaler else {
                continue;
            };
            let (current, target) = entry.pool.size();
            report.pools.insert(
                kind.clone(),
                PoolScalingEntry {
                    current_size: current,
                    target_size: target,
                    report: scaler.report(),
                },
            );
        }
        report
    }
}
