//! Perigee: Adaptive connection pooling with circuit breaking and auto-scaling
//!
//! # Overview
//!
//! This crate provides a self-tuning connection-pool core for backends that
//! hand out opaque connection handles. It includes:
//!
//! - **Connection Pool**: Bounded, semaphore-gated reuse with health checks
//! - **Smart Pool**: Lifecycle-aware records, FIFO waiters, breaker-guarded acquire
//! - **Circuit Breaker**: Fail-fast protection with a single half-open probe
//! - **Auto-Scaling**: Load-score-driven target sizing with cooldown hysteresis
//! - **Backend Adapters**: Dialect-aware database tuning, HTTP client limits,
//!   Redis ping validation, pluggable retry classification
//! - **Pool Manager**: Explicit registry with idempotent start/stop lifecycle
//!
//! # Key Principles
//!
//! This crate is **pure pooling logic** with zero knowledge of:
//! - Wire protocols (SQL, RESP, HTTP semantics)
//! - Storage engines or query layers
//! - Application-specific concerns
//!
//! Backends plug in through a [`ConnectionFactory`] per connection kind; the
//! pool never inspects the handles it manages.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │ get_connection(kind)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Pool Manager                      │  ← Registry + lifecycle
//! │  (start/stop, stats, health, scaling)   │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker                   │  ← Fail-fast protection
//! │  (per connection class, single probe)   │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Smart Connection Pool             │  ← Lifecycle-aware reuse
//! │  (records, FIFO waiters, retirement)    │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Backend Adapter                   │  ← Dialect tuning + retry
//! │  (database / http / redis factory)      │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External Backend
//!
//!  Continuously running:
//!   Health Loop   → probe, retire, re-warm
//!   Scaling Loop  → load score → target size
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use perigee::{PoolError, PoolManager, SmartPoolConfig};
//! use perigee::pool::ConnectionFactory;
//! use std::sync::Arc;
//!
//! struct MyConnection;
//! struct MyFactory;
//!
//! #[async_trait::async_trait]
//! impl ConnectionFactory<MyConnection> for MyFactory {
//!     async fn create(&self) -> Result<MyConnection, PoolError> {
//! #       Ok(MyConnection)
//!     }
//!
//!     async fn is_healthy(&self, _conn: &MyConnection) -> bool {
//!         true
//!     }
//! }
//!
//! # async fn example() -> Result<(), PoolError> {
//! let manager = PoolManager::new();
//! manager.register("db", Arc::new(MyFactory), SmartPoolConfig::default(), None)?;
//! manager.start().await?;
//!
//! let conn = manager.get_connection("db").await?;
//! // Use the handle; dropping it returns it to the pool.
//! drop(conn);
//!
//! manager.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod circuit_breaker;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod scaling;
pub mod smart;
pub mod stats;

// Re-export main types for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use error::PoolError;
pub use manager::{HealthReport, ManagerScalingReport, PoolManager};
pub use metrics::{LoadMetrics, LoadSnapshot};
pub use pool::{ConnectionFactory, ConnectionPool, PoolConfig};
pub use scaling::{AutoScalingConfig, AutoScalingManager, ScaleDecision, ScalingMode, ScalingReport};
pub use smart::{HealthSweep, SmartConnection, SmartConnectionPool, SmartPoolConfig};
pub use stats::PoolStats;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use perigee::prelude::*;
/// ```
pub mod prelude {
    pub use super::adapters::{
        DatabaseConnectionFactory, HttpConnectionFactory, RedisConnectionFactory, RetryPolicy,
    };
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use super::error::PoolError;
    pub use super::manager::PoolManager;
    pub use super::pool::{ConnectionFactory, ConnectionPool, PoolConfig};
    pub use super::scaling::{AutoScalingConfig, AutoScalingManager, ScalingMode};
    pub use super::smart::{SmartConnection, SmartConnectionPool, SmartPoolConfig};
    pub use super::stats::PoolStats;
}
