//! HTTP adapter — pooled-client limits and per-call timeouts
//!
//! Wraps an opaque HTTP client handle; protocol semantics stay in the
//! caller's client. The adapter contributes connection limits, idle expiry,
//! and a connect-timeout guard around creation.

use crate::error::PoolError;
use crate::pool::{ConnectionFactory, PoolConfig};
use std::time::Duration;
use tracing::debug;

/// Connection limits and per-call timeouts for a pooled HTTP client
#[derive(Debug, Clone)]
pub struct HttpPoolConfig {
    pub max_connections: usize,
    pub max_idle_connections: usize,
    /// Idle connections older than this are dropped
    pub idle_expiry: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Bound on waiting for a pooled connection
    pub pool_timeout: Duration,
}

impl Default for HttpPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_idle_connections: 10,
            idle_expiry: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            pool_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpPoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be positive".to_string(),
            ));
        }
        if self.max_idle_connections > self.max_connections {
            return Err(PoolError::InvalidConfig(
                "max_idle_connections cannot exceed max_connections".to_string(),
            ));
        }
        Ok(())
    }

    /// Map the HTTP limits onto a generic pool configuration
    pub fn to_pool_config(&self, name: impl Into<String>) -> PoolConfig {
        PoolConfig {
            name: name.into(),
            min_size: self.max_idle_connections.min(2),
            max_size: self.max_connections,
            idle_timeout: Some(self.idle_expiry),
            connect_timeout: self.connect_timeout,
            acquire_timeout: self.pool_timeout,
            ..PoolConfig::default()
        }
    }
}

/// Operations the adapter needs from a concrete HTTP client handle
#[async_trait::async_trait]
pub trait HttpHandle: Send + Sync + 'static {
    /// One lightweight round trip (HEAD or equivalent) to the origin
    async fn probe(&self) -> bool;
}

/// Factory wrapper applying [`HttpPoolConfig`] limits around an inner client
/// factory.
pub struct HttpConnectionFactory<H, F> {
    inner: F,
    config: HttpPoolConfig,
    _handle: std::marker::PhantomData<fn() -> H>,
}

impl<H, F> HttpConnectionFactory<H, F>
where
    H: HttpHandle,
    F: ConnectionFactory<H>,
{
    pub fn new(inner: F, config: HttpPoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            inner,
            config,
            _handle: std::marker::PhantomData,
        })
    }

    pub fn config(&self) -> &HttpPoolConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl<H, F> ConnectionFactory<H> for HttpConnectionFactory<H, F>
where
    H: HttpHandle,
    F: ConnectionFactory<H>,
{
    async fn create(&self) -> Result<H, PoolError> {
        match tokio::time::timeout(self.config.connect_timeout, self.inner.create()).await {
            Ok(Ok(conn)) => {
                debug!("http client connection established");
                Ok(conn)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PoolError::Timeout(self.config.connect_timeout)),
        }
    }

    async fn is_healthy(&self, conn: &H) -> bool {
        conn.probe().await
    }

    async fn close(&self, conn: H) {
        self.inner.close(conn).await;
    }
}
