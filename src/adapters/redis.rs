//! Redis adapter — ping-validated connections
//!
//! The wire protocol stays in the caller's client; the adapter validates
//! fresh connections with a PING and bounds both the connect and the probe
//! round trip.

use crate::error::PoolError;
use crate::pool::ConnectionFactory;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RedisPoolConfig {
    pub connect_timeout: Duration,
    /// Bound on the PING round trip during health checks
    pub ping_timeout: Duration,
    /// Validate new connections with a PING before first use
    pub validate_on_create: bool,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(2),
            validate_on_create: true,
        }
    }
}

/// Operations the adapter needs from a concrete Redis client handle
#[async_trait::async_trait]
pub trait RedisHandle: Send + Sync + 'static {
    /// One PING round trip
    async fn ping(&self) -> bool;
}

/// Factory wrapper that bounds creation and probes with PING.
pub struct RedisConnectionFactory<H, F> {
    inner: F,
    config: RedisPoolConfig,
    _handle: std::marker::PhantomData<fn() -> H>,
}

impl<H, F> RedisConnectionFactory<H, F>
where
    H: RedisHandle,
    F: ConnectionFactory<H>,
{
    pub fn new(inner: F, config: RedisPoolConfig) -> Self {
        Self {
            inner,
            config,
            _handle: std::marker::PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<H, F> ConnectionFactory<H> for RedisConnectionFactory<H, F>
where
    H: RedisHandle,
    F: ConnectionFactory<H>,
{
    async fn create(&self) -> Result<H, PoolError> {
        let conn = match tokio::time::timeout(self.config.connect_timeout, self.inner.create())
            .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(PoolError::Timeout(self.config.connect_timeout)),
        };

        if self.config.validate_on_create && !self.is_healthy(&conn).await {
            self.inner.close(conn).await;
            return Err(PoolError::HealthCheckFailed(
                "redis connection failed initial ping".to_string(),
            ));
        }
        debug!("redis connection established");
        Ok(conn)
    }

    async fn is_healthy(&self, conn: &H) -> bool {
        matches!(
            tokio::time::timeout(self.config.ping_timeout, conn.ping()).await,
            Ok(true)
        )
    }

    async fn close(&self, conn: H) {
        self.inner.close(conn).await;
    }
}
