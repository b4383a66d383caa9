//! Backend adapters
//!
//! Each adapter wraps a caller-supplied [`ConnectionFactory`] for one backend
//! family and contributes the backend-specific pieces: dialect tuning and
//! busy retries for databases, client limits for HTTP, ping validation for
//! Redis. Retry policy is pluggable per adapter through
//! [`retry::RetryClassifier`].
//!
//! [`ConnectionFactory`]: crate::pool::ConnectionFactory

pub mod database;
pub mod http;
pub mod redis;
pub mod retry;

pub use database::{DatabaseConnectionFactory, DatabaseHandle, DbDialect, ServerPoolOptions, SqliteTuning};
pub use http::{HttpConnectionFactory, HttpHandle, HttpPoolConfig};
pub use redis::{RedisConnectionFactory, RedisHandle, RedisPoolConfig};
pub use retry::{retry_with_policy, RetryClassifier, RetryPolicy, SubstringClassifier, TransientClassifier};
