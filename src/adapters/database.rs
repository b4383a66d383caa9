//! Database adapter — dialect-aware connection creation
//!
//! File-based SQLite-class backends get per-connection pragmas and a bounded
//! busy/locked retry loop. Server-class backends (Postgres, MySQL) rely on
//! driver-native pooling parameters and get no custom retry. Connection URLs
//! are redacted before they reach any log line.

use crate::adapters::retry::{retry_with_policy, RetryClassifier, RetryPolicy, SubstringClassifier};
use crate::error::{redact_credentials, PoolError};
use crate::pool::ConnectionFactory;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Backend families with different connection-tuning needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbDialect {
    /// File-based, single-writer (SQLite and compatibles)
    Sqlite,
    Postgres,
    Mysql,
    Other,
}

impl DbDialect {
    /// Detect the dialect from a connection URL scheme or file path
    pub fn from_url(url: &str) -> Self {
        let lower = url.to_lowercase();
        if lower.starts_with("sqlite:")
            || lower.ends_with(".db")
            || lower.ends_with(".sqlite")
            || lower.ends_with(".sqlite3")
        {
            DbDialect::Sqlite
        } else if lower.starts_with("postgres:") || lower.starts_with("postgresql:") {
            DbDialect::Postgres
        } else if lower.starts_with("mysql:") || lower.starts_with("mariadb:") {
            DbDialect::Mysql
        } else {
            DbDialect::Other
        }
    }

    /// File-based backends serialize writers and need busy retries
    pub fn is_file_based(&self) -> bool {
        matches!(self, DbDialect::Sqlite)
    }
}

/// Per-connection tuning applied to file-based backends
#[derive(Debug, Clone)]
pub struct SqliteTuning {
    pub busy_timeout: Duration,
    pub foreign_keys: bool,
    /// Write-ahead journaling, applied once per database file
    pub wal: bool,
}

impl Default for SqliteTuning {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            foreign_keys: true,
            wal: true,
        }
    }
}

impl SqliteTuning {
    fn pragmas(&self) -> Vec<String> {
        let mut out = vec![format!(
            "PRAGMA busy_timeout = {}",
            self.busy_timeout.as_millis()
        )];
        if self.foreign_keys {
            out.push("PRAGMA foreign_keys = ON".to_string());
        }
        if self.wal {
            out.push("PRAGMA journal_mode = WAL".to_string());
        }
        out
    }
}

/// Driver-native pooling parameters for server-class backends.
///
/// These are handed to the underlying driver at connect time; the adapter
/// adds no retry loop on top of them.
#[derive(Debug, Clone)]
pub struct ServerPoolOptions {
    pub pool_size: usize,
    pub max_overflow: usize,
    /// Recycle connections older than this to dodge server-side idle kills
    pub pool_recycle: Duration,
    /// Validate each connection with a ping before handing it out
    pub pre_ping: bool,
}

impl Default for ServerPoolOptions {
    fn default() -> Self {
        Self {
            pool_size: 10,
            max_overflow: 5,
            pool_recycle: Duration::from_secs(3600),
            pre_ping: true,
        }
    }
}

/// Operations the adapter needs from a concrete database handle.
///
/// The wire protocol itself lives in the driver; this trait is the narrow
/// seam the adapter tunes and probes through.
#[async_trait::async_trait]
pub trait DatabaseHandle: Send + Sync + 'static {
    /// Execute a single pragma or session-setup statement
    async fn apply_pragma(&mut self, pragma: &str) -> Result<(), PoolError>;

    /// One O(1) round trip, `SELECT 1` outside any transaction
    async fn ping(&self) -> bool;
}

/// Factory wrapper that detects the dialect, applies tuning, and retries
/// busy/locked creation errors for file-based backends only.
pub struct DatabaseConnectionFactory<H, F> {
    inner: F,
    url: String,
    dialect: DbDialect,
    tuning: SqliteTuning,
    server_options: ServerPoolOptions,
    retry: RetryPolicy,
    classifier: Arc<dyn RetryClassifier>,
    _handle: std::marker::PhantomData<fn() -> H>,
}

impl<H, F> DatabaseConnectionFactory<H, F>
where
    H: DatabaseHandle,
    F: ConnectionFactory<H>,
{
    pub fn new(inner: F, url: impl Into<String>) -> Self {
        let url = url.into();
        let dialect = DbDialect::from_url(&url);
        info!(
            url = %redact_credentials(&url),
            ?dialect,
            "database factory configured"
        );
        Self {
            inner,
            url,
            dialect,
            tuning: SqliteTuning::default(),
            server_options: ServerPoolOptions::default(),
            retry: RetryPolicy::default(),
            classifier: Arc::new(SubstringClassifier::new(vec![
                "database is locked",
                "database table is locked",
                "busy",
            ])),
            _handle: std::marker::PhantomData,
        }
    }

    pub fn with_tuning(mut self, tuning: SqliteTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Driver-native pooling parameters for server-class backends
    pub fn with_server_options(mut self, options: ServerPoolOptions) -> Self {
        self.server_options = options;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the busy/locked classifier, e.g. with one keyed on a
    /// driver's structured error codes.
    pub fn with_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn dialect(&self) -> DbDialect {
        self.dialect
    }

    async fn create_tuned(&self) -> Result<H, PoolError> {
        let mut conn = self.inner.create().await?;
        if self.dialect.is_file_based() {
            for pragma in self.tuning.pragmas() {
                conn.apply_pragma(&pragma).await?;
            }
            debug!(url = %redact_credentials(&self.url), "session pragmas applied");
        }
        Ok(conn)
    }
}

#[async_trait::async_trait]
impl<H, F> ConnectionFactory<H> for DatabaseConnectionFactory<H, F>
where
    H: DatabaseHandle,
    F: ConnectionFactory<H>,
{
    async fn create(&self) -> Result<H, PoolError> {
        if self.dialect.is_file_based() {
            retry_with_policy(&self.retry, self.classifier.as_ref(), "db-connect", || {
                self.create_tuned()
            })
            .await
        } else {
            // Server-class backends lean on driver pooling, no retry here.
            self.create_tuned().await
        }
    }

    async fn is_healthy(&self, conn: &H) -> bool {
        // Server-class backends can opt out of the pre-handout ping and
        // trust pool_recycle to weed out stale connections.
        if !self.dialect.is_file_based() && !self.server_options.pre_ping {
            return true;
        }
        conn.ping().await
    }

    async fn close(&self, conn: H) {
        self.inner.close(conn).await;
    }
}
