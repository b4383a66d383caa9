//! Bounded retry with exponential backoff and jitter
//!
//! Retry lives in the adapter layer only: transient backend-busy errors are
//! retried here, while breaker and exhaustion errors surface to the caller
//! untouched. Which errors count as retryable is decided by a pluggable
//! [`RetryClassifier`], so each backend can bring its own error codes.

use crate::error::PoolError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for transient backend errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the initial try
    pub max_retries: u32,
    /// Base delay before the first retry
    pub base_delay: Duration,
    /// Cap applied after exponential growth
    pub max_delay: Duration,
    /// Proportional jitter added to each delay (0.0 disables)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): exponential, capped,
    /// with proportional jitter.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        if self.jitter_factor <= 0.0 {
            return capped;
        }
        let jitter = rand::rng().random_range(0.0..self.jitter_factor);
        capped.mul_f64(1.0 + jitter)
    }
}

/// Decides which errors are worth retrying for a given backend.
pub trait RetryClassifier: Send + Sync {
    fn is_retryable(&self, err: &PoolError) -> bool;
}

/// Classifier driven by message substrings, used as the fallback when a
/// backend exposes no structured error codes.
#[derive(Debug, Clone)]
pub struct SubstringClassifier {
    patterns: Vec<&'static str>,
}

impl SubstringClassifier {
    pub fn new(patterns: Vec<&'static str>) -> Self {
        Self { patterns }
    }
}

impl RetryClassifier for SubstringClassifier {
    fn is_retryable(&self, err: &PoolError) -> bool {
        if !err.is_transient() && !matches!(err, PoolError::CreateFailed { .. }) {
            return false;
        }
        let message = err.to_string().to_lowercase();
        self.patterns.iter().any(|p| message.contains(p))
    }
}

/// Default classifier: anything the error taxonomy marks transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransientClassifier;

impl RetryClassifier for TransientClassifier {
    fn is_retryable(&self, err: &PoolError) -> bool {
        err.is_transient()
    }
}

/// Run `op` with bounded retries. Errors the classifier rejects surface
/// immediately; retryable ones are retried up to `policy.max_retries` times
/// and the last error is returned once attempts are exhausted.
pub async fn retry_with_policy<T, F, Fut, C>(
    policy: &RetryPolicy,
    classifier: &C,
    operation: &str,
    mut op: F,
) -> Result<T, PoolError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PoolError>>,
    C: RetryClassifier + ?Sized,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_retries && classifier.is_retryable(&err) => {
                attempt += 1;
                let delay = policy.calculate_delay(attempt);
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if attempt > 0 {
                    warn!(operation, attempts = attempt + 1, error = %err, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
