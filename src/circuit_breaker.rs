//! Circuit breaker for failure isolation
//!
//! Three states:
//! - Closed: requests pass through, consecutive failures are counted
//! - Open: requests fail fast with [`PoolError::CircuitOpen`], no backend call
//! - HalfOpen: exactly one probe request is admitted to test recovery
//!
//! The Open → HalfOpen transition happens lazily at call time once the
//! recovery timeout has elapsed; no timer task is involved. The transition
//! and the probe-slot claim are a single critical section under the breaker's
//! mutex, so two racing callers can never both be admitted as the probe.

use crate::error::PoolError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Public view of the breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through normally
    Closed,
    /// Requests fail immediately
    Open,
    /// A single probe is testing recovery
    HalfOpen,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: usize,
    /// How long the circuit stays open before admitting a probe
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { probing: bool },
}

#[derive(Debug)]
struct BreakerState {
    state: State,
    consecutive_failures: usize,
    last_failure: Option<Instant>,
}

/// Permit returned by [`CircuitBreaker::try_acquire`].
///
/// The holder must report the outcome via [`CircuitBreaker::on_success`] or
/// [`CircuitBreaker::on_failure`]. Dropping an unreported permit releases the
/// half-open probe slot without counting either way, so a cancelled probe
/// does not wedge the breaker.
#[derive(Debug)]
pub struct Permit {
    half_open: bool,
    state: Arc<Mutex<BreakerState>>,
    reported: bool,
}

impl Permit {
    /// Whether this permit is the single half-open probe
    pub fn is_probe(&self) -> bool {
        self.half_open
    }

    fn mark_reported(&mut self) {
        self.reported = true;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.reported || !self.half_open {
            return;
        }
        // Probe abandoned: free the slot so the next caller may probe.
        let mut state = self.state.lock().unwrap();
        if let State::HalfOpen { probing: true } = state.state {
            state.state = State::HalfOpen { probing: false };
        }
    }
}

/// Failure-isolating state machine guarding one logical connection class.
///
/// Each breaker has its own mutex, independent of any pool lock, so unrelated
/// pools are never serialized behind one another.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState {
                state: State::Closed,
                consecutive_failures: 0,
                last_failure: None,
            })),
        }
    }

    pub fn new_default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Current state of the breaker
    pub fn state(&self) -> CircuitState {
        match self.state.lock().unwrap().state {
            State::Closed => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Current consecutive failure count
    pub fn failure_count(&self) -> usize {
        self.state.lock().unwrap().consecutive_failures
    }

    /// When the last counted failure happened
    pub fn last_failure_at(&self) -> Option<Instant> {
        self.state.lock().unwrap().last_failure
    }

    /// Force the breaker back to closed
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.state = State::Closed;
        state.consecutive_failures = 0;
        state.last_failure = None;
    }

    /// Request admission. Fails fast with [`PoolError::CircuitOpen`] when the
    /// circuit is open or another probe is already in flight.
    pub fn try_acquire(&self) -> Result<Permit, PoolError> {
        let mut state = self.state.lock().unwrap();

        let half_open = match state.state {
            State::Closed => false,
            State::Open { opened_at } => {
                if opened_at.elapsed() > self.config.recovery_timeout {
                    // Claim the probe slot before releasing the lock.
                    state.state = State::HalfOpen { probing: true };
                    debug!("circuit transitioning to half-open, admitting probe");
                    true
                } else {
                    return Err(PoolError::CircuitOpen);
                }
            }
            State::HalfOpen { probing } => {
                if probing {
                    return Err(PoolError::CircuitOpen);
                }
                state.state = State::HalfOpen { probing: true };
                true
            }
        };

        Ok(Permit {
            half_open,
            state: Arc::clone(&self.state),
            reported: false,
        })
    }

    /// Report a successful call made under `permit`
    pub fn on_success(&self, mut permit: Permit) {
        permit.mark_reported();
        let mut state = self.state.lock().unwrap();

        if permit.half_open {
            debug!("half-open probe succeeded, closing circuit");
        }
        state.state = State::Closed;
        state.consecutive_failures = 0;
    }

    /// Report a failed call made under `permit`
    pub fn on_failure(&self, mut permit: Permit) {
        permit.mark_reported();
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.last_failure = Some(now);

        if permit.half_open {
            debug!("half-open probe failed, reopening circuit");
            state.state = State::Open { opened_at: now };
            return;
        }

        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.failure_threshold {
            debug!(
                failures = state.consecutive_failures,
                "failure threshold reached, opening circuit"
            );
            state.state = State::Open { opened_at: now };
        }
    }

    /// Execute an operation under breaker protection.
    ///
    /// Failures only count against the breaker when the error classifies as
    /// breaker-tripping (backend health, not local pool state).
    pub async fn call<F, Fut, T>(&self, op: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, PoolError>>,
    {
        let permit = self.try_acquire()?;

        match op().await {
            Ok(value) => {
                self.on_success(permit);
                Ok(value)
            }
            Err(e) => {
                if e.should_trip_breaker() {
                    self.on_failure(permit);
                }
                // Non-tripping errors drop the permit, releasing the probe slot.
                Err(e)
            }
        }
    }
}
