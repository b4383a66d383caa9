//! Auto-scaling manager — load-score-driven pool resizing
//!
//! Reads the shared [`LoadMetrics`] signals, folds them into a single load
//! score in [0, 1], and emits scaling decisions with cooldown hysteresis.
//! The actual resize is performed through a callback; the manager only ever
//! changes the target size and never touches connection records.

use crate::error::PoolError;
use crate::metrics::{LoadMetrics, LoadSnapshot};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Load samples retained for trend extrapolation
const TREND_WINDOW: usize = 10;

/// How a scale-up is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingMode {
    /// Fixed-step changes
    Gradual,
    /// Multiplicative changes for spiky load
    Burst,
}

/// Configuration for scaling decisions.
///
/// Invariant: `scale_down_threshold < scale_up_threshold`.
#[derive(Debug, Clone)]
pub struct AutoScalingConfig {
    /// Load score above which the pool grows
    pub scale_up_threshold: f64,
    /// Load score below which the pool shrinks
    pub scale_down_threshold: f64,
    /// Step size in gradual mode
    pub scale_step: usize,
    /// Multiplier in burst mode
    pub scale_factor: f64,
    pub mode: ScalingMode,
    /// Floor for the target size
    pub min_connections: usize,
    /// Ceiling for the target size
    pub max_connections: usize,
    /// Minimum time between scale-ups
    pub scale_up_cooldown: Duration,
    /// Minimum time between scale-downs
    pub scale_down_cooldown: Duration,
    /// Cadence of the evaluation loop
    pub evaluation_interval: Duration,
}

impl Default for AutoScalingConfig {
    fn default() -> Self {
        Self {
            scale_up_threshold: 0.75,
            scale_down_threshold: 0.25,
            scale_step: 2,
            scale_factor: 1.5,
            mode: ScalingMode::Gradual,
            min_connections: 2,
            max_connections: 20,
            scale_up_cooldown: Duration::from_secs(30),
            scale_down_cooldown: Duration::from_secs(120),
            evaluation_interval: Duration::from_secs(10),
        }
    }
}

impl AutoScalingConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(PoolError::InvalidConfig(format!(
                "scale_down_threshold ({}) must be below scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        if self.min_connections == 0 || self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfig(
                "connection bounds must satisfy 0 < min <= max".to_string(),
            ));
        }
        Ok(())
    }
}

/// A scaling decision for one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Resize the pool target to the given size
    ScaleTo(usize),
    /// No change needed
    NoChange,
}

/// Callback invoked with the new target size when a decision fires
pub type ScaleCallback = Box<dyn Fn(usize) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

#[derive(Debug)]
struct ScaleState {
    current_target: usize,
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
    load_history: VecDeque<f64>,
    scale_up_events: u64,
    scale_down_events: u64,
}

/// Point-in-time scaling report, JSON-serializable.
#[derive(Debug, Clone, Serialize)]
pub struct ScalingReport {
    pub current_target: usize,
    pub load_score: f64,
    pub predicted_load: Option<f64>,
    pub scale_up_events: u64,
    pub scale_down_events: u64,
    /// Seconds until the next scale-up is permitted (zero when ready)
    pub scale_up_cooldown_remaining_secs: f64,
    /// Seconds until the next scale-down is permitted (zero when ready)
    pub scale_down_cooldown_remaining_secs: f64,
}

/// Periodically evaluates load and emits resize directives.
pub struct AutoScalingManager {
    config: AutoScalingConfig,
    metrics: Arc<LoadMetrics>,
    state: Mutex<ScaleState>,
    scale_fn: Option<ScaleCallback>,
}

impl AutoScalingManager {
    pub fn new(
        config: AutoScalingConfig,
        metrics: Arc<LoadMetrics>,
        initial_target: usize,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let initial = initial_target.clamp(config.min_connections, config.max_connections);
        Ok(Self {
            config,
            metrics,
            state: Mutex::new(ScaleState {
                current_target: initial,
                last_scale_up: None,
                last_scale_down: None,
                load_history: VecDeque::with_capacity(TREND_WINDOW),
                scale_up_events: 0,
                scale_down_events: 0,
            }),
            scale_fn: None,
        })
    }

    /// Set the callback used to apply new target sizes
    pub fn with_scale_fn(mut self, f: ScaleCallback) -> Self {
        self.scale_fn = Some(f);
        self
    }

    fn desired_up(&self, current: usize) -> usize {
        let desired = match self.config.mode {
            ScalingMode::Gradual => current + self.config.scale_step,
            ScalingMode::Burst => {
                ((current as f64) * self.config.scale_factor).ceil() as usize
            }
        };
        desired.min(self.config.max_connections)
    }

    fn desired_down(&self, current: usize) -> usize {
        let desired = match self.config.mode {
            ScalingMode::Gradual => current.saturating_sub(self.config.scale_step),
            ScalingMode::Burst => {
                ((current as f64) / self.config.scale_factor).floor() as usize
            }
        };
        desired.max(self.config.min_connections)
    }

    /// Evaluate the current load and decide whether to resize.
    ///
    /// At most one change per cooldown window in each direction; an
    /// oscillating load score cannot flap the pool size faster than the
    /// cooldowns allow.
    pub fn evaluate(&self) -> ScaleDecision {
        let snapshot = self.metrics.snapshot();
        let score = snapshot.load_score();
        let now = Instant::now();

        let mut state = self.state.lock().unwrap();

        if state.load_history.len() >= TREND_WINDOW {
            state.load_history.pop_front();
        }
        state.load_history.push_back(score);

        // Predictive trend is advisory only; it never bypasses a cooldown.
        if let Some(predicted) = predict_load(&state.load_history) {
            if predicted > self.config.scale_up_threshold && score <= self.config.scale_up_threshold
            {
                warn!(
                    load_score = score,
                    predicted_load = predicted,
                    "load trending toward scale-up threshold"
                );
            }
        }

        let current = state.current_target;

        if score > self.config.scale_up_threshold {
            let cooled = state
                .last_scale_up
                .map(|t| now.duration_since(t) >= self.config.scale_up_cooldown)
                .unwrap_or(true);
            let desired = self.desired_up(current);
            if cooled && desired > current {
                state.last_scale_up = Some(now);
                state.current_target = desired;
                state.scale_up_events += 1;
                debug!(
                    from = current,
                    to = desired,
                    load_score = score,
                    "scaling up"
                );
                return ScaleDecision::ScaleTo(desired);
            }
        } else if score < self.config.scale_down_threshold {
            let cooled = state
                .last_scale_down
                .map(|t| now.duration_since(t) >= self.config.scale_down_cooldown)
                .unwrap_or(true);
            let desired = self.desired_down(current);
            if cooled && desired < current {
                state.last_scale_down = Some(now);
                state.current_target = desired;
                state.scale_down_events += 1;
                debug!(
                    from = current,
                    to = desired,
                    load_score = score,
                    "scaling down"
                );
                return ScaleDecision::ScaleTo(desired);
            }
        }

        ScaleDecision::NoChange
    }

    /// Evaluate and apply the decision through the callback, if any
    pub async fn evaluate_and_apply(&self) -> ScaleDecision {
        let decision = self.evaluate();
        if let ScaleDecision::ScaleTo(target) = decision {
            if let Some(ref scale_fn) = self.scale_fn {
                scale_fn(target).await;
            }
        }
        decision
    }

    /// Current report: target, score, prediction, cooldown remainders
    pub fn report(&self) -> ScalingReport {
        let snapshot: LoadSnapshot = self.metrics.snapshot();
        let state = self.state.lock().unwrap();
        let now = Instant::now();

        let remaining = |last: Option<Instant>, cooldown: Duration| -> f64 {
            last.map(|t| {
                cooldown
                    .saturating_sub(now.duration_since(t))
                    .as_secs_f64()
            })
            .unwrap_or(0.0)
        };

        ScalingReport {
            current_target: state.current_target,
            load_score: snapshot.load_score(),
            predicted_load: predict_load(&state.load_history),
            scale_up_events: state.scale_up_events,
            scale_down_events: state.scale_down_events,
            scale_up_cooldown_remaining_secs: remaining(
                state.last_scale_up,
                self.config.scale_up_cooldown,
            ),
            scale_down_cooldown_remaining_secs: remaining(
                state.last_scale_down,
                self.config.scale_down_cooldown,
            ),
        }
    }

    /// Run the evaluation loop until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.evaluation_interval.as_secs(),
            "auto-scaling manager started"
        );
        let mut ticker = tokio::time::interval(self.config.evaluation_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate_and_apply().await;
                }
                _ = shutdown.changed() => {
                    info!("auto-scaling manager shutting down");
                    break;
                }
            }
        }
    }
}

/// Linear trend extrapolation over the load history: least-squares slope
/// projected one sample ahead. Needs at least three samples.
fn predict_load(history: &VecDeque<f64>) -> Option<f64> {
    let n = history.len();
    if n < 3 {
        return None;
    }

    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y: f64 = history.iter().sum::<f64>() / nf;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in history.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        return None;
    }

    let slope = num / den;
    let next = mean_y + slope * (nf - mean_x);
    Some(next.clamp(0.0, 1.0))
}
