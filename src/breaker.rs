// =============================================================================
// Circuit Breaker Registry — per-strategy CLOSED / OPEN / HALF_OPEN guards
// =============================================================================
//
// State machine per strategy:
//
//   CLOSED    — executing normally; consecutive failures trip to OPEN.
//   OPEN      — failing fast until now >= next_retry_time, then HALF_OPEN.
//   HALF_OPEN — probing; enough successes close, one failure reopens with
//               exponentially grown backoff (capped at max_backoff_ms).
//
// All transitions for a given strategy are serialized through the registry
// lock, so canExecute / recordSuccess / recordFailure are linearizable per
// key. State-change callbacks fire after the lock is released.
// =============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::runtime_config::BotConfig;

/// Most recent errors retained per breaker.
const MAX_RECENT_ERRORS: usize = 10;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Tunables for every breaker in the registry.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before tripping.
    pub failure_threshold: u32,
    /// Base OPEN duration in milliseconds.
    pub timeout_ms: u64,
    /// Backoff multiplier applied per reopen.
    pub backoff_base: u32,
    /// Cap on the grown OPEN duration.
    pub max_backoff_ms: u64,
    /// Successes required in HALF_OPEN to close.
    pub half_open_attempts: u32,
    /// Soft registry size cap; exceeding it warns but still creates.
    pub max_breakers: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_ms: 30_000,
            backoff_base: 2,
            max_backoff_ms: 300_000,
            half_open_attempts: 3,
            max_breakers: 50,
        }
    }
}

impl From<&BotConfig> for BreakerConfig {
    fn from(cfg: &BotConfig) -> Self {
        Self {
            failure_threshold: cfg.failure_threshold,
            timeout_ms: cfg.breaker_timeout_ms,
            backoff_base: cfg.backoff_base,
            max_backoff_ms: cfg.max_backoff_ms,
            half_open_attempts: cfg.half_open_attempts,
            max_breakers: cfg.max_breakers,
        }
    }
}

/// Snapshot of one breaker's state.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerState {
    pub status: BreakerStatus,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<u64>,
    pub last_success_time: Option<u64>,
    pub next_retry_time: Option<u64>,
    pub recovery_attempts: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub recent_errors: Vec<String>,
}

/// Derived metrics; cached and invalidated on every state mutation.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub status: BreakerStatus,
    pub failure_rate: f64,
    pub time_in_state_ms: u64,
    pub recovery_attempts: u32,
}

// ---------------------------------------------------------------------------
// Internal record
// ---------------------------------------------------------------------------

struct Breaker {
    status: BreakerStatus,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<u64>,
    last_success_time: Option<u64>,
    next_retry_time: Option<u64>,
    recovery_attempts: u32,
    total_failures: u64,
    total_successes: u64,
    recent_errors: VecDeque<String>,
    state_since_ms: u64,
}

impl Breaker {
    fn new(now: u64) -> Self {
        Self {
            status: BreakerStatus::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_success_time: None,
            next_retry_time: None,
            recovery_attempts: 0,
            total_failures: 0,
            total_successes: 0,
            recent_errors: VecDeque::new(),
            state_since_ms: now,
        }
    }

    fn snapshot(&self) -> BreakerState {
        BreakerState {
            status: self.status,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_time: self.last_failure_time,
            last_success_time: self.last_success_time,
            next_retry_time: self.next_retry_time,
            recovery_attempts: self.recovery_attempts,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            recent_errors: self.recent_errors.iter().cloned().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type StateChangeCallback = Arc<dyn Fn(&str, BreakerStatus, BreakerStatus) + Send + Sync>;

pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<String, Breaker>>,
    metrics_cache: Mutex<HashMap<String, BreakerMetrics>>,
    callbacks: RwLock<Vec<(u64, StateChangeCallback)>>,
    next_callback_id: AtomicU64,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            breakers: Mutex::new(HashMap::new()),
            metrics_cache: Mutex::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            next_callback_id: AtomicU64::new(1),
        }
    }

    /// OPEN duration for the given reopen count: timeout * base^attempts,
    /// capped at `max_backoff_ms`.
    fn open_duration_ms(&self, recovery_attempts: u32) -> u64 {
        let factor = (self.config.backoff_base as u64)
            .checked_pow(recovery_attempts)
            .unwrap_or(u64::MAX);
        self.config
            .timeout_ms
            .saturating_mul(factor)
            .min(self.config.max_backoff_ms)
    }

    fn fire_state_change(&self, strategy_id: &str, from: BreakerStatus, to: BreakerStatus) {
        let callbacks: Vec<StateChangeCallback> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(strategy_id, from, to);
        }
    }

    fn invalidate_metrics(&self, strategy_id: &str) {
        self.metrics_cache.lock().remove(strategy_id);
    }

    /// Look up or create the breaker for `strategy_id`, warning past the soft
    /// cap.
    fn touch<'a>(
        &self,
        breakers: &'a mut HashMap<String, Breaker>,
        strategy_id: &str,
        now: u64,
    ) -> &'a mut Breaker {
        if !breakers.contains_key(strategy_id) {
            if breakers.len() >= self.config.max_breakers {
                warn!(
                    strategy_id,
                    count = breakers.len(),
                    max = self.config.max_breakers,
                    "breaker registry over soft cap — creating anyway"
                );
            }
            debug!(strategy_id, "breaker created (CLOSED)");
            breakers.insert(strategy_id.to_string(), Breaker::new(now));
        }
        breakers.get_mut(strategy_id).expect("just inserted")
    }

    // -------------------------------------------------------------------------
    // Gate
    // -------------------------------------------------------------------------

    /// Whether the strategy may execute right now. An OPEN breaker whose
    /// retry window has elapsed transitions to HALF_OPEN and allows the
    /// attempt.
    pub fn can_execute(&self, strategy_id: &str) -> bool {
        let now = self.clock.now_ms();
        let mut transition: Option<(BreakerStatus, BreakerStatus)> = None;

        let allowed = {
            let mut breakers = self.breakers.lock();
            let breaker = self.touch(&mut breakers, strategy_id, now);

            match breaker.status {
                BreakerStatus::Closed => true,
                BreakerStatus::HalfOpen => true,
                BreakerStatus::Open => {
                    let retry_at = breaker.next_retry_time.unwrap_or(now);
                    if now >= retry_at {
                        transition = Some((BreakerStatus::Open, BreakerStatus::HalfOpen));
                        breaker.status = BreakerStatus::HalfOpen;
                        breaker.success_count = 0;
                        breaker.state_since_ms = now;
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            info!(strategy_id, from = %from, to = %to, "breaker entering half-open probe");
            self.invalidate_metrics(strategy_id);
            self.fire_state_change(strategy_id, from, to);
        }
        allowed
    }

    // -------------------------------------------------------------------------
    // Outcome recording
    // -------------------------------------------------------------------------

    pub fn record_success(&self, strategy_id: &str) {
        let now = self.clock.now_ms();
        let mut transition: Option<(BreakerStatus, BreakerStatus)> = None;

        {
            let mut breakers = self.breakers.lock();
            let breaker = self.touch(&mut breakers, strategy_id, now);

            breaker.total_successes += 1;
            breaker.last_success_time = Some(now);

            match breaker.status {
                BreakerStatus::Closed => {
                    breaker.failure_count = 0;
                    breaker.success_count += 1;
                }
                BreakerStatus::HalfOpen => {
                    breaker.success_count += 1;
                    if breaker.success_count >= self.config.half_open_attempts {
                        transition = Some((BreakerStatus::HalfOpen, BreakerStatus::Closed));
                        breaker.status = BreakerStatus::Closed;
                        breaker.failure_count = 0;
                        breaker.recovery_attempts = 0;
                        breaker.next_retry_time = None;
                        breaker.state_since_ms = now;
                    }
                }
                // A success while OPEN only bumps totals; the gate stays shut
                // until the retry window elapses.
                BreakerStatus::Open => {}
            }
        }

        self.invalidate_metrics(strategy_id);
        if let Some((from, to)) = transition {
            info!(strategy_id, from = %from, to = %to, "breaker recovered");
            self.fire_state_change(strategy_id, from, to);
        }
    }

    pub fn record_failure(&self, strategy_id: &str, error: &str) {
        let now = self.clock.now_ms();
        let mut transition: Option<(BreakerStatus, BreakerStatus)> = None;

        {
            let mut breakers = self.breakers.lock();
            let breaker = self.touch(&mut breakers, strategy_id, now);

            breaker.total_failures += 1;
            breaker.last_failure_time = Some(now);
            breaker.recent_errors.push_back(error.to_string());
            while breaker.recent_errors.len() > MAX_RECENT_ERRORS {
                breaker.recent_errors.pop_front();
            }

            match breaker.status {
                BreakerStatus::Closed => {
                    breaker.failure_count += 1;
                    if breaker.failure_count >= self.config.failure_threshold {
                        transition = Some((BreakerStatus::Closed, BreakerStatus::Open));
                        breaker.status = BreakerStatus::Open;
                        breaker.success_count = 0;
                        breaker.recovery_attempts = 0;
                        breaker.next_retry_time = Some(now + self.open_duration_ms(0));
                        breaker.state_since_ms = now;
                    }
                }
                BreakerStatus::HalfOpen => {
                    transition = Some((BreakerStatus::HalfOpen, BreakerStatus::Open));
                    breaker.status = BreakerStatus::Open;
                    breaker.recovery_attempts += 1;
                    breaker.success_count = 0;
                    breaker.next_retry_time =
                        Some(now + self.open_duration_ms(breaker.recovery_attempts));
                    breaker.state_since_ms = now;
                }
                BreakerStatus::Open => {
                    breaker.failure_count += 1;
                }
            }
        }

        self.invalidate_metrics(strategy_id);
        if let Some((from, to)) = transition {
            warn!(strategy_id, from = %from, to = %to, error, "breaker state change on failure");
            self.fire_state_change(strategy_id, from, to);
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// State snapshot, or `None` for a strategy never touched.
    pub fn get_state(&self, strategy_id: &str) -> Option<BreakerState> {
        self.breakers.lock().get(strategy_id).map(Breaker::snapshot)
    }

    /// Derived metrics, computed lazily and cached until the next mutation.
    pub fn get_metrics(&self, strategy_id: &str) -> Option<BreakerMetrics> {
        if let Some(cached) = self.metrics_cache.lock().get(strategy_id) {
            return Some(cached.clone());
        }

        let metrics = {
            let breakers = self.breakers.lock();
            let breaker = breakers.get(strategy_id)?;
            let total = breaker.total_failures + breaker.total_successes;
            BreakerMetrics {
                status: breaker.status,
                failure_rate: if total == 0 {
                    0.0
                } else {
                    breaker.total_failures as f64 / total as f64
                },
                time_in_state_ms: self.clock.now_ms().saturating_sub(breaker.state_since_ms),
                recovery_attempts: breaker.recovery_attempts,
            }
        };

        self.metrics_cache
            .lock()
            .insert(strategy_id.to_string(), metrics.clone());
        Some(metrics)
    }

    pub fn breaker_count(&self) -> usize {
        self.breakers.lock().len()
    }

    // -------------------------------------------------------------------------
    // Reset
    // -------------------------------------------------------------------------

    pub fn reset(&self, strategy_id: &str) {
        let now = self.clock.now_ms();
        let transition = {
            let mut breakers = self.breakers.lock();
            breakers.get_mut(strategy_id).map(|breaker| {
                let from = breaker.status;
                *breaker = Breaker::new(now);
                (from, BreakerStatus::Closed)
            })
        };
        self.invalidate_metrics(strategy_id);
        if let Some((from, to)) = transition {
            info!(strategy_id, "breaker reset");
            if from != to {
                self.fire_state_change(strategy_id, from, to);
            }
        }
    }

    pub fn reset_all(&self) {
        let ids: Vec<String> = self.breakers.lock().keys().cloned().collect();
        for id in ids {
            self.reset(&id);
        }
    }

    // -------------------------------------------------------------------------
    // Callbacks
    // -------------------------------------------------------------------------

    /// Register a state-change observer; returns an id for `off_state_change`.
    pub fn on_state_change(
        &self,
        callback: impl Fn(&str, BreakerStatus, BreakerStatus) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().push((id, Arc::new(callback)));
        id
    }

    pub fn off_state_change(&self, id: u64) {
        self.callbacks.write().retain(|(cb_id, _)| *cb_id != id);
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breaker_count())
            .field("config", &self.config)
            .finish()
    }
}
