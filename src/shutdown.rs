// =============================================================================
// Graceful Shutdown Coordinator — cancel, close, persist, recover
// =============================================================================
//
// Shutdown sequence:
//   1. Drain the strategy pool (no new submissions, join in-flight jobs).
//   2. Cancel pending orders — RETRY transient errors (500 ms -> 1 s -> 2 s),
//      then degrade gracefully: count successes and continue.
//   3. Emergency-close every open position via the lifecycle manager.
//   4. Persist a BotStateSnapshot; write errors degrade gracefully.
//   5. Emit SHUTDOWN_COMPLETED with a ShutdownResult even under partial
//      failure.
//
// Recovery reads the snapshot back; a missing or corrupt file falls back to
// a fresh start.
// =============================================================================

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::errors::ExchangeError;
use crate::events::{Event, EventBus};
use crate::exchange::ExchangeClient;
use crate::lifecycle::{EmergencyCloseRequest, TradingLifecycleManager};
use crate::pool::{PoolStats, StrategyPool};
use crate::positions::{Position, PositionBook};
use crate::types::Priority;

/// Backoff schedule for order-cancellation retries.
const CANCEL_RETRY_DELAYS_MS: [u64; 3] = [500, 1000, 2000];

/// Snapshot filename inside the state directory.
const SNAPSHOT_FILENAME: &str = "bot_state.json";

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Risk posture captured at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetricsSnapshot {
    pub breaker_count: usize,
    pub open_position_count: usize,
    pub total_unrealized_pnl: f64,
}

/// A serialized record of positions and metrics sufficient to warm-start the
/// bot. `snapshotTime` leads the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotStateSnapshot {
    pub snapshot_time: String,
    pub positions: Vec<Position>,
    pub session_metrics: PoolStats,
    pub risk_metrics: RiskMetricsSnapshot,
}

/// Outcome of a shutdown run.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownResult {
    pub cancelled_orders: u32,
    pub closed_positions: u32,
    pub state_persisted: bool,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub state_dir: PathBuf,
    pub shutdown_timeout_seconds: u64,
    pub symbols: Vec<String>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct GracefulShutdownCoordinator {
    exchange: Arc<dyn ExchangeClient>,
    lifecycle: Arc<TradingLifecycleManager>,
    pool: Arc<StrategyPool>,
    book: Arc<PositionBook>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: ShutdownConfig,
    shutdown_in_progress: AtomicBool,
    has_saved_state: AtomicBool,
    persistence_disabled: AtomicBool,
}

impl GracefulShutdownCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        lifecycle: Arc<TradingLifecycleManager>,
        pool: Arc<StrategyPool>,
        book: Arc<PositionBook>,
        breakers: Arc<CircuitBreakerRegistry>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: ShutdownConfig,
    ) -> Self {
        // Directory creation degrades gracefully: persistence is simply
        // disabled for the session.
        let persistence_disabled = match std::fs::create_dir_all(&config.state_dir) {
            Ok(()) => false,
            Err(e) => {
                warn!(
                    dir = %config.state_dir.display(),
                    error = %e,
                    "Could not create state directory, persistence will be disabled"
                );
                true
            }
        };

        Self {
            exchange,
            lifecycle,
            pool,
            book,
            breakers,
            events,
            clock,
            config,
            shutdown_in_progress: AtomicBool::new(false),
            has_saved_state: AtomicBool::new(false),
            persistence_disabled: AtomicBool::new(persistence_disabled),
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.config.state_dir.join(SNAPSHOT_FILENAME)
    }

    pub fn is_shutdown_in_progress(&self) -> bool {
        self.shutdown_in_progress.load(Ordering::SeqCst)
    }

    pub fn has_saved_state(&self) -> bool {
        self.has_saved_state.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Order cancellation (RETRY then GRACEFUL_DEGRADE)
    // -------------------------------------------------------------------------

    /// Run a cancellation call, retrying transient errors on the backoff
    /// schedule, then degrading: failure is logged and reported as `false`.
    async fn with_retry<F, Fut>(&self, label: &str, mut call: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<u32, ExchangeError>>,
    {
        let mut attempt = 0usize;
        loop {
            match call().await {
                Ok(_) => return true,
                Err(e) if e.is_retryable() && attempt < CANCEL_RETRY_DELAYS_MS.len() => {
                    let delay = CANCEL_RETRY_DELAYS_MS[attempt];
                    attempt += 1;
                    warn!(label, attempt, delay_ms = delay, error = %e, "cancellation retry");
                    self.clock.sleep(delay).await;
                }
                Err(e) => {
                    warn!(label, error = %e, "cancellation degraded — continuing shutdown");
                    return false;
                }
            }
        }
    }

    /// Cancel regular orders per symbol plus conditional orders globally.
    /// Returns the number of successful cancellation calls.
    pub async fn cancel_all_pending_orders(&self) -> u32 {
        // Configured symbols plus anything holding an open position.
        let mut symbols = self.config.symbols.clone();
        for position in self.book.get_open_positions() {
            if !symbols.contains(&position.symbol) {
                symbols.push(position.symbol);
            }
        }

        let mut successes = 0u32;
        for symbol in &symbols {
            if self
                .with_retry("cancel_all_orders", || self.exchange.cancel_all_orders(symbol))
                .await
            {
                successes += 1;
            }
        }

        if self
            .with_retry("cancel_all_conditional_orders", || {
                self.exchange.cancel_all_conditional_orders(None)
            })
            .await
        {
            successes += 1;
        }

        info!(successes, symbols = symbols.len(), "pending orders cancelled");
        successes
    }

    // -------------------------------------------------------------------------
    // Position closure
    // -------------------------------------------------------------------------

    /// Emergency-close every open position. Returns the number closed.
    pub async fn close_all_positions(&self, reason: &str) -> u32 {
        let open = self.book.get_open_positions();
        let mut closed = 0u32;
        for position in open {
            let done = self
                .lifecycle
                .trigger_emergency_close(EmergencyCloseRequest {
                    position_id: position.position_id.clone(),
                    reason: reason.to_string(),
                    priority: Priority::High,
                })
                .await;
            if done {
                closed += 1;
            }
        }
        info!(closed, "open positions closed for shutdown");
        closed
    }

    // -------------------------------------------------------------------------
    // Persistence (GRACEFUL_DEGRADE)
    // -------------------------------------------------------------------------

    fn build_snapshot(&self) -> BotStateSnapshot {
        let positions = self.book.get_open_positions();
        let total_unrealized_pnl = positions.iter().map(|p| p.unrealized_pnl).sum();
        BotStateSnapshot {
            snapshot_time: chrono::Utc::now().to_rfc3339(),
            risk_metrics: RiskMetricsSnapshot {
                breaker_count: self.breakers.breaker_count(),
                open_position_count: positions.len(),
                total_unrealized_pnl,
            },
            session_metrics: self.pool.get_stats(),
            positions,
        }
    }

    /// Serialize the snapshot to the state directory. Never throws: a write
    /// failure logs a warning and reports `false`, and no STATE_PERSISTED
    /// event is emitted.
    pub fn persist_state(&self) -> bool {
        if self.persistence_disabled.load(Ordering::SeqCst) {
            warn!("persistence disabled — skipping state snapshot");
            return false;
        }

        let snapshot = self.build_snapshot();
        let path = self.snapshot_path();

        let persisted = serde_json::to_string_pretty(&snapshot)
            .map_err(anyhow::Error::from)
            .and_then(|content| {
                let tmp_path = path.with_extension("json.tmp");
                std::fs::write(&tmp_path, &content)?;
                std::fs::rename(&tmp_path, &path)?;
                Ok(())
            });

        match persisted {
            Ok(()) => {
                self.has_saved_state.store(true, Ordering::SeqCst);
                info!(path = %path.display(), positions = snapshot.positions.len(), "state persisted");
                self.events.publish(Event::StatePersisted {
                    path: path.display().to_string(),
                });
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "State persistence failed");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Recovery (FALLBACK to fresh state)
    // -------------------------------------------------------------------------

    /// Read the snapshot back. A missing or corrupt file yields `None` and a
    /// fresh start.
    pub fn recover_state(&self) -> Option<BotStateSnapshot> {
        let path = self.snapshot_path();

        let snapshot = std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|content| Ok(serde_json::from_str::<BotStateSnapshot>(&content)?));

        match snapshot {
            Ok(snapshot) => {
                info!(
                    path = %path.display(),
                    positions = snapshot.positions.len(),
                    snapshot_time = %snapshot.snapshot_time,
                    "state recovered"
                );
                self.events.publish(Event::StateRecovered {
                    positions: snapshot.positions.len(),
                });
                Some(snapshot)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "State recovery failed, starting with fresh state");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Full shutdown sequence
    // -------------------------------------------------------------------------

    pub async fn shutdown(&self, reason: &str) -> ShutdownResult {
        if self.shutdown_in_progress.swap(true, Ordering::SeqCst) {
            warn!("shutdown already in progress");
            return ShutdownResult {
                cancelled_orders: 0,
                closed_positions: 0,
                state_persisted: false,
                duration_ms: 0,
                errors: vec!["shutdown already in progress".to_string()],
            };
        }

        let started = self.clock.now_ms();
        info!(reason, "shutdown started");
        self.events.publish(Event::ShutdownStarted {
            reason: reason.to_string(),
        });

        let mut errors: Vec<String> = Vec::new();
        let cancelled = Arc::new(Mutex::new(0u32));
        let closed = Arc::new(Mutex::new(0u32));

        let sequence = async {
            self.pool.shutdown().await;
            debug!("strategy pool drained");
            *cancelled.lock() = self.cancel_all_pending_orders().await;
            *closed.lock() = self.close_all_positions(reason).await;
        };

        let deadline = tokio::time::Duration::from_secs(self.config.shutdown_timeout_seconds);
        if tokio::time::timeout(deadline, sequence).await.is_err() {
            let message = format!(
                "shutdown deadline of {}s exceeded",
                self.config.shutdown_timeout_seconds
            );
            warn!("{message}");
            self.events.publish(Event::ShutdownFailed {
                error: message.clone(),
            });
            errors.push(message);
        }

        let state_persisted = self.persist_state();
        let cancelled_orders = *cancelled.lock();
        let closed_positions = *closed.lock();
        let duration_ms = self.clock.now_ms().saturating_sub(started);

        // Completed fires even under partial failure.
        self.events.publish(Event::ShutdownCompleted {
            cancelled_orders,
            closed_positions,
            state_persisted,
        });
        info!(
            cancelled_orders,
            closed_positions, state_persisted, duration_ms, "shutdown completed"
        );

        ShutdownResult {
            cancelled_orders,
            closed_positions,
            state_persisted,
            duration_ms,
            errors,
        }
    }
}

impl std::fmt::Debug for GracefulShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulShutdownCoordinator")
            .field("in_progress", &self.is_shutdown_in_progress())
            .field("has_saved_state", &self.has_saved_state())
            .finish()
    }
}
