// =============================================================================
// Engine Dispatch — turns closed candles into gated analysis jobs
// =============================================================================
//
// For every closed candle:
//   1. Refresh position marks for the symbol.
//   2. Feed the risk monitor for each open position on the symbol.
//   3. Run the lifecycle holding-time check.
//   4. For each strategy subscribed to the (symbol, interval): gate through
//      its circuit breaker, submit a pool job, and record the settled
//      outcome back on the breaker.
//
// A strategy failure is SKIP-recovered: it is recorded and the next candle
// proceeds normally. Pool submission errors (queue full, not running) are
// logged but do not drive breakers — they say nothing about the strategy.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::lifecycle::TradingLifecycleManager;
use crate::market_data::{average_true_range, average_volume, Candle, CandleBuffer, CandleKey};
use crate::pool::{Job, StrategyPool};
use crate::positions::PositionBook;
use crate::risk_monitor::{MarketSnapshot, RealTimeRiskMonitor};
use crate::runtime_config::StrategyConfig;

/// Closed candles examined per risk-monitor market snapshot.
const SNAPSHOT_WINDOW: usize = 50;
/// ATR look-back period.
const ATR_PERIOD: usize = 14;

// ---------------------------------------------------------------------------
// Strategy orchestrator
// ---------------------------------------------------------------------------

/// Per-strategy analysis context handed out by the orchestrator cache. The
/// actual signal math lives in the processing function installed on the
/// pool; this object carries the state that must survive between candles.
#[derive(Debug)]
pub struct StrategyOrchestrator {
    pub strategy_id: String,
    candles_seen: AtomicU64,
}

impl StrategyOrchestrator {
    pub fn new(strategy_id: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            candles_seen: AtomicU64::new(0),
        }
    }

    /// Default analysis: bookkeeping plus a HOLD verdict. Real strategies
    /// replace the installed processing function wholesale.
    pub fn analyze(&self, candle: &Candle) -> serde_json::Value {
        let seen = self.candles_seen.fetch_add(1, Ordering::Relaxed) + 1;
        json!({
            "strategy": self.strategy_id,
            "candles_seen": seen,
            "close": candle.close,
            "signal": "HOLD",
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct EngineDispatcher {
    strategies: Vec<StrategyConfig>,
    pool: Arc<StrategyPool>,
    breakers: Arc<CircuitBreakerRegistry>,
    book: Arc<PositionBook>,
    monitor: Arc<RealTimeRiskMonitor>,
    lifecycle: Arc<TradingLifecycleManager>,
    buffer: Arc<CandleBuffer>,
    clock: Arc<dyn Clock>,
}

impl EngineDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategies: Vec<StrategyConfig>,
        pool: Arc<StrategyPool>,
        breakers: Arc<CircuitBreakerRegistry>,
        book: Arc<PositionBook>,
        monitor: Arc<RealTimeRiskMonitor>,
        lifecycle: Arc<TradingLifecycleManager>,
        buffer: Arc<CandleBuffer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            strategies,
            pool,
            breakers,
            book,
            monitor,
            lifecycle,
            buffer,
            clock,
        }
    }

    /// Market context for the risk monitor from the recent candle history.
    fn build_market_snapshot(&self, key: &CandleKey) -> MarketSnapshot {
        let candles = self.buffer.get_closed(key, SNAPSHOT_WINDOW);
        let last_candle_volume = candles.last().map(|c| c.volume).unwrap_or(0.0);
        let average_atr = average_true_range(&candles, ATR_PERIOD).unwrap_or(0.0);
        let recent_start = candles.len().saturating_sub(ATR_PERIOD + 1);
        let current_atr =
            average_true_range(&candles[recent_start..], ATR_PERIOD).unwrap_or(average_atr);
        MarketSnapshot {
            last_candle_volume,
            average_volume: average_volume(&candles).unwrap_or(0.0),
            current_atr,
            average_atr,
        }
    }

    /// Handle one closed candle end-to-end. Returns the number of jobs whose
    /// results were settled.
    pub async fn on_closed_candle(&self, key: &CandleKey, candle: &Candle) -> usize {
        // 1. Position marks.
        self.book.update_price(&key.symbol, candle.close);

        // 2. Risk monitoring per open position on this symbol.
        let market = self.build_market_snapshot(key);
        for position in self
            .book
            .get_open_positions()
            .iter()
            .filter(|p| p.symbol == key.symbol)
        {
            self.monitor.on_candle(position, &market);
        }

        // 3. Holding-time lifecycle check.
        self.lifecycle.check_positions().await;

        // 4. Breaker-gated job dispatch, one job per subscribed strategy.
        let mut submissions = Vec::new();
        for strategy in self
            .strategies
            .iter()
            .filter(|s| s.symbol == key.symbol && s.interval == key.interval)
        {
            if !self.breakers.can_execute(&strategy.id) {
                debug!(strategy_id = %strategy.id, "breaker open — candle skipped");
                continue;
            }

            let mut job = Job::new(
                &strategy.id,
                candle.clone(),
                strategy.priority,
                self.clock.now_ms(),
            );
            job.timeout_ms = strategy.timeout_ms;

            let pool = self.pool.clone();
            let strategy_id = strategy.id.clone();
            submissions.push(async move { (strategy_id, pool.submit_job(job).await) });
        }

        let settled = futures_util::future::join_all(submissions).await;
        let mut completed = 0;
        for (strategy_id, outcome) in settled {
            match outcome {
                Ok(result) => {
                    if result.success {
                        self.breakers.record_success(&strategy_id);
                    } else {
                        let error = result
                            .error
                            .unwrap_or_else(|| "analysis failed".to_string());
                        self.breakers.record_failure(&strategy_id, &error);
                    }
                    completed += 1;
                }
                Err(e) => {
                    // Submission failure says nothing about the strategy;
                    // skip and move on to the next candle.
                    warn!(strategy_id = %strategy_id, error = %e, "job submission failed");
                }
            }
        }
        completed
    }
}

impl std::fmt::Debug for EngineDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineDispatcher")
            .field("strategies", &self.strategies.len())
            .finish()
    }
}
