// =============================================================================
// Real-Time Risk Monitor — composite health scoring per open position
// =============================================================================
//
// Every `check_interval_candles` candles a position's health is recomputed as
// a weighted average of five [0,100] components:
//
//   time_at_risk     = 100 * (1 - min(1, minutes_held / max_minutes))
//   drawdown         = 100 * (1 - min(1, loss_pct / max_threshold_pct))
//   volume_liquidity = 50 + 50 * clip((last_vol - avg_vol) / avg_vol, -1, 1)
//   volatility       = full marks until ATR exceeds twice its average, then
//                      penalised linearly to zero at four times the average
//   profitability    = 50 + 50 * clip(pnl_pct / target_pnl_pct, -1, 1)
//
// Danger bands: SAFE >= 70, WARNING 30..69, CRITICAL < 30. A transition into
// CRITICAL raises a risk alert and, when configured, hands the position to
// the lifecycle manager for an emergency close.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::events::{Event, EventBus};
use crate::lifecycle::{EmergencyCloseRequest, TradingLifecycleManager};
use crate::positions::Position;
use crate::runtime_config::BotConfig;
use crate::types::Priority;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DangerLevel {
    Safe,
    Warning,
    Critical,
}

impl DangerLevel {
    /// Classification with the standard bands: SAFE >= 70, CRITICAL < 30.
    pub fn from_score(score: f64) -> Self {
        Self::classify(score, 30.0)
    }

    /// Classification with a configurable CRITICAL boundary.
    pub fn classify(score: f64, critical_threshold: f64) -> Self {
        if score >= 70.0 {
            Self::Safe
        } else if score >= critical_threshold {
            Self::Warning
        } else {
            Self::Critical
        }
    }
}

impl std::fmt::Display for DangerLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "SAFE"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Five-component health score plus the weighted overall.
#[derive(Debug, Clone, Serialize)]
pub struct HealthScore {
    pub time_at_risk: f64,
    pub drawdown: f64,
    pub volume_liquidity: f64,
    pub volatility: f64,
    pub profitability: f64,
    pub overall_score: f64,
    pub danger_level: DangerLevel,
}

/// Component weights; must sum to 1.
#[derive(Debug, Clone, Copy)]
pub struct RiskWeights {
    pub time_at_risk: f64,
    pub drawdown: f64,
    pub volume_liquidity: f64,
    pub volatility: f64,
    pub profitability: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            time_at_risk: 0.2,
            drawdown: 0.2,
            volume_liquidity: 0.2,
            volatility: 0.2,
            profitability: 0.2,
        }
    }
}

/// Market context for one evaluation, derived from the candle buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketSnapshot {
    pub last_candle_volume: f64,
    pub average_volume: f64,
    pub current_atr: f64,
    pub average_atr: f64,
}

/// Monitor tunables sourced from `BotConfig`.
#[derive(Debug, Clone)]
pub struct RiskMonitorConfig {
    pub check_interval_candles: u32,
    pub health_score_threshold: f64,
    pub emergency_close_on_critical: bool,
    /// Denominator for the time-at-risk component.
    pub max_holding_minutes: f64,
    /// Loss percent at which the drawdown component bottoms out.
    pub max_drawdown_threshold_pct: f64,
    /// PnL percent at which profitability saturates.
    pub target_pnl_pct: f64,
    pub weights: RiskWeights,
}

impl From<&BotConfig> for RiskMonitorConfig {
    fn from(cfg: &BotConfig) -> Self {
        Self {
            check_interval_candles: cfg.check_interval_candles,
            health_score_threshold: cfg.health_score_threshold,
            emergency_close_on_critical: cfg.emergency_close_on_critical,
            max_holding_minutes: cfg.max_holding_time_minutes,
            max_drawdown_threshold_pct: 5.0,
            target_pnl_pct: 1.0,
            weights: RiskWeights::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

struct MonitoredState {
    candle_counter: u32,
    last_score: Option<HealthScore>,
}

pub struct RealTimeRiskMonitor {
    config: RiskMonitorConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    lifecycle: Arc<TradingLifecycleManager>,
    monitored: RwLock<HashMap<String, MonitoredState>>,
}

fn clip(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}

impl RealTimeRiskMonitor {
    pub fn new(
        config: RiskMonitorConfig,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        lifecycle: Arc<TradingLifecycleManager>,
    ) -> Self {
        Self {
            config,
            clock,
            events,
            lifecycle,
            monitored: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Candle-driven evaluation
    // -------------------------------------------------------------------------

    /// Count a candle for `position` and recompute its health score every
    /// `check_interval_candles`. Returns the new score when one was computed.
    pub fn on_candle(&self, position: &Position, market: &MarketSnapshot) -> Option<HealthScore> {
        let due = {
            let mut monitored = self.monitored.write();
            let state = monitored
                .entry(position.position_id.clone())
                .or_insert(MonitoredState {
                    candle_counter: 0,
                    last_score: None,
                });
            state.candle_counter += 1;
            state.candle_counter % self.config.check_interval_candles == 0
        };
        if !due {
            return None;
        }

        let score = self.compute_health(position, market);
        let previous_level = {
            let mut monitored = self.monitored.write();
            let state = monitored.get_mut(&position.position_id)?;
            let previous = state.last_score.as_ref().map(|s| s.danger_level);
            state.last_score = Some(score.clone());
            previous
        };

        debug!(
            position_id = %position.position_id,
            overall = score.overall_score,
            danger = %score.danger_level,
            "health score computed"
        );
        self.events.publish(Event::HealthScoreUpdated {
            position_id: position.position_id.clone(),
            overall_score: score.overall_score,
        });

        // A fresh position is implicitly SAFE until scored otherwise.
        let baseline = previous_level.unwrap_or(DangerLevel::Safe);
        if baseline != score.danger_level {
            let previous_name = baseline.to_string();
            info!(
                position_id = %position.position_id,
                previous = %previous_name,
                current = %score.danger_level,
                "danger level changed"
            );
            self.events.publish(Event::DangerLevelChanged {
                position_id: position.position_id.clone(),
                previous: previous_name,
                current: score.danger_level.to_string(),
            });

            if score.danger_level == DangerLevel::Critical {
                warn!(
                    position_id = %position.position_id,
                    overall = score.overall_score,
                    "risk alert: position health critical"
                );
                self.events.publish(Event::RiskAlertTriggered {
                    position_id: position.position_id.clone(),
                    symbol: position.symbol.clone(),
                    overall_score: score.overall_score,
                });

                if self.config.emergency_close_on_critical {
                    self.events.publish(Event::EmergencyCloseTriggered {
                        position_id: position.position_id.clone(),
                        reason: "HealthScoreCritical".to_string(),
                    });
                    self.lifecycle.clone().request_emergency_close(EmergencyCloseRequest {
                        position_id: position.position_id.clone(),
                        reason: "HealthScoreCritical".to_string(),
                        priority: Priority::High,
                    });
                }
            }
        }

        Some(score)
    }

    /// Pure score computation over the position and market context.
    pub fn compute_health(&self, position: &Position, market: &MarketSnapshot) -> HealthScore {
        let cfg = &self.config;
        let now = self.clock.now_ms();

        let minutes_held = now.saturating_sub(position.entry_time_ms) as f64 / 60_000.0;
        let time_at_risk =
            100.0 * (1.0 - (minutes_held / cfg.max_holding_minutes).min(1.0));

        let loss_pct = (-position.unrealized_pnl_pct).max(0.0);
        let drawdown = 100.0 * (1.0 - (loss_pct / cfg.max_drawdown_threshold_pct).min(1.0));

        let volume_liquidity = if market.average_volume > 0.0 {
            let relative =
                (market.last_candle_volume - market.average_volume) / market.average_volume;
            50.0 + 50.0 * clip(relative, -1.0, 1.0)
        } else {
            50.0
        };

        // Full marks until ATR doubles its average, then a linear penalty
        // down to zero at four times the average.
        let volatility = if market.average_atr > 0.0 {
            let ratio = market.current_atr / market.average_atr;
            100.0 - 100.0 * clip((ratio - 2.0) / 2.0, 0.0, 1.0)
        } else {
            100.0
        };

        let profitability =
            50.0 + 50.0 * clip(position.unrealized_pnl_pct / cfg.target_pnl_pct, -1.0, 1.0);

        let w = &cfg.weights;
        let overall_score = w.time_at_risk * time_at_risk
            + w.drawdown * drawdown
            + w.volume_liquidity * volume_liquidity
            + w.volatility * volatility
            + w.profitability * profitability;

        HealthScore {
            time_at_risk,
            drawdown,
            volume_liquidity,
            volatility,
            profitability,
            overall_score,
            danger_level: DangerLevel::classify(overall_score, cfg.health_score_threshold),
        }
    }

    // -------------------------------------------------------------------------
    // Cache management
    // -------------------------------------------------------------------------

    /// Invalidate cached state after the position itself changed (partial
    /// close, price jump re-entry, recovery).
    pub fn invalidate(&self, position_id: &str) {
        if let Some(state) = self.monitored.write().get_mut(position_id) {
            state.last_score = None;
            state.candle_counter = 0;
        }
    }

    /// Stop monitoring a closed position.
    pub fn remove_position(&self, position_id: &str) {
        self.monitored.write().remove(position_id);
    }

    /// Latest cached score, if one has been computed.
    pub fn get_health(&self, position_id: &str) -> Option<HealthScore> {
        self.monitored
            .read()
            .get(position_id)
            .and_then(|s| s.last_score.clone())
    }
}

impl std::fmt::Debug for RealTimeRiskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealTimeRiskMonitor")
            .field("monitored", &self.monitored.read().len())
            .finish()
    }
}
