// =============================================================================
// Trading Lifecycle Manager — holding-time thresholds and emergency closes
// =============================================================================
//
// Tracks open positions by id. Each check computes the holding time and walks
// the coarse lifecycle chain:
//
//   OPEN -> WARNING -> CRITICAL -> CLOSING -> CLOSED
//
// with a direct OPEN/WARNING -> CLOSING edge for manual and risk-driven
// triggers. WARNING and CRITICAL each publish exactly one event per position;
// CRITICAL additionally triggers an automatic emergency close when enabled.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::events::{Event, EventBus};
use crate::execution::OrderExecutionPipeline;
use crate::journal::{Journal, TradeRecord};
use crate::positions::{Position, PositionBook};
use crate::position_state::PositionStateMachine;
use crate::runtime_config::BotConfig;
use crate::types::{Order, OrderType, Priority, Side};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Coarse position stage with respect to holding-time thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    Open,
    Warning,
    Critical,
    Closing,
    Closed,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Legality of a lifecycle transition: the escalation chain, plus a direct
/// jump to CLOSING for manual/risk triggers.
pub fn validate_state_transition(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
        (from, to),
        (Open, Warning)
            | (Warning, Critical)
            | (Critical, Closing)
            | (Closing, Closed)
            | (Open, Closing)
            | (Warning, Closing)
    )
}

// ---------------------------------------------------------------------------
// Tracked records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TrackedPosition {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_time_ms: u64,
    pub state: LifecycleState,
    warning_emitted: bool,
    critical_emitted: bool,
}

/// Emergency close request, from the risk monitor, the timeout path, or
/// shutdown.
#[derive(Debug, Clone)]
pub struct EmergencyCloseRequest {
    pub position_id: String,
    pub reason: String,
    pub priority: Priority,
}

/// Lifecycle tunables sourced from `BotConfig`.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub warning_threshold_minutes: f64,
    pub max_holding_time_minutes: f64,
    pub enable_automatic_timeout: bool,
}

impl From<&BotConfig> for LifecycleConfig {
    fn from(cfg: &BotConfig) -> Self {
        Self {
            warning_threshold_minutes: cfg.warning_threshold_minutes,
            max_holding_time_minutes: cfg.max_holding_time_minutes,
            enable_automatic_timeout: cfg.enable_automatic_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct TradingLifecycleManager {
    config: LifecycleConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    pipeline: Arc<OrderExecutionPipeline>,
    book: Arc<PositionBook>,
    state_machine: Arc<PositionStateMachine>,
    journal: Arc<dyn Journal>,
    tracked: RwLock<HashMap<String, TrackedPosition>>,
}

impl TradingLifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LifecycleConfig,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
        pipeline: Arc<OrderExecutionPipeline>,
        book: Arc<PositionBook>,
        state_machine: Arc<PositionStateMachine>,
        journal: Arc<dyn Journal>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            events,
            pipeline,
            book,
            state_machine,
            journal,
            tracked: RwLock::new(HashMap::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Tracking
    // -------------------------------------------------------------------------

    /// Begin tracking an open position.
    pub fn track_position(&self, position: &Position) {
        let record = TrackedPosition {
            position_id: position.position_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_time_ms: position.entry_time_ms,
            state: LifecycleState::Open,
            warning_emitted: false,
            critical_emitted: false,
        };
        debug!(position_id = %position.position_id, "lifecycle tracking started");
        self.tracked
            .write()
            .insert(position.position_id.clone(), record);
    }

    /// Stop tracking (position externally closed).
    pub fn untrack_position(&self, position_id: &str) {
        self.tracked.write().remove(position_id);
    }

    pub fn lifecycle_state(&self, position_id: &str) -> Option<LifecycleState> {
        self.tracked.read().get(position_id).map(|t| t.state)
    }

    pub fn tracked_positions(&self) -> Vec<TrackedPosition> {
        self.tracked.read().values().cloned().collect()
    }

    /// Apply a lifecycle transition after checking it against the legal
    /// table. Illegal moves are rejected and leave the record untouched.
    fn apply_transition(record: &mut TrackedPosition, to: LifecycleState) -> bool {
        if !validate_state_transition(record.state, to) {
            warn!(
                position_id = %record.position_id,
                from = %record.state,
                to = %to,
                "illegal lifecycle transition rejected"
            );
            return false;
        }
        record.state = to;
        true
    }

    // -------------------------------------------------------------------------
    // Scheduled check (driven by the candle tick)
    // -------------------------------------------------------------------------

    /// Evaluate holding times for every tracked position and escalate
    /// lifecycle states, publishing the corresponding events.
    pub async fn check_positions(&self) {
        let now = self.clock.now_ms();
        let mut warnings: Vec<(String, String, f64)> = Vec::new();
        let mut criticals: Vec<(String, String, f64)> = Vec::new();

        {
            let mut tracked = self.tracked.write();
            for record in tracked.values_mut() {
                if matches!(record.state, LifecycleState::Closing | LifecycleState::Closed) {
                    continue;
                }
                let holding_minutes =
                    now.saturating_sub(record.entry_time_ms) as f64 / 60_000.0;

                if holding_minutes >= self.config.max_holding_time_minutes
                    && !record.critical_emitted
                {
                    // A position that skipped its WARNING check steps through
                    // WARNING silently so the escalation chain stays legal.
                    if record.state == LifecycleState::Open {
                        Self::apply_transition(record, LifecycleState::Warning);
                    }
                    if Self::apply_transition(record, LifecycleState::Critical) {
                        record.critical_emitted = true;
                        record.warning_emitted = true;
                        criticals.push((
                            record.position_id.clone(),
                            record.symbol.clone(),
                            holding_minutes,
                        ));
                    }
                } else if holding_minutes >= self.config.warning_threshold_minutes
                    && !record.warning_emitted
                {
                    if Self::apply_transition(record, LifecycleState::Warning) {
                        record.warning_emitted = true;
                        warnings.push((
                            record.position_id.clone(),
                            record.symbol.clone(),
                            holding_minutes,
                        ));
                    }
                }
            }
        }

        for (position_id, symbol, holding_minutes) in warnings {
            warn!(position_id = %position_id, holding_minutes, "position holding-time warning");
            self.events.publish(Event::PositionTimeoutWarning {
                position_id,
                symbol,
                holding_minutes,
            });
        }

        for (position_id, symbol, holding_minutes) in criticals {
            warn!(position_id = %position_id, holding_minutes, "position holding-time critical");
            self.events.publish(Event::PositionTimeoutCritical {
                position_id: position_id.clone(),
                symbol: symbol.clone(),
                holding_minutes,
            });

            if self.config.enable_automatic_timeout {
                self.events.publish(Event::PositionTimeoutTriggered {
                    position_id: position_id.clone(),
                    symbol,
                });
                self.trigger_emergency_close(EmergencyCloseRequest {
                    position_id,
                    reason: "MaxHoldingTimeExceeded".to_string(),
                    priority: Priority::High,
                })
                .await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Emergency close
    // -------------------------------------------------------------------------

    /// Fire-and-forget variant for synchronous callers (risk monitor).
    pub fn request_emergency_close(self: Arc<Self>, request: EmergencyCloseRequest) {
        tokio::spawn(async move {
            self.trigger_emergency_close(request).await;
        });
    }

    /// Close a position at market through the execution pipeline. Unknown
    /// position ids are non-fatal. Returns true when the position ended
    /// CLOSED.
    pub async fn trigger_emergency_close(&self, request: EmergencyCloseRequest) -> bool {
        let Some(position) = self.book.get_position(&request.position_id) else {
            warn!(
                position_id = %request.position_id,
                reason = %request.reason,
                "emergency close for unknown position — ignoring"
            );
            return false;
        };

        // CLOSING gate: a second trigger for the same position is a no-op.
        // The pre-CLOSING state is kept so a failed close can be rolled back
        // to exactly where the position was.
        let previous_state = {
            let mut tracked = self.tracked.write();
            match tracked.get_mut(&request.position_id) {
                Some(record) => {
                    if record.state == LifecycleState::Closing {
                        debug!(position_id = %request.position_id, "emergency close already in flight");
                        return false;
                    }
                    let previous = record.state;
                    if !Self::apply_transition(record, LifecycleState::Closing) {
                        return false;
                    }
                    Some(previous)
                }
                None => {
                    // Not tracked (e.g. recovered position) — close anyway.
                    debug!(position_id = %request.position_id, "closing untracked position");
                    None
                }
            }
        };

        info!(
            position_id = %request.position_id,
            symbol = %position.symbol,
            reason = %request.reason,
            priority = %request.priority,
            "emergency close initiated"
        );

        let close_order = Order {
            order_id: String::new(),
            symbol: position.symbol.clone(),
            side: position.side.closing_order_side(),
            order_type: OrderType::Market,
            quantity: position.quantity,
            price: position.current_price,
            time_in_force: None,
        };

        let result = self.pipeline.place_order(close_order, None).await;
        if !result.success {
            warn!(
                position_id = %request.position_id,
                error = result.error.as_deref().unwrap_or(""),
                "emergency close order failed — position remains open"
            );
            // Undo the optimistic CLOSING transition so a later attempt can
            // retry from the state the position was actually in.
            if let Some(previous) = previous_state {
                if let Some(record) = self.tracked.write().get_mut(&request.position_id) {
                    record.state = previous;
                }
            }
            return false;
        }

        let close_price = if result.average_price > 0.0 {
            result.average_price
        } else {
            position.current_price
        };
        self.finalize_close(&position, &request.reason, close_price);
        true
    }

    /// Record closure in the book, the state machine, the journal, and the
    /// tracking map.
    fn finalize_close(&self, position: &Position, reason: &str, close_price: f64) {
        let pnl = self
            .book
            .close_position(&position.position_id, reason, close_price);

        if let Err(e) = self.state_machine.close_position(
            &position.symbol,
            &position.position_id,
            reason,
            Some(close_price),
            pnl,
        ) {
            warn!(position_id = %position.position_id, error = %e, "state machine close failed");
        }

        let now = self.clock.now_ms();
        let pnl = pnl.unwrap_or(0.0);
        let pnl_percent = if position.entry_price > 0.0 && position.initial_quantity > 0.0 {
            pnl / (position.entry_price * position.initial_quantity) * 100.0
        } else {
            0.0
        };
        let record = TradeRecord {
            trade_id: position.position_id.clone(),
            symbol: position.symbol.clone(),
            direction: position.side,
            entry_price: position.entry_price,
            exit_price: close_price,
            pnl,
            pnl_percent,
            entry_time: position.entry_time_ms as i64,
            exit_time: now as i64,
            opened_at: position.opened_at.clone(),
            exit_reason: reason.to_string(),
        };
        if let Err(e) = self.journal.append_trade(&record) {
            warn!(position_id = %position.position_id, error = %e, "journal append failed");
        }

        if let Some(tracked) = self.tracked.write().get_mut(&position.position_id) {
            Self::apply_transition(tracked, LifecycleState::Closed);
        }
        info!(position_id = %position.position_id, pnl, "emergency close completed");
    }
}

impl std::fmt::Debug for TradingLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingLifecycleManager")
            .field("tracked", &self.tracked.read().len())
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::errors::ExchangeError;
    use crate::events::EventKind;
    use crate::exchange::{ExchangeClient, ExchangePosition, OrderAck, OrderStatusReport};
    use crate::execution::ExecutionConfig;
    use crate::journal::testing::MemoryJournal;
    use crate::positions::PositionSpec;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Exchange that instantly fills everything at the submitted price.
    struct InstantFillExchange {
        fail_placement: bool,
    }

    #[async_trait]
    impl ExchangeClient for InstantFillExchange {
        async fn place_order(&self, order: &Order) -> Result<OrderAck, ExchangeError> {
            if self.fail_placement {
                return Err(ExchangeError::Rejected("margin check".into()));
            }
            Ok(OrderAck {
                order_id: format!("ex-{}", order.order_id),
                status: "FILLED".into(),
            })
        }

        async fn cancel_all_orders(&self, _symbol: &str) -> Result<u32, ExchangeError> {
            Ok(1)
        }

        async fn cancel_all_conditional_orders(
            &self,
            _symbol: Option<&str>,
        ) -> Result<u32, ExchangeError> {
            Ok(1)
        }

        async fn order_status(
            &self,
            _symbol: &str,
            _order_id: &str,
        ) -> Result<OrderStatusReport, ExchangeError> {
            Ok(OrderStatusReport {
                status: "FILLED".into(),
                executed_quantity: 1.0,
                average_price: 99.5,
            })
        }

        async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        manager: Arc<TradingLifecycleManager>,
        book: Arc<PositionBook>,
        clock: Arc<ManualClock>,
        events: Arc<EventBus>,
        journal: Arc<MemoryJournal>,
    }

    fn harness(fail_placement: bool) -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let events = Arc::new(EventBus::new());
        let book = Arc::new(PositionBook::new());
        let journal = Arc::new(MemoryJournal::new());
        let state_machine = Arc::new(PositionStateMachine::new(clock.clone()));
        state_machine.initialize();
        let pipeline = Arc::new(OrderExecutionPipeline::new(
            Arc::new(InstantFillExchange { fail_placement }),
            events.clone(),
            clock.clone(),
            ExecutionConfig::default(),
        ));
        let manager = TradingLifecycleManager::new(
            LifecycleConfig {
                warning_threshold_minutes: 180.0,
                max_holding_time_minutes: 240.0,
                enable_automatic_timeout: true,
            },
            clock.clone(),
            events.clone(),
            pipeline,
            book.clone(),
            state_machine,
            journal.clone(),
        );
        Harness {
            manager,
            book,
            clock,
            events,
            journal,
        }
    }

    fn open_position(h: &Harness) -> String {
        let id = h
            .book
            .open_position(PositionSpec {
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                quantity: 1.0,
                entry_price: 100.0,
                entry_time_ms: h.clock.now_ms(),
                stop_loss: Some(95.0),
                take_profits: Vec::new(),
            })
            .unwrap();
        h.book.update_price("BTCUSDT", 100.0);
        let pos = h.book.get_position(&id).unwrap();
        h.manager.track_position(&pos);
        id
    }

    fn collect(events: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<Event>>> {
        let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.subscribe(kind, move |e| sink.lock().push(e.clone()));
        seen
    }

    #[test]
    fn transition_validation_matches_the_chain() {
        use LifecycleState::*;
        assert!(validate_state_transition(Open, Warning));
        assert!(validate_state_transition(Warning, Critical));
        assert!(validate_state_transition(Critical, Closing));
        assert!(validate_state_transition(Closing, Closed));
        assert!(validate_state_transition(Open, Closing));
        assert!(validate_state_transition(Warning, Closing));

        assert!(!validate_state_transition(Open, Critical));
        assert!(!validate_state_transition(Open, Closed));
        assert!(!validate_state_transition(Warning, Open));
        assert!(!validate_state_transition(Closed, Closing));
        assert!(!validate_state_transition(Closing, Open));
    }

    #[tokio::test]
    async fn warning_threshold_publishes_exactly_once() {
        // Lifecycle timeout scenario, first half: one WARNING at t0+181min.
        let h = harness(false);
        let id = open_position(&h);
        let warnings = collect(&h.events, EventKind::PositionTimeoutWarning);

        h.clock.advance(179 * 60_000);
        h.manager.check_positions().await;
        assert!(warnings.lock().is_empty());
        assert_eq!(h.manager.lifecycle_state(&id), Some(LifecycleState::Open));

        h.clock.advance(2 * 60_000); // t0 + 181 min
        h.manager.check_positions().await;
        assert_eq!(warnings.lock().len(), 1);
        assert_eq!(h.manager.lifecycle_state(&id), Some(LifecycleState::Warning));

        // A later check does not re-emit.
        h.clock.advance(60_000);
        h.manager.check_positions().await;
        assert_eq!(warnings.lock().len(), 1);
    }

    #[tokio::test]
    async fn critical_triggers_automatic_emergency_close() {
        // Lifecycle timeout scenario, second half: CRITICAL then TRIGGERED
        // and a close order at t0+241min.
        let h = harness(false);
        let id = open_position(&h);
        let criticals = collect(&h.events, EventKind::PositionTimeoutCritical);
        let triggered = collect(&h.events, EventKind::PositionTimeoutTriggered);
        let orders = collect(&h.events, EventKind::OrderExecutionStarted);

        h.clock.advance(241 * 60_000);
        h.manager.check_positions().await;

        assert_eq!(criticals.lock().len(), 1);
        assert_eq!(triggered.lock().len(), 1);
        assert_eq!(orders.lock().len(), 1);

        // The position is gone from the book and journaled.
        assert!(h.book.get_position(&id).is_none());
        assert_eq!(h.manager.lifecycle_state(&id), Some(LifecycleState::Closed));
        let trades = h.journal.read_all_trades().unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, "MaxHoldingTimeExceeded");
    }

    #[tokio::test]
    async fn manual_emergency_close_closes_position() {
        let h = harness(false);
        let id = open_position(&h);

        let closed = h
            .manager
            .trigger_emergency_close(EmergencyCloseRequest {
                position_id: id.clone(),
                reason: "ManualClose".into(),
                priority: Priority::High,
            })
            .await;

        assert!(closed);
        assert!(h.book.get_position(&id).is_none());
        let closed_pos = &h.book.get_closed_positions(1)[0];
        assert_eq!(closed_pos.closure_reason.as_deref(), Some("ManualClose"));
    }

    #[tokio::test]
    async fn failed_close_order_keeps_position_open() {
        let h = harness(true);
        let id = open_position(&h);

        let closed = h
            .manager
            .trigger_emergency_close(EmergencyCloseRequest {
                position_id: id.clone(),
                reason: "ManualClose".into(),
                priority: Priority::High,
            })
            .await;

        assert!(!closed);
        assert!(h.book.get_position(&id).is_some());
        // The gate rolled back to the exact pre-close state, not just away
        // from CLOSING.
        assert_eq!(h.manager.lifecycle_state(&id), Some(LifecycleState::Open));
    }

    #[tokio::test]
    async fn failed_close_rolls_back_to_warning_state() {
        // A risk-driven close can fire while the position is merely WARNING;
        // a failed order must restore that state, never invent CRITICAL.
        let h = harness(true);
        let id = open_position(&h);

        h.clock.advance(181 * 60_000);
        h.manager.check_positions().await;
        assert_eq!(h.manager.lifecycle_state(&id), Some(LifecycleState::Warning));

        let closed = h
            .manager
            .trigger_emergency_close(EmergencyCloseRequest {
                position_id: id.clone(),
                reason: "HealthScoreCritical".into(),
                priority: Priority::High,
            })
            .await;

        assert!(!closed);
        assert!(h.book.get_position(&id).is_some());
        assert_eq!(h.manager.lifecycle_state(&id), Some(LifecycleState::Warning));
    }

    #[tokio::test]
    async fn unknown_position_is_non_fatal() {
        let h = harness(false);
        let closed = h
            .manager
            .trigger_emergency_close(EmergencyCloseRequest {
                position_id: "ghost".into(),
                reason: "ManualClose".into(),
                priority: Priority::Normal,
            })
            .await;
        assert!(!closed);
    }
}
