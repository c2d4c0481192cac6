// =============================================================================
// Position State Machine — take-profit progress per (symbol, positionId)
// =============================================================================
//
// Legal transitions form a monotone path:
//
//   OPEN -> TP1_HIT -> TP2_HIT -> TP3_HIT -> CLOSED
//
// plus a direct edge from every non-terminal state to CLOSED (stop-loss,
// manual, emergency). Levels may not be skipped, nothing moves backward, and
// CLOSED is a sink. Illegal transitions are rejected without mutation.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Fine-grained progress of a position through its take-profit levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionState {
    Open,
    Tp1Hit,
    Tp2Hit,
    Tp3Hit,
    Closed,
}

impl PositionState {
    fn rank(&self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Tp1Hit => 1,
            Self::Tp2Hit => 2,
            Self::Tp3Hit => 3,
            Self::Closed => 4,
        }
    }

    /// Whether `self -> target` lies on the legal DAG.
    pub fn can_transition_to(&self, target: PositionState) -> bool {
        if *self == Self::Closed {
            return false;
        }
        if target == Self::Closed {
            return true;
        }
        // Advance exactly one TP level, never skip, never go back.
        target.rank() == self.rank() + 1
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Tp1Hit => write!(f, "TP1_HIT"),
            Self::Tp2Hit => write!(f, "TP2_HIT"),
            Self::Tp3Hit => write!(f, "TP3_HIT"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Exit-mode flags merged by `update_exit_mode`; a `None` in an update leaves
/// the stored flag untouched.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExitModes {
    #[serde(default)]
    pub pre_be_mode: bool,
    #[serde(default)]
    pub trailing_mode: bool,
}

/// Partial update for [`ExitModes`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitModeUpdate {
    pub pre_be_mode: Option<bool>,
    pub trailing_mode: Option<bool>,
}

/// Full per-position state record. Getters return copies, never aliases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionStateRecord {
    pub symbol: String,
    pub position_id: String,
    pub state: PositionState,
    /// When the current state was entered (UNIX ms).
    pub state_since_ms: u64,
    pub created_at_ms: u64,
    pub exit_modes: ExitModes,
    /// Free-form metadata merged across transitions; unrelated keys survive.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub closed_at_ms: Option<u64>,
    #[serde(default)]
    pub closure_reason: Option<String>,
    #[serde(default)]
    pub closure_price: Option<f64>,
    #[serde(default)]
    pub closure_pnl: Option<f64>,
}

/// A transition request.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub symbol: String,
    pub position_id: String,
    pub target_state: PositionState,
    pub reason: String,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Outcome of a transition attempt.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub allowed: bool,
    pub current_state: PositionState,
}

/// Aggregate statistics for dashboards and shutdown snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct StateStatistics {
    pub total_positions: usize,
    pub by_state: HashMap<String, usize>,
    pub average_time_in_state_ms: f64,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

type StateKey = (String, String);

pub struct PositionStateMachine {
    initialized: AtomicBool,
    clock: Arc<dyn Clock>,
    states: RwLock<HashMap<StateKey, PositionStateRecord>>,
}

impl PositionStateMachine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            initialized: AtomicBool::new(false),
            clock,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Must be called before any transition. Idempotent.
    pub fn initialize(&self) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            info!("position state machine initialised");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            anyhow::bail!("position state machine used before initialize()");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Attempt a transition. Creates the record (state OPEN) on first touch.
    /// Illegal targets are rejected and leave the record untouched.
    pub fn transition_state(&self, req: TransitionRequest) -> Result<TransitionOutcome> {
        self.ensure_initialized()?;
        let now = self.clock.now_ms();
        let key = (req.symbol.clone(), req.position_id.clone());

        let mut states = self.states.write();
        let record = states.entry(key).or_insert_with(|| {
            debug!(
                symbol = %req.symbol,
                position_id = %req.position_id,
                "state record created (OPEN)"
            );
            PositionStateRecord {
                symbol: req.symbol.clone(),
                position_id: req.position_id.clone(),
                state: PositionState::Open,
                state_since_ms: now,
                created_at_ms: now,
                exit_modes: ExitModes::default(),
                metadata: serde_json::Map::new(),
                closed_at_ms: None,
                closure_reason: None,
                closure_price: None,
                closure_pnl: None,
            }
        });

        if !record.state.can_transition_to(req.target_state) {
            warn!(
                symbol = %req.symbol,
                position_id = %req.position_id,
                current = %record.state,
                target = %req.target_state,
                reason = %req.reason,
                "illegal state transition rejected"
            );
            return Ok(TransitionOutcome {
                allowed: false,
                current_state: record.state,
            });
        }

        let previous = record.state;
        record.state = req.target_state;
        record.state_since_ms = now;
        if let Some(extra) = req.metadata {
            // Merge: incoming keys win, unrelated keys survive.
            for (k, v) in extra {
                record.metadata.insert(k, v);
            }
        }

        info!(
            symbol = %req.symbol,
            position_id = %req.position_id,
            from = %previous,
            to = %req.target_state,
            reason = %req.reason,
            "position state transition"
        );

        Ok(TransitionOutcome {
            allowed: true,
            current_state: record.state,
        })
    }

    /// Merge exit-mode flags; fields left `None` are untouched.
    pub fn update_exit_mode(
        &self,
        symbol: &str,
        position_id: &str,
        update: ExitModeUpdate,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let mut states = self.states.write();
        let key = (symbol.to_string(), position_id.to_string());
        let Some(record) = states.get_mut(&key) else {
            warn!(symbol, position_id, "exit-mode update for unknown position");
            return Ok(());
        };
        if let Some(pre_be) = update.pre_be_mode {
            record.exit_modes.pre_be_mode = pre_be;
        }
        if let Some(trailing) = update.trailing_mode {
            record.exit_modes.trailing_mode = trailing;
        }
        debug!(
            symbol,
            position_id,
            pre_be = record.exit_modes.pre_be_mode,
            trailing = record.exit_modes.trailing_mode,
            "exit modes updated"
        );
        Ok(())
    }

    /// Transition to CLOSED and stamp the closure fields. Legal from every
    /// non-terminal state.
    pub fn close_position(
        &self,
        symbol: &str,
        position_id: &str,
        reason: &str,
        closure_price: Option<f64>,
        closure_pnl: Option<f64>,
    ) -> Result<TransitionOutcome> {
        let outcome = self.transition_state(TransitionRequest {
            symbol: symbol.to_string(),
            position_id: position_id.to_string(),
            target_state: PositionState::Closed,
            reason: reason.to_string(),
            metadata: None,
        })?;

        if outcome.allowed {
            let mut states = self.states.write();
            let key = (symbol.to_string(), position_id.to_string());
            if let Some(record) = states.get_mut(&key) {
                record.closed_at_ms = Some(self.clock.now_ms());
                record.closure_reason = Some(reason.to_string());
                record.closure_price = closure_price;
                record.closure_pnl = closure_pnl;
            }
        }
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current state, or `None` for an unknown position.
    pub fn get_state(&self, symbol: &str, position_id: &str) -> Option<PositionState> {
        self.states
            .read()
            .get(&(symbol.to_string(), position_id.to_string()))
            .map(|r| r.state)
    }

    /// Full record copy, or `None` for an unknown position.
    pub fn get_full_state(&self, symbol: &str, position_id: &str) -> Option<PositionStateRecord> {
        self.states
            .read()
            .get(&(symbol.to_string(), position_id.to_string()))
            .cloned()
    }

    /// All record copies for `symbol`.
    pub fn get_states_by_symbol(&self, symbol: &str) -> Vec<PositionStateRecord> {
        self.states
            .read()
            .values()
            .filter(|r| r.symbol == symbol)
            .cloned()
            .collect()
    }

    /// Drop a record (e.g. after the journal has taken ownership).
    pub fn clear_state(&self, symbol: &str, position_id: &str) {
        self.states
            .write()
            .remove(&(symbol.to_string(), position_id.to_string()));
    }

    pub fn get_statistics(&self) -> StateStatistics {
        let now = self.clock.now_ms();
        let states = self.states.read();

        let mut by_state: HashMap<String, usize> = HashMap::new();
        let mut total_time = 0u64;
        for record in states.values() {
            *by_state.entry(record.state.to_string()).or_default() += 1;
            total_time += now.saturating_sub(record.state_since_ms);
        }

        StateStatistics {
            total_positions: states.len(),
            by_state,
            average_time_in_state_ms: if states.is_empty() {
                0.0
            } else {
                total_time as f64 / states.len() as f64
            },
        }
    }
}

impl std::fmt::Debug for PositionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionStateMachine")
            .field("initialized", &self.is_initialized())
            .field("tracked", &self.states.read().len())
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

    fn machine() -> (PositionStateMachine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let sm = PositionStateMachine::new(clock.clone());
        sm.initialize();
        (sm, clock)
    }

    fn request(target: PositionState) -> TransitionRequest {
        TransitionRequest {
            symbol: "BTCUSDT".into(),
            position_id: "p1".into(),
            target_state: target,
            reason: "test".into(),
            metadata: None,
        }
    }

    #[test]
    fn uninitialized_machine_refuses_transitions() {
        let sm = PositionStateMachine::new(Arc::new(ManualClock::new(0)));
        assert!(sm.transition_state(request(PositionState::Tp1Hit)).is_err());
        sm.initialize();
        sm.initialize(); // idempotent
        assert!(sm.is_initialized());
        assert!(sm.transition_state(request(PositionState::Tp1Hit)).is_ok());
    }

    #[test]
    fn monotone_tp_path_is_legal() {
        let (sm, _) = machine();
        for target in [
            PositionState::Tp1Hit,
            PositionState::Tp2Hit,
            PositionState::Tp3Hit,
            PositionState::Closed,
        ] {
            let outcome = sm.transition_state(request(target)).unwrap();
            assert!(outcome.allowed, "expected {target} to be legal");
            assert_eq!(outcome.current_state, target);
        }
    }

    #[test]
    fn skipping_tp_levels_is_rejected_without_mutation() {
        let (sm, _) = machine();
        let outcome = sm.transition_state(request(PositionState::Tp2Hit)).unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.current_state, PositionState::Open);
        assert_eq!(sm.get_state("BTCUSDT", "p1"), Some(PositionState::Open));
    }

    #[test]
    fn backward_moves_are_rejected() {
        let (sm, _) = machine();
        sm.transition_state(request(PositionState::Tp1Hit)).unwrap();
        let outcome = sm.transition_state(request(PositionState::Open)).unwrap();
        assert!(!outcome.allowed);
        assert_eq!(sm.get_state("BTCUSDT", "p1"), Some(PositionState::Tp1Hit));
    }

    #[test]
    fn closed_is_a_sink() {
        let (sm, _) = machine();
        sm.close_position("BTCUSDT", "p1", "StopLoss", Some(99.0), Some(-10.0))
            .unwrap();
        for target in [
            PositionState::Open,
            PositionState::Tp1Hit,
            PositionState::Closed,
        ] {
            let outcome = sm.transition_state(request(target)).unwrap();
            assert!(!outcome.allowed, "{target} must be rejected from CLOSED");
        }

        let record = sm.get_full_state("BTCUSDT", "p1").unwrap();
        assert_eq!(record.closure_reason.as_deref(), Some("StopLoss"));
        assert_eq!(record.closure_price, Some(99.0));
        assert_eq!(record.closure_pnl, Some(-10.0));
        assert!(record.closed_at_ms.is_some());
    }

    #[test]
    fn metadata_merge_preserves_unrelated_keys() {
        let (sm, _) = machine();

        let mut first = serde_json::Map::new();
        first.insert("entry_note".into(), serde_json::json!("breakout"));
        sm.transition_state(TransitionRequest {
            metadata: Some(first),
            ..request(PositionState::Tp1Hit)
        })
        .unwrap();

        let mut second = serde_json::Map::new();
        second.insert("tp2_note".into(), serde_json::json!("momentum fading"));
        sm.transition_state(TransitionRequest {
            metadata: Some(second),
            ..request(PositionState::Tp2Hit)
        })
        .unwrap();

        let record = sm.get_full_state("BTCUSDT", "p1").unwrap();
        assert_eq!(record.metadata["entry_note"], "breakout");
        assert_eq!(record.metadata["tp2_note"], "momentum fading");
    }

    #[test]
    fn exit_mode_merge_leaves_other_flag_untouched() {
        let (sm, _) = machine();
        sm.transition_state(request(PositionState::Tp1Hit)).unwrap();

        sm.update_exit_mode(
            "BTCUSDT",
            "p1",
            ExitModeUpdate {
                pre_be_mode: Some(true),
                trailing_mode: None,
            },
        )
        .unwrap();
        sm.update_exit_mode(
            "BTCUSDT",
            "p1",
            ExitModeUpdate {
                pre_be_mode: None,
                trailing_mode: Some(true),
            },
        )
        .unwrap();

        let record = sm.get_full_state("BTCUSDT", "p1").unwrap();
        assert!(record.exit_modes.pre_be_mode);
        assert!(record.exit_modes.trailing_mode);
    }

    #[test]
    fn unknown_position_queries_return_none() {
        let (sm, _) = machine();
        assert!(sm.get_state("BTCUSDT", "ghost").is_none());
        assert!(sm.get_full_state("BTCUSDT", "ghost").is_none());
        assert!(sm.get_states_by_symbol("ETHUSDT").is_empty());
    }

    #[test]
    fn statistics_track_distribution_and_age() {
        let (sm, clock) = machine();
        sm.transition_state(request(PositionState::Tp1Hit)).unwrap();
        sm.transition_state(TransitionRequest {
            position_id: "p2".into(),
            ..request(PositionState::Tp1Hit)
        })
        .unwrap();
        clock.advance(2_000);

        let stats = sm.get_statistics();
        assert_eq!(stats.total_positions, 2);
        assert_eq!(stats.by_state.get("TP1_HIT"), Some(&2));
        assert!((stats.average_time_in_state_ms - 2_000.0).abs() < 1.0);

        sm.clear_state("BTCUSDT", "p2");
        assert_eq!(sm.get_statistics().total_positions, 1);
    }
}
