// =============================================================================
// Event Bus — synchronous broadcast of typed engine events
// =============================================================================
//
// Publish is synchronous so that "before" and "after" transitions observed by
// subscribers are correctly ordered with respect to the state changes that
// produced them. Handlers must be fast and must not publish re-entrantly into
// the same kind they handle.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Typed engine event. Payloads carry only plain data so that subscribers can
/// serialise them without reaching back into engine state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    PositionTimeoutWarning {
        position_id: String,
        symbol: String,
        holding_minutes: f64,
    },
    PositionTimeoutCritical {
        position_id: String,
        symbol: String,
        holding_minutes: f64,
    },
    PositionTimeoutTriggered {
        position_id: String,
        symbol: String,
    },
    HealthScoreUpdated {
        position_id: String,
        overall_score: f64,
    },
    DangerLevelChanged {
        position_id: String,
        previous: String,
        current: String,
    },
    RiskAlertTriggered {
        position_id: String,
        symbol: String,
        overall_score: f64,
    },
    EmergencyCloseTriggered {
        position_id: String,
        reason: String,
    },
    OrderExecutionStarted {
        order_id: String,
        symbol: String,
    },
    OrderExecutionFailed {
        order_id: String,
        error: String,
    },
    OrderExecutionTimeout {
        order_id: String,
    },
    ShutdownStarted {
        reason: String,
    },
    ShutdownCompleted {
        cancelled_orders: u32,
        closed_positions: u32,
        state_persisted: bool,
    },
    ShutdownFailed {
        error: String,
    },
    StatePersisted {
        path: String,
    },
    StateRecovered {
        positions: usize,
    },
}

/// Discriminant used for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    PositionTimeoutWarning,
    PositionTimeoutCritical,
    PositionTimeoutTriggered,
    HealthScoreUpdated,
    DangerLevelChanged,
    RiskAlertTriggered,
    EmergencyCloseTriggered,
    OrderExecutionStarted,
    OrderExecutionFailed,
    OrderExecutionTimeout,
    ShutdownStarted,
    ShutdownCompleted,
    ShutdownFailed,
    StatePersisted,
    StateRecovered,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PositionTimeoutWarning { .. } => EventKind::PositionTimeoutWarning,
            Self::PositionTimeoutCritical { .. } => EventKind::PositionTimeoutCritical,
            Self::PositionTimeoutTriggered { .. } => EventKind::PositionTimeoutTriggered,
            Self::HealthScoreUpdated { .. } => EventKind::HealthScoreUpdated,
            Self::DangerLevelChanged { .. } => EventKind::DangerLevelChanged,
            Self::RiskAlertTriggered { .. } => EventKind::RiskAlertTriggered,
            Self::EmergencyCloseTriggered { .. } => EventKind::EmergencyCloseTriggered,
            Self::OrderExecutionStarted { .. } => EventKind::OrderExecutionStarted,
            Self::OrderExecutionFailed { .. } => EventKind::OrderExecutionFailed,
            Self::OrderExecutionTimeout { .. } => EventKind::OrderExecutionTimeout,
            Self::ShutdownStarted { .. } => EventKind::ShutdownStarted,
            Self::ShutdownCompleted { .. } => EventKind::ShutdownCompleted,
            Self::ShutdownFailed { .. } => EventKind::ShutdownFailed,
            Self::StatePersisted { .. } => EventKind::StatePersisted,
            Self::StateRecovered { .. } => EventKind::StateRecovered,
        }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]; pass to
/// [`EventBus::unsubscribe`] to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId {
    kind: EventKind,
    id: u64,
}

/// Synchronous broadcast bus keyed by [`EventKind`].
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(?kind, id, "event subscriber registered");
        SubscriptionId { kind, id }
    }

    /// Remove a previously registered handler. Unknown ids are ignored.
    pub fn unsubscribe(&self, sub: SubscriptionId) {
        let mut subs = self.subscribers.write();
        if let Some(handlers) = subs.get_mut(&sub.kind) {
            handlers.retain(|(id, _)| *id != sub.id);
        }
    }

    /// Deliver `event` to every subscriber of its kind, synchronously, in
    /// registration order. The handler list is snapshotted outside the lock
    /// so handlers may subscribe/unsubscribe without deadlocking.
    pub fn publish(&self, event: Event) {
        let handlers: Vec<Handler> = {
            let subs = self.subscribers.read();
            match subs.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
                None => Vec::new(),
            }
        };

        debug!(kind = ?event.kind(), subscribers = handlers.len(), "publishing event");
        for handler in handlers {
            handler(&event);
        }
    }

    /// Number of handlers currently registered for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .get(&kind)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total: usize = self.subscribers.read().values().map(|v| v.len()).sum();
        f.debug_struct("EventBus")
            .field("subscribers", &total)
            .finish()
    }
}
