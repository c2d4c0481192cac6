// =============================================================================
// Shared types used across the Vela trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Sides
// ---------------------------------------------------------------------------

/// Direction of a held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The order side that closes a position held in this direction.
    pub fn closing_order_side(&self) -> OrderSide {
        match self {
            Self::Long => OrderSide::Sell,
            Self::Short => OrderSide::Buy,
        }
    }

    /// +1.0 for longs, -1.0 for shorts. Used in PnL arithmetic.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Direction of an order sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Job priority
// ---------------------------------------------------------------------------

/// Scheduling priority of an analysis job. Higher priorities are dequeued
/// first; within a priority class the queue is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "HIGH"),
            Self::Normal => write!(f, "NORMAL"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order type supported by the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
        }
    }
}

/// An order as submitted to the execution pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Exchange-visible identifier. Generated (UUID v4) if left empty.
    #[serde(default)]
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price; also the expected fill price for slippage analysis.
    pub price: f64,
    /// e.g. "GTC" / "IOC". Forwarded verbatim to the exchange.
    #[serde(default)]
    pub time_in_force: Option<String>,
}

/// Internal order status, mapped from the exchange's status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
    Timeout,
}

impl OrderStatus {
    /// Terminal states stop the status-polling loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Cancelled | Self::Failed | Self::Timeout
        )
    }

    /// Map an exchange status string onto the internal status.
    ///
    /// Unrecognised strings map to `Pending` so polling continues until the
    /// deadline; only read errors terminate polling early.
    pub fn from_exchange(status: &str) -> Self {
        match status.to_uppercase().as_str() {
            "FILLED" => Self::Filled,
            "PARTIALLY_FILLED" | "PARTIALLYFILLED" => Self::PartiallyFilled,
            "CANCELED" | "CANCELLED" => Self::Cancelled,
            "REJECTED" => Self::Failed,
            "NEW" | "CREATED" => Self::Pending,
            other => {
                tracing::warn!(status = other, "unrecognised exchange order status");
                Self::Pending
            }
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_side_inverts_direction() {
        assert_eq!(Side::Long.closing_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.closing_order_side(), OrderSide::Buy);
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn status_mapping_from_exchange_strings() {
        assert_eq!(OrderStatus::from_exchange("FILLED"), OrderStatus::Filled);
        assert_eq!(
            OrderStatus::from_exchange("PARTIALLY_FILLED"),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(OrderStatus::from_exchange("CANCELED"), OrderStatus::Cancelled);
        assert_eq!(OrderStatus::from_exchange("Rejected"), OrderStatus::Failed);
        assert_eq!(OrderStatus::from_exchange("NEW"), OrderStatus::Pending);
        assert_eq!(OrderStatus::from_exchange("CREATED"), OrderStatus::Pending);
        // Vendor quirk: unknown strings keep the order in PENDING.
        assert_eq!(OrderStatus::from_exchange("WEIRD"), OrderStatus::Pending);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::Timeout.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
