// =============================================================================
// Error taxonomy — drives retry classification across the engine
// =============================================================================
//
// Exchange failures fall into five kinds. The order pipeline retries only
// `Retryable`; the shutdown coordinator retries then degrades; everything
// else is terminal for the operation that hit it.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

/// Typed exchange error. Every adapter failure is normalised into one of
/// these variants before it reaches the retry logic.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Exchange throttled the request (HTTP 429/418).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Transient network or server-side failure (connection errors, 5xx).
    #[error("transport error: {0}")]
    Transport(String),

    /// The exchange understood and refused the request.
    #[error("order rejected: {0}")]
    Rejected(String),

    /// Not enough margin/balance to take the position.
    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),

    /// The request was malformed before it ever left the bot.
    #[error("validation error: {0}")]
    Validation(String),

    /// The request deadline elapsed before a response arrived.
    #[error("request timeout: {0}")]
    Timeout(String),

    /// Anything we could not classify; the original message is preserved.
    #[error("unknown exchange error: {0}")]
    Unknown(String),
}

/// Coarse classification used by recovery policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Retryable,
    NonRetryable,
    Validation,
    Timeout,
    Unknown,
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited(_) | Self::Transport(_) => ErrorKind::Retryable,
            Self::Rejected(_) | Self::InsufficientMargin(_) => ErrorKind::NonRetryable,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// True for the kinds the order pipeline may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Normalise a foreign error into the taxonomy, preserving its message
    /// chain.
    pub fn normalize(err: anyhow::Error) -> Self {
        Self::Unknown(format!("{err:#}"))
    }
}
