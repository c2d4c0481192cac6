// =============================================================================
// Runtime Configuration — Hot-loadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Vela engine. Every tunable lives here so
// the engine can be reconfigured without a rebuild.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Priority;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_worker_pool_size() -> usize {
    4
}

fn default_queue_size() -> usize {
    100
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_timeout_ms() -> u64 {
    30_000
}

fn default_backoff_base() -> u32 {
    2
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

fn default_half_open_attempts() -> u32 {
    3
}

fn default_max_breakers() -> usize {
    50
}

fn default_orchestrator_cache_size() -> usize {
    10
}

fn default_max_holding_time_minutes() -> f64 {
    240.0
}

fn default_warning_threshold_minutes() -> f64 {
    180.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_order_timeout_seconds() -> u64 {
    30
}

fn default_max_slippage_percent() -> f64 {
    0.5
}

fn default_check_interval_candles() -> u32 {
    5
}

fn default_health_score_threshold() -> f64 {
    30.0
}

fn default_shutdown_timeout_seconds() -> u64 {
    60
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_journal_path() -> String {
    "journal.jsonl".to_string()
}

fn default_interval() -> String {
    "1m".to_string()
}

// =============================================================================
// StrategyConfig
// =============================================================================

/// One entry per analysis strategy the engine runs. The processing function
/// itself is injected at startup; this record only carries scheduling data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Unique strategy identifier (breaker key, cache key, job routing key).
    pub id: String,

    /// Symbol this strategy trades.
    pub symbol: String,

    /// Candle interval the strategy consumes (e.g. "1m", "5m").
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Job priority for this strategy's candles.
    #[serde(default)]
    pub priority: Priority,

    /// Per-job timeout override; falls back to `default_timeout_ms`.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level runtime configuration for the Vela engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // --- Symbols & strategies ------------------------------------------------

    /// Symbols the engine watches.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Per-strategy scheduling configuration.
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,

    // --- Worker pool ---------------------------------------------------------

    /// Maximum concurrently executing jobs.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Maximum pending jobs; submissions beyond this fail with QueueFull.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Per-job timeout when the job does not carry its own.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    // --- Circuit breakers ----------------------------------------------------

    /// Consecutive failures in CLOSED before the breaker trips.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Base OPEN duration in milliseconds.
    #[serde(default = "default_breaker_timeout_ms")]
    pub breaker_timeout_ms: u64,

    /// Exponential backoff multiplier applied to repeated OPEN periods.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u32,

    /// Cap on the OPEN duration after backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Successes required in HALF_OPEN to close the breaker.
    #[serde(default = "default_half_open_attempts")]
    pub half_open_attempts: u32,

    /// Soft cap on registry size; exceeding it logs a warning.
    #[serde(default = "default_max_breakers")]
    pub max_breakers: usize,

    // --- Orchestrator cache --------------------------------------------------

    /// LRU capacity for per-strategy orchestrators (>= 1).
    #[serde(default = "default_orchestrator_cache_size")]
    pub orchestrator_cache_size: usize,

    // --- Lifecycle -----------------------------------------------------------

    /// Holding time at which a position becomes CRITICAL.
    #[serde(default = "default_max_holding_time_minutes")]
    pub max_holding_time_minutes: f64,

    /// Holding time at which a position becomes WARNING.
    #[serde(default = "default_warning_threshold_minutes")]
    pub warning_threshold_minutes: f64,

    /// Whether CRITICAL positions are automatically emergency-closed.
    #[serde(default = "default_true")]
    pub enable_automatic_timeout: bool,

    // --- Order execution -----------------------------------------------------

    /// Maximum placement retries for retryable errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between placement retries.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Multiplier applied per retry attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Deadline for the status-polling loop.
    #[serde(default = "default_order_timeout_seconds")]
    pub order_timeout_seconds: u64,

    /// Slippage warning threshold in percent.
    #[serde(default = "default_max_slippage_percent")]
    pub max_slippage_percent: f64,

    // --- Risk monitor --------------------------------------------------------

    /// Health score recomputed every N candles per position.
    #[serde(default = "default_check_interval_candles")]
    pub check_interval_candles: u32,

    /// Overall score below which a position is CRITICAL.
    #[serde(default = "default_health_score_threshold")]
    pub health_score_threshold: f64,

    /// Whether a CRITICAL health score triggers an emergency close.
    #[serde(default = "default_true")]
    pub emergency_close_on_critical: bool,

    // --- Shutdown & persistence ----------------------------------------------

    /// Overall shutdown deadline.
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,

    /// Directory holding the bot state snapshot.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Append-only trade journal file.
    #[serde(default = "default_journal_path")]
    pub journal_path: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            strategies: Vec::new(),
            worker_pool_size: default_worker_pool_size(),
            queue_size: default_queue_size(),
            default_timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            breaker_timeout_ms: default_breaker_timeout_ms(),
            backoff_base: default_backoff_base(),
            max_backoff_ms: default_max_backoff_ms(),
            half_open_attempts: default_half_open_attempts(),
            max_breakers: default_max_breakers(),
            orchestrator_cache_size: default_orchestrator_cache_size(),
            max_holding_time_minutes: default_max_holding_time_minutes(),
            warning_threshold_minutes: default_warning_threshold_minutes(),
            enable_automatic_timeout: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            order_timeout_seconds: default_order_timeout_seconds(),
            max_slippage_percent: default_max_slippage_percent(),
            check_interval_candles: default_check_interval_candles(),
            health_score_threshold: default_health_score_threshold(),
            emergency_close_on_critical: true,
            shutdown_timeout_seconds: default_shutdown_timeout_seconds(),
            state_dir: default_state_dir(),
            journal_path: default_journal_path(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        if config.orchestrator_cache_size == 0 {
            anyhow::bail!("orchestrator_cache_size must be >= 1");
        }
        if config.worker_pool_size == 0 {
            anyhow::bail!("worker_pool_size must be >= 1");
        }

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            strategies = config.strategies.len(),
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}
