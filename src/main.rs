// =============================================================================
// Vela Futures Engine — Main Entry Point
// =============================================================================
//
// Wires the execution fabric together: config, recovery, market data
// streams, the strategy pool, and the graceful shutdown path. The engine
// only places orders through the execution pipeline; strategy signal math is
// whatever processing function gets installed on the pool.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vela_bot::analytics::{PerformanceAnalytics, Period};
use vela_bot::breaker::{BreakerConfig, CircuitBreakerRegistry};
use vela_bot::cache::OrchestratorCache;
use vela_bot::clock::{Clock, SystemClock};
use vela_bot::engine::{EngineDispatcher, StrategyOrchestrator};
use vela_bot::events::EventBus;
use vela_bot::exchange::BinanceFuturesClient;
use vela_bot::execution::{ExecutionConfig, OrderExecutionPipeline};
use vela_bot::journal::JsonlJournal;
use vela_bot::lifecycle::{LifecycleConfig, TradingLifecycleManager};
use vela_bot::market_data::{self, CandleBuffer};
use vela_bot::pool::{PoolConfig, ProcessingFn, StrategyPool};
use vela_bot::position_state::PositionStateMachine;
use vela_bot::positions::PositionBook;
use vela_bot::risk_monitor::{RealTimeRiskMonitor, RiskMonitorConfig};
use vela_bot::runtime_config::{BotConfig, StrategyConfig};
use vela_bot::shutdown::{GracefulShutdownCoordinator, ShutdownConfig};
use vela_bot::types::Priority;

const CONFIG_PATH: &str = "vela_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Vela Futures Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = BotConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        BotConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("VELA_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    // Without explicit strategies, run one normal-priority strategy per
    // symbol on the 1m interval.
    if config.strategies.is_empty() {
        config.strategies = config
            .symbols
            .iter()
            .map(|symbol| StrategyConfig {
                id: format!("default-{}", symbol.to_lowercase()),
                symbol: symbol.clone(),
                interval: "1m".to_string(),
                priority: Priority::Normal,
                timeout_ms: None,
            })
            .collect();
    }

    info!(
        symbols = ?config.symbols,
        strategies = config.strategies.len(),
        workers = config.worker_pool_size,
        "engine configured"
    );

    // ── 2. Core collaborators ────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events = Arc::new(EventBus::new());

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let exchange = Arc::new(BinanceFuturesClient::new(api_key, api_secret));

    let book = Arc::new(PositionBook::new());
    let state_machine = Arc::new(PositionStateMachine::new(clock.clone()));
    state_machine.initialize();
    let journal = Arc::new(JsonlJournal::new(&config.journal_path));
    let breakers = Arc::new(CircuitBreakerRegistry::new(
        BreakerConfig::from(&config),
        clock.clone(),
    ));

    let pipeline = Arc::new(OrderExecutionPipeline::new(
        exchange.clone(),
        events.clone(),
        clock.clone(),
        ExecutionConfig::from(&config),
    ));

    let lifecycle = TradingLifecycleManager::new(
        LifecycleConfig::from(&config),
        clock.clone(),
        events.clone(),
        pipeline.clone(),
        book.clone(),
        state_machine.clone(),
        journal.clone(),
    );

    let monitor = Arc::new(RealTimeRiskMonitor::new(
        RiskMonitorConfig::from(&config),
        clock.clone(),
        events.clone(),
        lifecycle.clone(),
    ));

    // ── 3. Strategy pool & orchestrator cache ────────────────────────────
    let orchestrators: Arc<OrchestratorCache<StrategyOrchestrator>> = Arc::new(
        OrchestratorCache::new(config.orchestrator_cache_size, clock.clone()),
    );

    let process_fn: ProcessingFn = {
        let orchestrators = orchestrators.clone();
        Arc::new(move |job| {
            let orchestrators = orchestrators.clone();
            Box::pin(async move {
                let orchestrator = orchestrators
                    .get_or_insert_with(&job.strategy_id, || {
                        StrategyOrchestrator::new(job.strategy_id.clone())
                    });
                Ok(orchestrator.analyze(&job.candle))
            })
        })
    };

    let pool = StrategyPool::new(
        PoolConfig {
            worker_pool_size: config.worker_pool_size,
            queue_size: config.queue_size,
            default_timeout_ms: config.default_timeout_ms,
        },
        clock.clone(),
    );
    pool.set_processing_fn(process_fn);
    pool.start();

    // ── 4. Shutdown coordinator & state recovery ─────────────────────────
    let coordinator = Arc::new(GracefulShutdownCoordinator::new(
        exchange.clone(),
        lifecycle.clone(),
        pool.clone(),
        book.clone(),
        breakers.clone(),
        events.clone(),
        clock.clone(),
        ShutdownConfig {
            state_dir: config.state_dir.clone().into(),
            shutdown_timeout_seconds: config.shutdown_timeout_seconds,
            symbols: config.symbols.clone(),
        },
    ));

    if let Some(snapshot) = coordinator.recover_state() {
        info!(
            positions = snapshot.positions.len(),
            snapshot_time = %snapshot.snapshot_time,
            "warm-starting from persisted state"
        );
        for position in snapshot.positions {
            lifecycle.track_position(&position);
            book.restore(position);
        }
    }

    // ── 5. Market data streams ───────────────────────────────────────────
    let candle_buffer = Arc::new(CandleBuffer::new(500));
    let (candle_tx, mut candle_rx) = tokio::sync::mpsc::unbounded_channel();

    let mut stream_keys: Vec<(String, String)> = config
        .strategies
        .iter()
        .map(|s| (s.symbol.clone(), s.interval.clone()))
        .collect();
    stream_keys.sort();
    stream_keys.dedup();

    for (symbol, interval) in &stream_keys {
        let buffer = candle_buffer.clone();
        let tx = candle_tx.clone();
        let symbol = symbol.clone();
        let interval = interval.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::run_kline_stream(&symbol, &interval, &buffer, &tx).await
                {
                    error!(symbol = %symbol, interval = %interval, error = %e, "kline stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }
    info!(streams = stream_keys.len(), "market data streams launched");

    // ── 6. Candle consumer ───────────────────────────────────────────────
    let dispatcher = Arc::new(EngineDispatcher::new(
        config.strategies.clone(),
        pool.clone(),
        breakers.clone(),
        book.clone(),
        monitor.clone(),
        lifecycle.clone(),
        candle_buffer.clone(),
        clock.clone(),
    ));

    let consumer_dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        while let Some((key, candle)) = candle_rx.recv().await {
            consumer_dispatcher.on_closed_candle(&key, &candle).await;
        }
        warn!("candle channel closed — dispatch loop ending");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    let result = coordinator.shutdown("signal received").await;
    info!(
        cancelled_orders = result.cancelled_orders,
        closed_positions = result.closed_positions,
        state_persisted = result.state_persisted,
        duration_ms = result.duration_ms,
        "Vela Futures Engine shut down complete."
    );

    // Session report from the journal.
    let analytics = PerformanceAnalytics::new(journal.clone());
    match analytics.get_metrics(Period::All) {
        Ok(metrics) => info!(
            total_trades = metrics.total_trades,
            win_rate = metrics.win_rate,
            profit_factor = metrics.profit_factor,
            total_pnl = metrics.total_pnl,
            max_drawdown_pct = metrics.max_drawdown_pct,
            "session performance"
        ),
        Err(e) => warn!(error = %e, "failed to compute session performance"),
    }

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save config on shutdown");
    }

    Ok(())
}
