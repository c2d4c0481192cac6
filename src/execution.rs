// =============================================================================
// Order Execution Pipeline — retrying placement, status polling, slippage
// =============================================================================
//
// placeOrder flow:
//   1. Assign an orderId if the caller left it empty.
//   2. Place via the exchange client; only retryable errors are retried,
//      with exponential backoff, up to max_retries.
//   3. Poll order status at a bounded rate until a terminal state or the
//      order_timeout_seconds deadline (non-terminal at deadline => TIMEOUT).
//   4. Analyse slippage against the expected price; a breach warns but never
//      cancels retroactively.
//
// The pipeline owns an order only during this placement+polling window;
// afterwards the journal takes over.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::ExchangeError;
use crate::events::{Event, EventBus};
use crate::exchange::ExchangeClient;
use crate::runtime_config::BotConfig;
use crate::types::{Order, OrderStatus};

/// Delay between consecutive status polls.
const POLL_INTERVAL_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Pipeline tunables; a per-call override may replace them.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub order_timeout_seconds: u64,
    pub max_slippage_percent: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            backoff_multiplier: 2.0,
            order_timeout_seconds: 30,
            max_slippage_percent: 0.5,
        }
    }
}

impl From<&BotConfig> for ExecutionConfig {
    fn from(cfg: &BotConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            retry_delay_ms: cfg.retry_delay_ms,
            backoff_multiplier: cfg.backoff_multiplier,
            order_timeout_seconds: cfg.order_timeout_seconds,
            max_slippage_percent: cfg.max_slippage_percent,
        }
    }
}

/// Expected-vs-actual fill price comparison.
#[derive(Debug, Clone, Serialize)]
pub struct SlippageAnalysis {
    pub expected: f64,
    pub actual: f64,
    pub amount: f64,
    pub percent: f64,
    pub within_limits: bool,
}

/// Settled outcome of one placement attempt.
#[derive(Debug, Clone, Serialize)]
pub struct OrderResult {
    pub order_id: String,
    pub success: bool,
    pub status: OrderStatus,
    pub filled_quantity: f64,
    pub average_price: f64,
    pub slippage: Option<SlippageAnalysis>,
    pub retry_count: u32,
    pub execution_time_ms: u64,
    pub error: Option<String>,
}

/// Aggregate pipeline metrics. Each `get_metrics` call returns an independent
/// copy.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMetrics {
    pub total_orders: u64,
    pub successful_orders: u64,
    pub failed_orders: u64,
    pub average_execution_time_ms: f64,
    pub average_slippage_percent: f64,
    pub average_retries: f64,
    pub total_retries: u64,
}

#[derive(Debug, Default)]
struct MetricsAcc {
    total_orders: u64,
    successful_orders: u64,
    failed_orders: u64,
    total_execution_ms: u64,
    total_slippage_percent: f64,
    slippage_samples: u64,
    total_retries: u64,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct OrderExecutionPipeline {
    exchange: Arc<dyn ExchangeClient>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: ExecutionConfig,
    metrics: Mutex<MetricsAcc>,
}

impl OrderExecutionPipeline {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            exchange,
            events,
            clock,
            config,
            metrics: Mutex::new(MetricsAcc::default()),
        }
    }

    /// Place an order and follow it to a terminal state.
    pub async fn place_order(
        &self,
        mut order: Order,
        config_override: Option<ExecutionConfig>,
    ) -> OrderResult {
        let config = config_override.unwrap_or_else(|| self.config.clone());
        let started_at = self.clock.now_ms();

        if order.order_id.is_empty() {
            order.order_id = Uuid::new_v4().to_string();
        }

        info!(
            order_id = %order.order_id,
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            quantity = order.quantity,
            price = order.price,
            "order execution started"
        );
        self.events.publish(Event::OrderExecutionStarted {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
        });

        // -----------------------------------------------------------------
        // Placement with bounded retries for retryable errors
        // -----------------------------------------------------------------
        let mut retry_count: u32 = 0;
        let ack = loop {
            match self.exchange.place_order(&order).await {
                Ok(ack) => break ack,
                Err(e) => {
                    if e.is_retryable() && retry_count < config.max_retries {
                        let delay = (config.retry_delay_ms as f64
                            * config.backoff_multiplier.powi(retry_count as i32))
                            as u64;
                        retry_count += 1;
                        warn!(
                            order_id = %order.order_id,
                            attempt = retry_count,
                            max_retries = config.max_retries,
                            delay_ms = delay,
                            error = %e,
                            "retryable placement failure — backing off"
                        );
                        self.clock.sleep(delay).await;
                        continue;
                    }

                    // Non-retryable errors fail with retry_count = 0.
                    let final_retries = if e.is_retryable() { retry_count } else { 0 };
                    return self.fail(
                        &order,
                        OrderStatus::Failed,
                        final_retries,
                        started_at,
                        format!("order placement failed: {e}"),
                    );
                }
            }
        };

        if ack.order_id.is_empty() {
            return self.fail(
                &order,
                OrderStatus::Failed,
                retry_count,
                started_at,
                "invalid order result".to_string(),
            );
        }
        let exchange_order_id = ack.order_id;

        // -----------------------------------------------------------------
        // Status polling until terminal or deadline
        // -----------------------------------------------------------------
        let deadline = started_at + config.order_timeout_seconds * 1000;
        debug!(order_id = %order.order_id, ack_status = %ack.status, "order acknowledged — polling");
        let mut status;
        let mut filled_quantity = 0.0;
        let mut average_price = 0.0;
        let mut poll_error: Option<String> = None;

        // Always read the status at least once: the fill quantity only comes
        // from status reads, never from the placement ack.
        loop {
            match self
                .exchange
                .order_status(&order.symbol, &exchange_order_id)
                .await
            {
                Ok(report) => {
                    status = OrderStatus::from_exchange(&report.status);
                    filled_quantity = report.executed_quantity;
                    average_price = report.average_price;
                    debug!(
                        order_id = %order.order_id,
                        status = %status,
                        filled = filled_quantity,
                        "order status polled"
                    );
                }
                Err(e) => {
                    // Read errors are terminal for the polling loop.
                    warn!(order_id = %order.order_id, error = %e, "order status read failed");
                    status = OrderStatus::Failed;
                    poll_error = Some(format!("order status read failed: {e}"));
                }
            }

            if status.is_terminal() {
                break;
            }

            if self.clock.now_ms() >= deadline {
                warn!(
                    order_id = %order.order_id,
                    status = %status,
                    "order still non-terminal at deadline — timeout"
                );
                self.events.publish(Event::OrderExecutionTimeout {
                    order_id: order.order_id.clone(),
                });
                return self.fail(
                    &order,
                    OrderStatus::Timeout,
                    retry_count,
                    started_at,
                    format!(
                        "order status timeout after {}s",
                        config.order_timeout_seconds
                    ),
                );
            }

            self.clock.sleep(POLL_INTERVAL_MS).await;
        }

        let success = status == OrderStatus::Filled && filled_quantity > 0.0;
        if !success {
            let message = poll_error
                .unwrap_or_else(|| format!("order reached terminal status {status} unfilled"));
            return self.fail(&order, status, retry_count, started_at, message);
        }

        // -----------------------------------------------------------------
        // Slippage analysis (warn-only)
        // -----------------------------------------------------------------
        let slippage = (order.price > 0.0 && average_price > 0.0).then(|| {
            let amount = average_price - order.price;
            let percent = (amount.abs() / order.price) * 100.0;
            let within_limits = percent <= config.max_slippage_percent;
            if !within_limits {
                warn!(
                    order_id = %order.order_id,
                    expected = order.price,
                    actual = average_price,
                    slippage_pct = percent,
                    limit_pct = config.max_slippage_percent,
                    "Slippage exceeds limits"
                );
            }
            SlippageAnalysis {
                expected: order.price,
                actual: average_price,
                amount,
                percent,
                within_limits,
            }
        });

        let execution_time_ms = self.clock.now_ms().saturating_sub(started_at);
        {
            let mut m = self.metrics.lock();
            m.total_orders += 1;
            m.successful_orders += 1;
            m.total_execution_ms += execution_time_ms;
            m.total_retries += retry_count as u64;
            if let Some(s) = &slippage {
                m.total_slippage_percent += s.percent;
                m.slippage_samples += 1;
            }
        }

        info!(
            order_id = %order.order_id,
            filled = filled_quantity,
            avg_price = average_price,
            retries = retry_count,
            ms = execution_time_ms,
            "order filled"
        );

        OrderResult {
            order_id: order.order_id,
            success: true,
            status,
            filled_quantity,
            average_price,
            slippage,
            retry_count,
            execution_time_ms,
            error: None,
        }
    }

    fn fail(
        &self,
        order: &Order,
        status: OrderStatus,
        retry_count: u32,
        started_at: u64,
        error: String,
    ) -> OrderResult {
        let execution_time_ms = self.clock.now_ms().saturating_sub(started_at);
        {
            let mut m = self.metrics.lock();
            m.total_orders += 1;
            m.failed_orders += 1;
            m.total_execution_ms += execution_time_ms;
            m.total_retries += retry_count as u64;
        }

        warn!(order_id = %order.order_id, status = %status, error = %error, "order failed");
        self.events.publish(Event::OrderExecutionFailed {
            order_id: order.order_id.clone(),
            error: error.clone(),
        });

        OrderResult {
            order_id: order.order_id.clone(),
            success: false,
            status,
            filled_quantity: 0.0,
            average_price: 0.0,
            slippage: None,
            retry_count,
            execution_time_ms,
            error: Some(error),
        }
    }

    // -------------------------------------------------------------------------
    // Metrics
    // -------------------------------------------------------------------------

    pub fn get_metrics(&self) -> ExecutionMetrics {
        let m = self.metrics.lock();
        ExecutionMetrics {
            total_orders: m.total_orders,
            successful_orders: m.successful_orders,
            failed_orders: m.failed_orders,
            average_execution_time_ms: if m.total_orders == 0 {
                0.0
            } else {
                m.total_execution_ms as f64 / m.total_orders as f64
            },
            average_slippage_percent: if m.slippage_samples == 0 {
                0.0
            } else {
                m.total_slippage_percent / m.slippage_samples as f64
            },
            average_retries: if m.total_orders == 0 {
                0.0
            } else {
                m.total_retries as f64 / m.total_orders as f64
            },
            total_retries: m.total_retries,
        }
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock() = MetricsAcc::default();
        debug!("execution metrics reset");
    }
}

impl std::fmt::Debug for OrderExecutionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutionPipeline")
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
    use crate::exchange::{ExchangePosition, OrderAck, OrderStatusReport};
    use crate::types::{OrderSide, OrderType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scriptable in-memory exchange: placement errors to emit before
    /// succeeding, then a sequence of status strings to report.
    struct MockExchange {
        place_errors: Mutex<Vec<ExchangeError>>,
        place_calls: AtomicU32,
        statuses: Mutex<Vec<OrderStatusReport>>,
        status_error: Mutex<Option<ExchangeError>>,
    }

    impl MockExchange {
        fn filled_at(price: f64) -> Self {
            Self {
                place_errors: Mutex::new(Vec::new()),
                place_calls: AtomicU32::new(0),
                statuses: Mutex::new(vec![OrderStatusReport {
                    status: "FILLED".into(),
                    executed_quantity: 1.0,
                    average_price: price,
                }]),
                status_error: Mutex::new(None),
            }
        }

        fn with_place_errors(mut errors: Vec<ExchangeError>, price: f64) -> Self {
            errors.reverse(); // pop from the back in order
            Self {
                place_errors: Mutex::new(errors),
                ..Self::filled_at(price)
            }
        }
    }

    #[async_trait]
    impl ExchangeClient for MockExchange {
        async fn place_order(&self, order: &Order) -> Result<OrderAck, ExchangeError> {
            self.place_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.place_errors.lock().pop() {
                return Err(err);
            }
            Ok(OrderAck {
                order_id: format!("ex-{}", order.order_id),
                status: "NEW".into(),
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
            if let Some(err) = self.status_error.lock().take() {
                return Err(err);
            }
            let mut statuses = self.statuses.lock();
            if statuses.len() > 1 {
                Ok(statuses.remove(0))
            } else {
                Ok(statuses[0].clone())
            }
        }

        async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
            Ok(Vec::new())
        }
    }

    fn order(price: f64) -> Order {
        Order {
            order_id: String::new(),
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            quantity: 1.0,
            price,
            time_in_force: Some("GTC".into()),
        }
    }

    fn pipeline(exchange: Arc<MockExchange>) -> (OrderExecutionPipeline, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let clock = Arc::new(ManualClock::new(0));
        (
            OrderExecutionPipeline::new(exchange, events.clone(), clock, ExecutionConfig::default()),
            events,
        )
    }

    #[tokio::test]
    async fn successful_fill_reports_slippage_within_limits() {
        let exchange = Arc::new(MockExchange::filled_at(100.2));
        let (pipeline, _) = pipeline(exchange);

        let result = pipeline.place_order(order(100.0), None).await;
        assert!(result.success);
        assert_eq!(result.status, OrderStatus::Filled);
        assert!(result.filled_quantity > 0.0);
        assert_eq!(result.retry_count, 0);

        let slippage = result.slippage.unwrap();
        assert!((slippage.percent - 0.2).abs() < 1e-9);
        assert!(slippage.within_limits);

        let metrics = pipeline.get_metrics();
        assert_eq!(metrics.total_orders, 1);
        assert_eq!(metrics.successful_orders, 1);
        assert!((metrics.average_slippage_percent - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn slippage_breach_warns_but_does_not_fail() {
        let exchange = Arc::new(MockExchange::filled_at(101.0)); // 1% slip
        let (pipeline, _) = pipeline(exchange);

        let result = pipeline.place_order(order(100.0), None).await;
        assert!(result.success);
        let slippage = result.slippage.unwrap();
        assert!((slippage.percent - 1.0).abs() < 1e-9);
        assert!(!slippage.within_limits);
    }

    #[tokio::test]
    async fn non_retryable_error_fails_immediately_with_zero_retries() {
        // Retry-cap scenario: the exchange must see exactly one call.
        let exchange = Arc::new(MockExchange::with_place_errors(
            vec![ExchangeError::Rejected("lot size".into())],
            100.0,
        ));
        let (pipeline, _) = pipeline(exchange.clone());

        let result = pipeline.place_order(order(100.0), None).await;
        assert!(!result.success);
        assert_eq!(result.status, OrderStatus::Failed);
        assert_eq!(result.retry_count, 0);
        assert_eq!(exchange.place_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_then_succeed() {
        let exchange = Arc::new(MockExchange::with_place_errors(
            vec![
                ExchangeError::Transport("reset".into()),
                ExchangeError::RateLimited("429".into()),
            ],
            100.0,
        ));
        let (pipeline, _) = pipeline(exchange.clone());

        let result = pipeline.place_order(order(100.0), None).await;
        assert!(result.success);
        assert_eq!(result.retry_count, 2);
        assert_eq!(exchange.place_calls.load(Ordering::SeqCst), 3);
        assert_eq!(pipeline.get_metrics().total_retries, 2);
    }

    #[tokio::test]
    async fn retryable_errors_exhaust_the_cap() {
        let errors = (0..10)
            .map(|i| ExchangeError::Transport(format!("fail {i}")))
            .collect();
        let exchange = Arc::new(MockExchange::with_place_errors(errors, 100.0));
        let (pipeline, _) = pipeline(exchange.clone());

        let result = pipeline.place_order(order(100.0), None).await;
        assert!(!result.success);
        assert_eq!(result.status, OrderStatus::Failed);
        assert_eq!(result.retry_count, 3);
        // Initial attempt + 3 retries.
        assert_eq!(exchange.place_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_terminal_at_deadline_yields_timeout() {
        let exchange = Arc::new(MockExchange::filled_at(100.0));
        *exchange.statuses.lock() = vec![OrderStatusReport {
            status: "NEW".into(),
            executed_quantity: 0.0,
            average_price: 0.0,
        }];
        let (pipeline, events) = pipeline(exchange);

        let timeouts = Arc::new(Mutex::new(0u32));
        let sink = timeouts.clone();
        events.subscribe(crate::events::EventKind::OrderExecutionTimeout, move |_| {
            *sink.lock() += 1;
        });

        let result = pipeline.place_order(order(100.0), None).await;
        assert!(!result.success);
        assert_eq!(result.status, OrderStatus::Timeout);
        assert!(result.error.unwrap().contains("timeout"));
        assert_eq!(*timeouts.lock(), 1);
    }

    #[tokio::test]
    async fn status_read_error_is_terminal_failure() {
        let exchange = Arc::new(MockExchange::filled_at(100.0));
        *exchange.status_error.lock() = Some(ExchangeError::Transport("disconnect".into()));
        let (pipeline, _) = pipeline(exchange);

        let result = pipeline.place_order(order(100.0), None).await;
        assert!(!result.success);
        assert_eq!(result.status, OrderStatus::Failed);
        assert!(result.error.unwrap().contains("status read failed"));
    }

    #[tokio::test]
    async fn cancelled_order_is_unsuccessful() {
        let exchange = Arc::new(MockExchange::filled_at(100.0));
        *exchange.statuses.lock() = vec![OrderStatusReport {
            status: "CANCELED".into(),
            executed_quantity: 0.0,
            average_price: 0.0,
        }];
        let (pipeline, _) = pipeline(exchange);

        let result = pipeline.place_order(order(100.0), None).await;
        assert!(!result.success);
        assert_eq!(result.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn reset_metrics_zeroes_all_counters() {
        let exchange = Arc::new(MockExchange::filled_at(100.1));
        let (pipeline, _) = pipeline(exchange);

        pipeline.place_order(order(100.0), None).await;
        assert_eq!(pipeline.get_metrics().total_orders, 1);

        pipeline.reset_metrics();
        let metrics = pipeline.get_metrics();
        assert_eq!(metrics.total_orders, 0);
        assert_eq!(metrics.successful_orders, 0);
        assert_eq!(metrics.failed_orders, 0);
        assert_eq!(metrics.total_retries, 0);
        assert!((metrics.average_execution_time_ms - 0.0).abs() < f64::EPSILON);
        assert!((metrics.average_slippage_percent - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn order_id_is_generated_when_absent() {
        let exchange = Arc::new(MockExchange::filled_at(100.0));
        let (pipeline, _) = pipeline(exchange);
        let result = pipeline.place_order(order(100.0), None).await;
        assert!(!result.order_id.is_empty());
    }
}
