// =============================================================================
// Exchange Client — trait surface + Binance USDT-M futures adapter
// =============================================================================
//
// The engine only ever talks to the `ExchangeClient` trait; tests inject
// in-memory fakes, production injects `BinanceFuturesClient`.
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against the exchange servers.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::errors::ExchangeError;
use crate::types::Order;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Acknowledgement returned by a successful order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    /// Raw exchange status string (e.g. "NEW").
    pub status: String,
}

/// Point-in-time order state read from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusReport {
    /// Raw exchange status string, mapped via `OrderStatus::from_exchange`.
    pub status: String,
    pub executed_quantity: f64,
    pub average_price: f64,
}

/// An open position as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Signed quantity: positive long, negative short.
    pub position_amount: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Minimal exchange surface the core consumes.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_order(&self, order: &Order) -> Result<OrderAck, ExchangeError>;

    /// Cancel every working order on `symbol`. Returns the cancelled count
    /// when the exchange reports one.
    async fn cancel_all_orders(&self, symbol: &str) -> Result<u32, ExchangeError>;

    /// Cancel conditional (stop/take-profit) orders; `None` means all
    /// symbols.
    async fn cancel_all_conditional_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<u32, ExchangeError>;

    async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, ExchangeError>;

    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;
}

// ---------------------------------------------------------------------------
// Binance USDT-M futures adapter
// ---------------------------------------------------------------------------

/// Binance futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFuturesClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceFuturesClient initialised (base_url=https://fapi.binance.com)");

        Self {
            secret: secret.into(),
            base_url: "https://fapi.binance.com".to_string(),
            client,
        }
    }

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Issue a signed request and normalise the outcome into the error
    /// taxonomy that drives retry decisions.
    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);

        let resp = self
            .client
            .request(method.clone(), &url)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::Timeout(format!("{method} {path}: {e}"))
                } else {
                    ExchangeError::Transport(format!("{method} {path}: {e}"))
                }
            })?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transport(format!("{method} {path} body: {e}")))?;

        if status.is_success() {
            return Ok(body);
        }

        let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
        let msg = format!("{method} {path} returned {status}: {body}");

        Err(match status.as_u16() {
            429 | 418 => ExchangeError::RateLimited(msg),
            s if s >= 500 => ExchangeError::Transport(msg),
            _ if code == -2019 => ExchangeError::InsufficientMargin(msg),
            _ => ExchangeError::Rejected(msg),
        })
    }
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    /// POST /fapi/v1/order (signed).
    #[instrument(skip(self, order), fields(symbol = %order.symbol), name = "binance::place_order")]
    async fn place_order(&self, order: &Order) -> Result<OrderAck, ExchangeError> {
        if order.quantity <= 0.0 {
            return Err(ExchangeError::Validation(format!(
                "quantity must be positive, got {}",
                order.quantity
            )));
        }

        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            order.symbol, order.side, order.order_type, order.quantity
        );
        if order.order_type == crate::types::OrderType::Limit {
            params.push_str(&format!("&price={}", order.price));
            let tif = order.time_in_force.as_deref().unwrap_or("GTC");
            params.push_str(&format!("&timeInForce={tif}"));
        }
        if !order.order_id.is_empty() {
            params.push_str(&format!("&newClientOrderId={}", order.order_id));
        }

        let body = self
            .send_signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;

        let order_id = body
            .get("orderId")
            .and_then(|v| v.as_u64())
            .map(|id| id.to_string())
            .or_else(|| {
                body.get("clientOrderId")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                ExchangeError::Unknown(format!("order response missing orderId: {body}"))
            })?;

        let status = body
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("NEW")
            .to_string();

        debug!(order_id = %order_id, status = %status, "order placed");
        Ok(OrderAck { order_id, status })
    }

    /// DELETE /fapi/v1/allOpenOrders (signed).
    #[instrument(skip(self), name = "binance::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> Result<u32, ExchangeError> {
        let params = format!("symbol={symbol}");
        self.send_signed(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", &params)
            .await?;
        debug!(symbol, "all open orders cancelled");
        // The endpoint acknowledges without a count; report one batch.
        Ok(1)
    }

    /// Conditional orders share the allOpenOrders endpoint on USDT-M futures;
    /// without a symbol we sweep every configured symbol via positionRisk.
    #[instrument(skip(self), name = "binance::cancel_all_conditional_orders")]
    async fn cancel_all_conditional_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<u32, ExchangeError> {
        match symbol {
            Some(s) => self.cancel_all_orders(s).await,
            None => {
                let mut cancelled = 0;
                for pos in self.positions().await? {
                    if pos.position_amount.abs() > 0.0 {
                        cancelled += self.cancel_all_orders(&pos.symbol).await?;
                    }
                }
                Ok(cancelled)
            }
        }
    }

    /// GET /fapi/v1/order (signed).
    #[instrument(skip(self), name = "binance::order_status")]
    async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, ExchangeError> {
        // Numeric ids are exchange ids, anything else is a client order id.
        let params = if order_id.chars().all(|c| c.is_ascii_digit()) {
            format!("symbol={symbol}&orderId={order_id}")
        } else {
            format!("symbol={symbol}&origClientOrderId={order_id}")
        };

        let body = self
            .send_signed(reqwest::Method::GET, "/fapi/v1/order", &params)
            .await?;

        let status = body
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("NEW")
            .to_string();
        let executed_quantity = parse_f64_field(&body, "executedQty");
        let average_price = parse_f64_field(&body, "avgPrice");

        Ok(OrderStatusReport {
            status,
            executed_quantity,
            average_price,
        })
    }

    /// GET /fapi/v2/positionRisk (signed).
    #[instrument(skip(self), name = "binance::positions")]
    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let body = self
            .send_signed(reqwest::Method::GET, "/fapi/v2/positionRisk", "")
            .await?;

        let rows = match body.as_array() {
            Some(rows) => rows,
            None => {
                warn!("positionRisk response was not an array");
                return Ok(Vec::new());
            }
        };

        Ok(rows
            .iter()
            .filter_map(|row| {
                let symbol = row.get("symbol")?.as_str()?.to_string();
                Some(ExchangePosition {
                    symbol,
                    position_amount: parse_f64_field(row, "positionAmt"),
                    entry_price: parse_f64_field(row, "entryPrice"),
                    unrealized_pnl: parse_f64_field(row, "unRealizedProfit"),
                })
            })
            .collect())
    }
}

/// Binance sends numeric fields as JSON strings on futures endpoints.
fn parse_f64_field(body: &serde_json::Value, field: &str) -> f64 {
    body.get(field)
        .and_then(|v| match v {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_f64(),
            _ => None,
        })
        .unwrap_or(0.0)
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
