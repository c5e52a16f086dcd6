//! Binance USDⓈ-M futures integration.
//!
//! Signed REST client covering the four operations the engine needs:
//! klines, position snapshot, cancel-all and batch order placement.
//!
//! API docs: https://developers.binance.com/docs/derivatives/usds-margined-futures
//! Base URL: https://fapi.binance.com (testnet: https://testnet.binancefuture.com)
//! Auth: `X-MBX-APIKEY` header plus HMAC-SHA256 `signature` query parameter.
//! Batch orders: at most 5 per request.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::{Client, Method};
use rust_decimal::prelude::*;
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::signing::{encode_query, sign_query};
use super::Exchange;
use crate::types::{BotError, BotResult, Candle, OrderRequest, Position};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub const MAINNET_URL: &str = "https://fapi.binance.com";
pub const TESTNET_URL: &str = "https://testnet.binancefuture.com";
const PLATFORM_NAME: &str = "binance";

/// Maximum orders accepted by `/fapi/v1/batchOrders`.
const MAX_BATCH_ORDERS: usize = 5;

/// Maximum klines per request.
pub const MAX_KLINES: u32 = 1500;

const RECV_WINDOW_MS: u64 = 5000;

// ---------------------------------------------------------------------------
// API response types (Binance JSON → Rust)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    #[serde(default)]
    filters: Vec<SymbolFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
enum SymbolFilter {
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    Price { tick_size: String },
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize { step_size: String },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional { notional: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

// ---------------------------------------------------------------------------
// Symbol trading rules
// ---------------------------------------------------------------------------

/// Precision and size constraints for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRules {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
}

impl SymbolRules {
    fn from_filters(filters: &[SymbolFilter]) -> Option<Self> {
        let mut tick = None;
        let mut step = None;
        let mut min_notional = Decimal::ZERO;
        for filter in filters {
            match filter {
                SymbolFilter::Price { tick_size } => tick = Decimal::from_str(tick_size).ok(),
                SymbolFilter::LotSize { step_size } => step = Decimal::from_str(step_size).ok(),
                SymbolFilter::MinNotional { notional } => {
                    min_notional = Decimal::from_str(notional).ok()?
                }
                SymbolFilter::Other => {}
            }
        }
        Some(Self {
            tick_size: tick?,
            step_size: step?,
            min_notional,
        })
    }

    /// Round price and quantity down to the venue's increments and check
    /// the minimum notional. Returns the wire strings for both.
    pub fn format_order(&self, price: f64, quantity: f64) -> BotResult<(String, String)> {
        let price = to_decimal(price)?;
        let quantity = to_decimal(quantity)?;
        let price = floor_to(price, self.tick_size);
        let quantity = floor_to(quantity, self.step_size);

        if price <= Decimal::ZERO || quantity <= Decimal::ZERO {
            return Err(BotError::Rejected(format!(
                "order rounds to zero (price={price}, quantity={quantity})"
            )));
        }
        let notional = price * quantity;
        if notional < self.min_notional {
            return Err(BotError::Rejected(format!(
                "notional {notional} below minimum {}",
                self.min_notional
            )));
        }
        Ok((price.normalize().to_string(), quantity.normalize().to_string()))
    }
}

fn to_decimal(value: f64) -> BotResult<Decimal> {
    Decimal::from_f64(value)
        .ok_or_else(|| BotError::InvalidInput(format!("cannot represent {value} as decimal")))
}

fn floor_to(value: Decimal, increment: Decimal) -> Decimal {
    if increment.is_zero() {
        return value;
    }
    (value / increment).floor() * increment
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Map a non-success HTTP response to the engine's error taxonomy.
///
/// Throttling, timeouts and server faults are transient. A client error on
/// order placement means the venue refused the order.
pub fn classify_failure(status: u16, body: &str, placing_orders: bool) -> BotError {
    let detail = match serde_json::from_str::<ApiError>(body) {
        Ok(err) => format!("HTTP {status} code {}: {}", err.code, err.msg),
        Err(_) => format!("HTTP {status}: {body}"),
    };
    let transient = matches!(status, 408 | 418 | 429) || status >= 500;
    if placing_orders && !transient && (400..500).contains(&status) {
        BotError::Rejected(detail)
    } else {
        BotError::Connectivity(detail)
    }
}

/// Parse one kline row: `[openTime, open, high, low, close, volume, ...]`.
fn parse_kline(row: &[serde_json::Value]) -> Option<Candle> {
    let num = |i: usize| -> Option<f64> { row.get(i)?.as_str()?.parse().ok() };
    let open_ms = row.first()?.as_i64()?;
    Some(Candle {
        open_time: Utc.timestamp_millis_opt(open_ms).single()?,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    })
}

/// Parse every kline row, failing on the first malformed one.
fn parse_klines(rows: &[Vec<serde_json::Value>]) -> BotResult<Vec<Candle>> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            parse_kline(row)
                .ok_or_else(|| BotError::Connectivity(format!("Malformed kline row {i}: {row:?}")))
        })
        .collect()
}

/// Convert position risk rows, failing on an unreadable amount.
fn parse_positions(risks: Vec<PositionRisk>) -> BotResult<Vec<Position>> {
    risks
        .into_iter()
        .map(|r| -> BotResult<Position> {
            let net_exposure = r.position_amt.parse().map_err(|_| {
                BotError::Connectivity(format!(
                    "Malformed positionAmt '{}' for {}",
                    r.position_amt, r.symbol
                ))
            })?;
            Ok(Position {
                symbol: r.symbol,
                net_exposure,
            })
        })
        .collect()
}

/// Collect per-order errors from a batch placement response.
fn batch_errors(items: &[serde_json::Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| serde_json::from_value::<ApiError>(item.clone()).ok())
        .map(|e| format!("code {}: {}", e.code, e.msg))
        .collect()
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Credentials {
    api_key: String,
    api_secret: Secret<String>,
}

/// Binance USDⓈ-M futures client.
pub struct BinanceFuturesClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
    candle_limit: u32,
    rules: HashMap<String, SymbolRules>,
}

impl BinanceFuturesClient {
    /// Create a new client.
    ///
    /// Credentials are optional: klines are public, everything else is
    /// signed and fails with a connectivity error without them.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        api_secret: Option<Secret<String>>,
        candle_limit: u32,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("EMAGRID/0.1.0 (grid-bot)")
            .build()
            .context("Failed to build HTTP client for Binance")?;

        let credentials = match (api_key, api_secret) {
            (Some(api_key), Some(api_secret)) if !api_key.is_empty() => Some(Credentials {
                api_key,
                api_secret,
            }),
            _ => None,
        };

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            candle_limit: candle_limit.clamp(1, MAX_KLINES),
            rules: HashMap::new(),
        })
    }

    /// Load symbol trading rules. Call once before placing orders.
    pub async fn connect(mut self) -> BotResult<Self> {
        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        self.rules = info
            .symbols
            .iter()
            .filter_map(|s| SymbolRules::from_filters(&s.filters).map(|r| (s.symbol.clone(), r)))
            .collect();
        info!(symbols = self.rules.len(), base = %self.base_url, "Binance trading rules loaded");
        Ok(self)
    }

    // -- Internal helpers ------------------------------------------------

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> BotResult<T> {
        let mut url = format!("{}{path}", self.base_url);
        if !params.is_empty() {
            url = format!("{url}?{}", encode_query(params));
        }
        debug!(url = %url, "Binance public request");
        let body = self.send(self.http.get(&url), false).await?;
        parse_body(&body, path)
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> BotResult<T> {
        let creds = self.credentials.as_ref().ok_or_else(|| {
            BotError::Connectivity(format!("{path} requires API credentials"))
        })?;

        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query = encode_query(&params);
        let signature = sign_query(&query, creds.api_secret.expose_secret())?;
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);

        debug!(method = %method, path, "Binance signed request");
        let placing = path.ends_with("Orders") && method == Method::POST;
        let req = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &creds.api_key);
        let body = self.send(req, placing).await?;
        parse_body(&body, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder, placing: bool) -> BotResult<String> {
        let resp = req
            .send()
            .await
            .map_err(|e| BotError::Connectivity(format!("Binance request failed: {e}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| BotError::Connectivity(format!("Binance response unreadable: {e}")))?;
        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &body, placing));
        }
        Ok(body)
    }

    fn batch_payload(&self, orders: &[OrderRequest]) -> BotResult<String> {
        let mut items = Vec::with_capacity(orders.len());
        for order in orders {
            let (price, quantity) = match self.rules.get(&order.symbol) {
                Some(rules) => rules.format_order(order.price, order.quantity)?,
                None => {
                    warn!(symbol = %order.symbol, "No trading rules loaded, sending unrounded order");
                    (
                        to_decimal(order.price)?.round_dp(8).normalize().to_string(),
                        to_decimal(order.quantity)?.round_dp(8).normalize().to_string(),
                    )
                }
            };
            items.push(serde_json::json!({
                "symbol": order.symbol,
                "side": order.side.to_string(),
                "type": order.order_type.to_string(),
                "timeInForce": "GTC",
                "price": price,
                "quantity": quantity,
                "newClientOrderId": order.client_order_id,
            }));
        }
        serde_json::to_string(&items)
            .map_err(|e| BotError::InvalidInput(format!("cannot encode batch: {e}")))
    }
}

fn parse_body<T: DeserializeOwned>(body: &str, path: &str) -> BotResult<T> {
    serde_json::from_str(body)
        .map_err(|e| BotError::Connectivity(format!("Malformed Binance response from {path}: {e}")))
}

#[async_trait]
impl Exchange for BinanceFuturesClient {
    async fn fetch_candles(&self, symbol: &str, interval: &str) -> BotResult<Vec<Candle>> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .public_get(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", self.candle_limit.to_string()),
                ],
            )
            .await?;

        let candles = parse_klines(&rows)?;
        debug!(symbol, interval, count = candles.len(), "Fetched klines");
        Ok(candles)
    }

    async fn get_positions(&self) -> BotResult<Vec<Position>> {
        let risks: Vec<PositionRisk> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await?;
        parse_positions(risks)
    }

    async fn cancel_orders(&self, symbol: &str) -> BotResult<()> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        debug!(symbol, "Cancelled open orders");
        Ok(())
    }

    async fn place_orders(&self, orders: &[OrderRequest]) -> BotResult<()> {
        let mut rejected = Vec::new();
        for chunk in orders.chunks(MAX_BATCH_ORDERS) {
            let payload = self.batch_payload(chunk)?;
            let items: Vec<serde_json::Value> = self
                .signed(
                    Method::POST,
                    "/fapi/v1/batchOrders",
                    vec![("batchOrders", payload)],
                )
                .await?;
            rejected.extend(batch_errors(&items));
        }

        if !rejected.is_empty() {
            return Err(BotError::Rejected(rejected.join("; ")));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        PLATFORM_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
