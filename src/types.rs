//! Shared types for the EMAGRID bot.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that exchange, strategy,
//! and engine modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Instrument
// ---------------------------------------------------------------------------

/// A configured instrument. Immutable after configuration load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Exchange symbol, e.g. "BTCUSDT".
    pub symbol: String,
    /// EMA lookback period used to compute the price target.
    #[serde(alias = "ema")]
    pub ema_period: usize,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, ema_period: usize) -> Self {
        Self {
            symbol: symbol.into(),
            ema_period,
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (EMA {})", self.symbol, self.ema_period)
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// One OHLCV candle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// A flat candle where every price equals `close`. Handy for fakes.
    pub fn flat(open_time: DateTime<Utc>, close: f64) -> Self {
        Self {
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }
}

/// Extract close prices in chronological order.
pub fn closes(candles: &[Candle]) -> Vec<f64> {
    let mut sorted: Vec<&Candle> = candles.iter().collect();
    sorted.sort_by_key(|c| c.open_time);
    sorted.into_iter().map(|c| c.close).collect()
}

// ---------------------------------------------------------------------------
// Account state
// ---------------------------------------------------------------------------

/// Net exposure on one symbol, as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed contract quantity. Zero means flat.
    pub net_exposure: f64,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.net_exposure != 0.0
    }
}

/// Find the open exposure on `symbol`, if any.
pub fn open_exposure(positions: &[Position], symbol: &str) -> Option<f64> {
    positions
        .iter()
        .find(|p| p.symbol == symbol && p.is_open())
        .map(|p| p.net_exposure)
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// One order descriptor of a grid, ready to submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub price: f64,
    pub quantity: f64,
    pub client_order_id: String,
}

impl OrderRequest {
    /// Quote-currency value of the order.
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

impl fmt::Display for OrderRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {:.6} @ {:.4}",
            self.symbol, self.order_type, self.side, self.quantity, self.price
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for EMAGRID.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BotError {
    #[error("Insufficient data: need {needed} closes, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cancelled by shutdown")]
    Cancelled,
}

impl BotError {
    /// Transient failures that warrant backing off before the next attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, BotError::Connectivity(_))
    }
}

pub type BotResult<T> = std::result::Result<T, BotError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
