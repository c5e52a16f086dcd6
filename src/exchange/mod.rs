//! Exchange integrations.
//!
//! Defines the `Exchange` trait the engine talks to and provides
//! implementations for:
//! - Binance USDⓈ-M futures (mainnet and testnet), signed REST
//! - Paper: in-memory order book simulation on top of real candles

pub mod binance;
pub mod paper;
pub mod signing;

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::types::{BotError, BotResult, Candle, OrderRequest, Position};

/// Abstraction over a trading venue.
///
/// The scheduler only needs these four operations. Every call may fail with
/// [`BotError::Connectivity`]; order placement may also fail with
/// [`BotError::Rejected`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Historical candles for `symbol` at `interval` granularity (e.g. "1h").
    async fn fetch_candles(&self, symbol: &str, interval: &str) -> BotResult<Vec<Candle>>;

    /// Snapshot of current positions across all symbols.
    async fn get_positions(&self) -> BotResult<Vec<Position>>;

    /// Cancel every resting order on `symbol`. Cancelling nothing is not an error.
    async fn cancel_orders(&self, symbol: &str) -> BotResult<()>;

    /// Submit a batch of orders.
    async fn place_orders(&self, orders: &[OrderRequest]) -> BotResult<()>;

    /// Venue name for logging.
    fn name(&self) -> &'static str;
}

/// Which venue to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExchangeKind {
    Binance,
    BinanceTestnet,
    Paper,
}

impl FromStr for ExchangeKind {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binance" | "binanceusdm" | "binance-futures" => Ok(ExchangeKind::Binance),
            "binance-testnet" | "testnet" => Ok(ExchangeKind::BinanceTestnet),
            "paper" | "dry-run" | "dryrun" => Ok(ExchangeKind::Paper),
            other => Err(BotError::Config(format!("Unknown exchange: {other}"))),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Binance => write!(f, "binance"),
            ExchangeKind::BinanceTestnet => write!(f, "binance-testnet"),
            ExchangeKind::Paper => write!(f, "paper"),
        }
    }
}
