//! Paper trading venue.
//!
//! Market data comes from a real adapter; orders and positions live in
//! memory. Resting buys fill when a fetched candle closes at or below
//! their price, which is enough for the position guard to kick in during
//! a dry run.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

use super::Exchange;
use crate::types::{BotError, BotResult, Candle, OrderRequest, OrderSide, Position};

#[derive(Default)]
struct Book {
    resting: HashMap<String, Vec<OrderRequest>>,
    positions: HashMap<String, f64>,
}

/// In-memory venue that delegates market data to `E`.
pub struct PaperExchange<E> {
    market_data: E,
    book: Mutex<Book>,
}

impl<E: Exchange> PaperExchange<E> {
    pub fn new(market_data: E) -> Self {
        Self {
            market_data,
            book: Mutex::new(Book::default()),
        }
    }

    /// Orders currently resting on `symbol`.
    pub fn resting_orders(&self, symbol: &str) -> Vec<OrderRequest> {
        self.lock()
            .map(|b| b.resting.get(symbol).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Fill resting buys priced at or above `last_price`.
    pub fn mark(&self, symbol: &str, last_price: f64) -> BotResult<f64> {
        let mut book = self.lock()?;
        let Some(orders) = book.resting.remove(symbol) else {
            return Ok(0.0);
        };
        let (filled, still_resting): (Vec<_>, Vec<_>) = orders
            .into_iter()
            .partition(|o| o.side == OrderSide::Buy && o.price >= last_price);

        let filled_qty: f64 = filled.iter().map(|o| o.quantity).sum();
        if !still_resting.is_empty() {
            book.resting.insert(symbol.to_string(), still_resting);
        }
        if filled_qty > 0.0 {
            *book.positions.entry(symbol.to_string()).or_insert(0.0) += filled_qty;
            info!(symbol, fills = filled.len(), quantity = filled_qty, "[PAPER] Orders filled");
        }
        Ok(filled_qty)
    }

    fn lock(&self) -> BotResult<std::sync::MutexGuard<'_, Book>> {
        self.book
            .lock()
            .map_err(|_| BotError::Connectivity("paper book lock poisoned".into()))
    }
}

#[async_trait]
impl<E: Exchange> Exchange for PaperExchange<E> {
    async fn fetch_candles(&self, symbol: &str, interval: &str) -> BotResult<Vec<Candle>> {
        let candles = self.market_data.fetch_candles(symbol, interval).await?;
        if let Some(last) = candles.iter().max_by_key(|c| c.open_time) {
            self.mark(symbol, last.close)?;
        }
        Ok(candles)
    }

    async fn get_positions(&self) -> BotResult<Vec<Position>> {
        let book = self.lock()?;
        Ok(book
            .positions
            .iter()
            .map(|(symbol, qty)| Position {
                symbol: symbol.clone(),
                net_exposure: *qty,
            })
            .collect())
    }

    async fn cancel_orders(&self, symbol: &str) -> BotResult<()> {
        let removed = self.lock()?.resting.remove(symbol).map_or(0, |o| o.len());
        debug!(symbol, removed, "[PAPER] Cancelled resting orders");
        Ok(())
    }

    async fn place_orders(&self, orders: &[OrderRequest]) -> BotResult<()> {
        if let Some(bad) = orders.iter().find(|o| !(o.price > 0.0 && o.quantity > 0.0)) {
            return Err(BotError::Rejected(format!("invalid paper order: {bad}")));
        }
        let mut book = self.lock()?;
        for order in orders {
            info!(order = %order, "[PAPER] Order resting");
            book.resting
                .entry(order.symbol.clone())
                .or_default()
                .push(order.clone());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "paper"
    }
}
