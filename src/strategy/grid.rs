//! Order grid construction.
//!
//! Turns a price target into `N` evenly spaced buy-limit orders spanning
//! `[target * low_offset, target * high_offset)`. All monetary arithmetic
//! lives here so the scheduler never touches prices or sizes directly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{BotError, BotResult, OrderRequest, OrderSide, OrderType};

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Grid shape and sizing for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    /// This instrument's share of the total notional budget.
    pub budget_per_instrument: f64,
    /// Number of orders in the grid (N).
    pub order_count: usize,
    /// Lower bound as a multiple of the target (e.g. 0.99).
    pub low_offset: f64,
    /// Upper bound as a multiple of the target (e.g. 1.01).
    pub high_offset: f64,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            budget_per_instrument: 100_000.0,
            order_count: 5,
            low_offset: 0.99,
            high_offset: 1.01,
        }
    }
}

impl GridParams {
    /// Split a total budget evenly across `instrument_count` instruments.
    pub fn split_budget(total_budget: f64, instrument_count: usize) -> BotResult<f64> {
        if instrument_count == 0 {
            return Err(BotError::InvalidInput(
                "cannot split budget across zero instruments".into(),
            ));
        }
        Ok(total_budget / instrument_count as f64)
    }

    pub fn validate(&self) -> BotResult<()> {
        if self.order_count == 0 {
            return Err(BotError::InvalidInput("order count must be at least 1".into()));
        }
        if !(self.low_offset.is_finite() && self.high_offset.is_finite()) || self.low_offset <= 0.0 {
            return Err(BotError::InvalidInput(format!(
                "grid offsets must be positive and finite (low={}, high={})",
                self.low_offset, self.high_offset
            )));
        }
        if self.low_offset >= self.high_offset {
            return Err(BotError::InvalidInput(format!(
                "grid low offset {} must be below high offset {}",
                self.low_offset, self.high_offset
            )));
        }
        if !self.budget_per_instrument.is_finite() || self.budget_per_instrument <= 0.0 {
            return Err(BotError::InvalidInput(format!(
                "budget per instrument must be positive, got {}",
                self.budget_per_instrument
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Money math
// ---------------------------------------------------------------------------

/// Quantity of each grid order: `budget / order_count / target`.
///
/// Every order carries the same base quantity, so the grid commits
/// `budget` in total when valued at the target price.
pub fn order_quantity(budget: f64, target: f64, order_count: usize) -> f64 {
    budget / order_count as f64 / target
}

/// Price of level `i` of an `n`-level grid between `low` and `high`.
pub fn level_price(low: f64, high: f64, i: usize, n: usize) -> f64 {
    low + (high - low) * i as f64 / n as f64
}

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

/// Build the buy-limit grid for `symbol` around `target`.
pub fn build_grid(symbol: &str, target: f64, params: &GridParams) -> BotResult<Vec<OrderRequest>> {
    if !target.is_finite() || target <= 0.0 {
        return Err(BotError::InvalidInput(format!(
            "price target must be positive and finite, got {target}"
        )));
    }
    params.validate()?;

    let low = target * params.low_offset;
    let high = target * params.high_offset;
    let n = params.order_count;
    let quantity = order_quantity(params.budget_per_instrument, target, n);

    let orders = (0..n)
        .map(|i| OrderRequest {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            price: level_price(low, high, i, n),
            quantity,
            client_order_id: client_order_id(),
        })
        .collect();

    Ok(orders)
}

/// Venue client order ids are capped at 36 characters; a simple UUID fits.
fn client_order_id() -> String {
    format!("eg{}", Uuid::new_v4().simple())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
