//! Exponential moving average.
//!
//! The price target of each cycle is the EMA of the full close history,
//! evaluated at the most recent candle.

use crate::types::{BotError, BotResult};

/// Smoothing factor for a given lookback period.
pub fn smoothing(period: usize) -> f64 {
    2.0 / (period as f64 + 1.0)
}

/// Compute the last EMA value of `series` for the given `period`.
///
/// Seeded at `series[0]`, then `ema[t] = series[t] * k + ema[t-1] * (1 - k)`
/// with `k = 2 / (period + 1)`. Requires `series.len() >= period >= 1`.
pub fn ema(series: &[f64], period: usize) -> BotResult<f64> {
    if period == 0 {
        return Err(BotError::InvalidInput("EMA period must be positive".into()));
    }
    if series.len() < period {
        return Err(BotError::InsufficientData {
            needed: period,
            available: series.len(),
        });
    }

    let k = smoothing(period);
    let mut iter = series.iter();
    // len >= period >= 1, so there is a first element
    let mut value = match iter.next() {
        Some(first) => *first,
        None => return Err(BotError::InsufficientData { needed: period, available: 0 }),
    };
    for price in iter {
        value = price * k + value * (1.0 - k);
    }
    Ok(value)
}
