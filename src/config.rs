//! Configuration loading from TOML with environment variable overrides.
//!
//! Reads an optional `config.toml`, then lets environment variables (or a
//! `.env` file loaded by the binary) override individual settings. The
//! result is validated once at startup. API credentials are taken from the
//! environment only and never from the config file.

use anyhow::{bail, Context, Result};
use secrecy::Secret;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::scheduler::{AfterError, AfterSkip, SchedulerConfig};
use crate::exchange::binance::MAX_KLINES;
use crate::exchange::ExchangeKind;
use crate::strategy::GridParams;
use crate::types::Instrument;

/// Top-level application configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeKind,
    pub poll_interval_minutes: u64,
    pub candle_interval: String,
    /// Klines requested per fetch.
    pub candle_limit: u32,
    /// Total notional budget, split evenly across instruments.
    pub total_budget: f64,
    pub order_count: usize,
    pub grid_low_pct: f64,
    pub grid_high_pct: f64,
    pub after_skip: AfterSkip,
    pub after_error: AfterError,
    pub retry_base_secs: u64,
    pub instruments: Vec<Instrument>,

    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(skip)]
    pub api_secret: Option<Secret<String>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            exchange: ExchangeKind::Binance,
            poll_interval_minutes: 15,
            candle_interval: "1h".to_string(),
            candle_limit: 500,
            total_budget: 100_000.0,
            order_count: 5,
            grid_low_pct: 0.99,
            grid_high_pct: 1.01,
            after_skip: AfterSkip::Rearm,
            after_error: AfterError::Rearm,
            retry_base_secs: 30,
            instruments: Vec::new(),
            api_key: None,
            api_secret: None,
        }
    }
}

impl AppConfig {
    /// Load configuration: optional TOML file, then process environment,
    /// then validation.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {path}"))?;
            Self::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config file: {path}"))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Override settings from environment-style key/value lookups.
    ///
    /// Empty values count as unset. Unparseable values are an error.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = parse_var(&get, "EXCHANGE")? {
            self.exchange = v;
        }
        if let Some(v) = get("API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = get("API_SECRET") {
            self.api_secret = Some(Secret::new(v));
        }
        if let Some(v) = parse_var(&get, "REPEAT_INTERVAL_MINUTES")? {
            self.poll_interval_minutes = v;
        }
        if let Some(v) = get("KLINE_INTERVAL") {
            self.candle_interval = v.trim().to_string();
        }
        if let Some(v) = parse_var(&get, "KLINE_LIMIT")? {
            self.candle_limit = v;
        }
        if let Some(v) = parse_var(&get, "TOTAL_USDT_AMOUNT")? {
            self.total_budget = v;
        }
        if let Some(v) = parse_var(&get, "ORDERS_COUNT")? {
            self.order_count = v;
        }
        if let Some(v) = parse_var(&get, "TRADE_RANGE_BETWEEN_PERCENTAGE_LOW")? {
            self.grid_low_pct = v;
        }
        if let Some(v) = parse_var(&get, "TRADE_RANGE_BETWEEN_PERCENTAGE_HIGH")? {
            self.grid_high_pct = v;
        }
        if let Some(v) = parse_var(&get, "AFTER_SKIP")? {
            self.after_skip = v;
        }
        if let Some(v) = parse_var(&get, "AFTER_ERROR")? {
            self.after_error = v;
        }
        if let Some(v) = parse_var(&get, "RETRY_BASE_SECONDS")? {
            self.retry_base_secs = v;
        }
        if let Some(v) = get("INSTRUMENTS") {
            self.instruments = parse_instruments(&v)?;
        }
        Ok(())
    }

    /// Check every setting once, before any task starts.
    pub fn validate(&self) -> Result<()> {
        if self.instruments.is_empty() {
            bail!("No instruments configured");
        }
        let mut seen = HashSet::new();
        for inst in &self.instruments {
            if inst.symbol.trim().is_empty() {
                bail!("Instrument with empty symbol");
            }
            if inst.ema_period == 0 {
                bail!("Instrument {} has EMA period 0", inst.symbol);
            }
            if !seen.insert(inst.symbol.as_str()) {
                bail!("Instrument {} configured twice", inst.symbol);
            }
        }
        if self.poll_interval_minutes == 0 {
            bail!("Poll interval must be at least 1 minute");
        }
        if self.candle_interval.trim().is_empty() {
            bail!("Candle interval must not be empty");
        }
        let fetched = self.candles_fetched();
        if let Some(inst) = self
            .instruments
            .iter()
            .find(|i| i.ema_period > fetched as usize)
        {
            bail!(
                "Instrument {} needs {} candles but only {} are fetched",
                inst.symbol,
                inst.ema_period,
                fetched
            );
        }
        self.grid_params()?.validate()?;

        if self.exchange != ExchangeKind::Paper
            && (self.api_key.is_none() || self.api_secret.is_none())
        {
            bail!("API_KEY and API_SECRET are required for exchange {}", self.exchange);
        }
        Ok(())
    }

    /// Candles actually requested per fetch, after the venue cap.
    pub fn candles_fetched(&self) -> u32 {
        self.candle_limit.clamp(1, MAX_KLINES)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_minutes * 60)
    }

    pub fn grid_params(&self) -> Result<GridParams> {
        Ok(GridParams {
            budget_per_instrument: GridParams::split_budget(
                self.total_budget,
                self.instruments.len(),
            )?,
            order_count: self.order_count,
            low_offset: self.grid_low_pct,
            high_offset: self.grid_high_pct,
        })
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig {
            candle_interval: self.candle_interval.clone(),
            poll_interval: self.poll_interval(),
            retry_base: Duration::from_secs(self.retry_base_secs.max(1)),
            grid: self.grid_params()?,
            after_skip: self.after_skip,
            after_error: self.after_error,
        })
    }
}

fn parse_var<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {key} ({raw}): {e}")),
    }
}

/// Parse `SYMBOL:PERIOD` pairs separated by commas.
fn parse_instruments(raw: &str) -> Result<Vec<Instrument>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (symbol, period) = entry
                .split_once(':')
                .with_context(|| format!("Instrument '{entry}' must be SYMBOL:PERIOD"))?;
            let period: usize = period
                .trim()
                .parse()
                .with_context(|| format!("Invalid EMA period in '{entry}'"))?;
            Ok(Instrument::new(symbol.trim().to_uppercase(), period))
        })
        .collect()
}
