//! Per-instrument scheduler.
//!
//! Each configured instrument gets its own `InstrumentScheduler`, run as an
//! independent tokio task. One cycle is:
//!
//! guard (open position?) → fetch candles → EMA target → cancel resting
//! orders → place the new grid → sleep `poll_interval` → repeat.
//!
//! Cycles of one instrument never overlap: the next sleep starts only after
//! the previous cycle has finished. What happens after a skipped cycle or a
//! failed one is decided by [`AfterSkip`] and [`AfterError`]. A shutdown
//! signal is checked before every exchange call and raced against the sleep.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use crate::exchange::Exchange;
use crate::strategy::{build_grid, ema, GridParams};
use crate::types::{closes, open_exposure, BotError, BotResult, Instrument, OrderRequest};

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// What to do after a cycle skipped because a position is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfterSkip {
    /// Keep polling; resume the grid once the position is closed.
    Rearm,
    /// Stop this instrument's loop for good.
    Halt,
}

/// What to do after a cycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AfterError {
    /// Retry: backoff for connectivity errors, normal interval otherwise.
    Rearm,
    /// Stop this instrument's loop for good.
    Halt,
}

fn parse_policy(s: &str) -> BotResult<bool> {
    match s.trim().to_lowercase().as_str() {
        "rearm" | "retry" | "continue" => Ok(true),
        "halt" | "stop" => Ok(false),
        other => Err(BotError::Config(format!(
            "Unknown loop policy '{other}' (expected 'rearm' or 'halt')"
        ))),
    }
}

impl FromStr for AfterSkip {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if parse_policy(s)? { AfterSkip::Rearm } else { AfterSkip::Halt })
    }
}

impl FromStr for AfterError {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if parse_policy(s)? { AfterError::Rearm } else { AfterError::Halt })
    }
}

// ---------------------------------------------------------------------------
// Configuration & state
// ---------------------------------------------------------------------------

/// Settings shared read-only by every scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Candle granularity passed to the venue, e.g. "1h".
    pub candle_interval: String,
    /// Sleep between the end of one cycle and the start of the next.
    pub poll_interval: Duration,
    /// First backoff delay after a connectivity failure.
    pub retry_base: Duration,
    pub grid: GridParams,
    pub after_skip: AfterSkip,
    pub after_error: AfterError,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            candle_interval: "1h".to_string(),
            poll_interval: Duration::from_secs(15 * 60),
            retry_base: Duration::from_secs(30),
            grid: GridParams::default(),
            after_skip: AfterSkip::Rearm,
            after_error: AfterError::Rearm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Guarding,
    Fetching,
    Evaluating,
    Reconciling,
    /// Sleeping until the next cycle.
    Armed,
    /// Loop ended by policy.
    Halted,
    /// Loop ended by shutdown.
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of one successful cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// A position is open; no orders were touched.
    Skipped { exposure: f64 },
    /// Old grid cancelled, new grid placed.
    Placed { target: f64, orders: Vec<OrderRequest> },
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct InstrumentScheduler {
    instrument: Instrument,
    exchange: Arc<dyn Exchange>,
    config: Arc<SchedulerConfig>,
    shutdown: watch::Receiver<bool>,
    state: SchedulerState,
    backoff: Backoff,
    cycles: u64,
}

impl InstrumentScheduler {
    pub fn new(
        instrument: Instrument,
        exchange: Arc<dyn Exchange>,
        config: Arc<SchedulerConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let backoff = Backoff::new(config.retry_base, config.poll_interval);
        Self {
            instrument,
            exchange,
            config,
            shutdown,
            state: SchedulerState::Idle,
            backoff,
            cycles: 0,
        }
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Cycles attempted so far, successful or not.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run cycles until the policy halts the loop or shutdown is signalled.
    pub async fn run(mut self) -> SchedulerState {
        let next = self.step().await;
        self.run_from(next).await
    }

    /// Continue a loop whose first cycle already ran and asked for `next`.
    ///
    /// Lets the bootstrap run every instrument's first cycle in sequence
    /// before handing each scheduler to its own task.
    pub async fn run_from(mut self, mut next: Option<Duration>) -> SchedulerState {
        while let Some(delay) = next {
            self.enter(SchedulerState::Armed);
            debug!(symbol = %self.instrument.symbol, delay_secs = delay.as_secs(), "Armed");
            if !self.sleep(delay).await {
                self.enter(SchedulerState::Stopped);
                break;
            }
            next = self.step().await;
        }
        info!(
            symbol = %self.instrument.symbol,
            state = %self.state,
            cycles = self.cycles,
            "Scheduler exited"
        );
        self.state
    }

    /// Run one cycle, log its outcome, and return the delay before the next
    /// one, or `None` if this instrument's loop should end.
    pub async fn step(&mut self) -> Option<Duration> {
        let result = self.run_cycle().await;
        self.cycles += 1;
        let symbol = self.instrument.symbol.clone();
        let poll = self.config.poll_interval;

        match result {
            Ok(CycleOutcome::Placed { .. }) => {
                self.backoff.reset();
                Some(poll)
            }
            Ok(CycleOutcome::Skipped { .. }) => match self.config.after_skip {
                AfterSkip::Rearm => {
                    self.backoff.reset();
                    Some(poll)
                }
                AfterSkip::Halt => {
                    warn!(symbol = %symbol, "Position open and after_skip=halt, stopping loop");
                    self.enter(SchedulerState::Halted);
                    None
                }
            },
            Err(BotError::Cancelled) => {
                info!(symbol = %symbol, "Shutdown observed mid-cycle");
                self.enter(SchedulerState::Stopped);
                None
            }
            Err(e) => {
                if self.config.after_error == AfterError::Halt {
                    error!(symbol = %symbol, error = %e, "Cycle failed and after_error=halt, stopping loop");
                    self.enter(SchedulerState::Halted);
                    return None;
                }
                let delay = if e.is_transient() {
                    self.backoff.next_delay()
                } else {
                    self.backoff.reset();
                    poll
                };
                if e.is_transient() {
                    warn!(
                        symbol = %symbol,
                        error = %e,
                        failures = self.backoff.failures(),
                        retry_in_secs = delay.as_secs(),
                        "Cycle failed, backing off"
                    );
                } else {
                    error!(
                        symbol = %symbol,
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "Cycle failed"
                    );
                }
                Some(delay)
            }
        }
    }

    /// guard → fetch → evaluate → cancel → place.
    pub async fn run_cycle(&mut self) -> BotResult<CycleOutcome> {
        let symbol = self.instrument.symbol.clone();

        // 1. Guard
        self.enter(SchedulerState::Guarding);
        self.check_shutdown()?;
        let positions = self.exchange.get_positions().await?;
        if let Some(exposure) = open_exposure(&positions, &symbol) {
            info!(symbol = %symbol, exposure, "Found open position, skipping");
            return Ok(CycleOutcome::Skipped { exposure });
        }
        info!(symbol = %symbol, "Processing");

        // 2. Fetch
        self.enter(SchedulerState::Fetching);
        self.check_shutdown()?;
        let candles = self
            .exchange
            .fetch_candles(&symbol, &self.config.candle_interval)
            .await?;
        let series = closes(&candles);

        // 3. Evaluate
        self.enter(SchedulerState::Evaluating);
        let target = ema(&series, self.instrument.ema_period)?;
        info!(
            symbol = %symbol,
            period = self.instrument.ema_period,
            closes = series.len(),
            price_target = format!("${target:.4}"),
            "Price target"
        );

        // 4. Reconcile: the old grid must be gone before the new one goes in
        self.enter(SchedulerState::Reconciling);
        self.check_shutdown()?;
        self.exchange.cancel_orders(&symbol).await?;
        let orders = build_grid(&symbol, target, &self.config.grid)?;
        self.check_shutdown()?;
        self.exchange.place_orders(&orders).await?;

        info!(
            symbol = %symbol,
            count = orders.len(),
            low = format!("{:.4}", orders.first().map_or(0.0, |o| o.price)),
            high = format!("{:.4}", orders.last().map_or(0.0, |o| o.price)),
            quantity = orders.first().map_or(0.0, |o| o.quantity),
            venue = self.exchange.name(),
            "Limit orders placed"
        );

        Ok(CycleOutcome::Placed { target, orders })
    }

    // -- Internal helpers ------------------------------------------------

    fn enter(&mut self, state: SchedulerState) {
        if self.state != state {
            debug!(symbol = %self.instrument.symbol, from = %self.state, to = %state, "State change");
            self.state = state;
        }
    }

    fn check_shutdown(&self) -> BotResult<()> {
        if *self.shutdown.borrow() {
            Err(BotError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `delay`. Returns `false` if shutdown was signalled (or the
    /// shutdown sender went away) before the delay elapsed.
    async fn sleep(&mut self, delay: Duration) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
