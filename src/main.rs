//! EMAGRID — per-instrument EMA grid order bot
//!
//! Entry point. Loads configuration, initialises structured logging,
//! connects to the exchange, and starts one scheduler task per instrument
//! with graceful shutdown on Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use emagrid::config::AppConfig;
use emagrid::engine::{InstrumentScheduler, SchedulerState};
use emagrid::exchange::binance::{BinanceFuturesClient, MAINNET_URL, TESTNET_URL};
use emagrid::exchange::paper::PaperExchange;
use emagrid::exchange::{Exchange, ExchangeKind};

const BANNER: &str = r#"
 _____ __  __    _       ____ ____  ___ ____
| ____|  \/  |  / \     / ___|  _ \|_ _|  _ \
|  _| | |\/| | / _ \   | |  _| |_) || || | | |
| |___| |  | |/ ___ \  | |_| |  _ < | || |_| |
|_____|_|  |_/_/   \_\  \____|_| \_\___|____/

  EMA-anchored buy-limit grids, one loop per instrument
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    init_logging();

    let mut cfg = AppConfig::load("config.toml")?;

    println!("{BANNER}");
    info!(
        exchange = %cfg.exchange,
        instruments = cfg.instruments.len(),
        poll_interval_mins = cfg.poll_interval_minutes,
        candle_interval = %cfg.candle_interval,
        total_budget = cfg.total_budget,
        order_count = cfg.order_count,
        grid = format!("{:.4}..{:.4}", cfg.grid_low_pct, cfg.grid_high_pct),
        after_skip = ?cfg.after_skip,
        after_error = ?cfg.after_error,
        "EMAGRID starting up"
    );

    // -- Initialise components -------------------------------------------

    let exchange = build_exchange(&mut cfg).await?;
    info!(venue = exchange.name(), "Exchange loaded");

    let scheduler_cfg = Arc::new(cfg.scheduler_config()?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signal_task = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received."),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    // -- Kickoff ---------------------------------------------------------

    // First cycles run one instrument at a time; each scheduler then
    // continues on its own task.
    info!("Creating limit orders. Press Ctrl+C to stop.");
    let mut handles = Vec::with_capacity(cfg.instruments.len());
    for instrument in &cfg.instruments {
        let mut scheduler = InstrumentScheduler::new(
            instrument.clone(),
            Arc::clone(&exchange),
            Arc::clone(&scheduler_cfg),
            shutdown_rx.clone(),
        );
        let next = scheduler.step().await;
        handles.push(tokio::spawn(scheduler.run_from(next)));
    }

    // -- Wait for every loop to end ---------------------------------------

    let results = futures::future::join_all(handles).await;
    signal_task.abort();

    let mut halted = 0;
    for (instrument, result) in cfg.instruments.iter().zip(results) {
        match result {
            Ok(SchedulerState::Halted) => halted += 1,
            Ok(_) => {}
            Err(e) => warn!(symbol = %instrument.symbol, error = %e, "Scheduler task panicked"),
        }
    }

    info!(
        instruments = cfg.instruments.len(),
        halted,
        "EMAGRID shut down cleanly."
    );
    Ok(())
}

/// Connect to the configured venue.
async fn build_exchange(cfg: &mut AppConfig) -> Result<Arc<dyn Exchange>> {
    let exchange: Arc<dyn Exchange> = match cfg.exchange {
        ExchangeKind::Binance | ExchangeKind::BinanceTestnet => {
            let base = if cfg.exchange == ExchangeKind::Binance {
                MAINNET_URL
            } else {
                TESTNET_URL
            };
            let client = BinanceFuturesClient::new(
                base,
                cfg.api_key.take(),
                cfg.api_secret.take(),
                cfg.candle_limit,
            )?
            .connect()
            .await
            .context("Failed to load exchange trading rules")?;
            Arc::new(client)
        }
        ExchangeKind::Paper => {
            warn!("Paper exchange selected: orders are simulated, market data is live");
            let feed = BinanceFuturesClient::new(MAINNET_URL, None, None, cfg.candle_limit)?;
            Arc::new(PaperExchange::new(feed))
        }
    };
    Ok(exchange)
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("emagrid=info"));

    let json_logging = std::env::var("EMAGRID_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
