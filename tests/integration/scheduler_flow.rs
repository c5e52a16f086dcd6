//! End-to-end scheduler behaviour against the fake exchange.
//!
//! Timed tests run on a paused clock, so the runtime jumps straight to the
//! next timer whenever every task is idle.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use emagrid::engine::{
    AfterError, AfterSkip, CycleOutcome, InstrumentScheduler, SchedulerConfig, SchedulerState,
};
use emagrid::exchange::Exchange;
use emagrid::strategy::GridParams;
use emagrid::types::{BotError, Instrument, OrderSide, OrderType};

use crate::fake_exchange::{Call, FakeExchange};

const POLL: Duration = Duration::from_secs(15 * 60);

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

fn scheduler(
    fake: &Arc<FakeExchange>,
    instrument: Instrument,
    config: SchedulerConfig,
) -> (InstrumentScheduler, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    let exchange: Arc<dyn Exchange> = fake.clone();
    let sched = InstrumentScheduler::new(instrument, exchange, Arc::new(config), rx);
    (sched, tx)
}

fn btc() -> Instrument {
    Instrument::new("BTCUSDT", 200)
}

// -- Single cycles --

#[tokio::test]
async fn test_btc_default_scenario() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 50_000.0, 240);

    let (mut sched, _tx) = scheduler(&fake, btc(), SchedulerConfig::default());
    let outcome = sched.run_cycle().await.unwrap();

    let CycleOutcome::Placed { target, orders } = outcome else {
        panic!("expected a placed grid");
    };
    assert!(approx(target, 50_000.0));

    let prices: Vec<f64> = orders.iter().map(|o| o.price).collect();
    for (got, want) in prices.iter().zip([49_500.0, 49_700.0, 49_900.0, 50_100.0, 50_300.0]) {
        assert!(approx(*got, want), "price {got} != {want}");
    }
    assert!(orders.iter().all(|o| approx(o.quantity, 0.4)));
    assert!(orders.iter().all(|o| o.side == OrderSide::Buy && o.order_type == OrderType::Limit));

    assert_eq!(
        fake.calls(),
        vec![
            Call::Positions,
            Call::Candles("BTCUSDT".into()),
            Call::Cancel("BTCUSDT".into()),
            Call::Place("BTCUSDT".into(), 5),
        ]
    );
    assert_eq!(fake.resting("BTCUSDT").len(), 5);
}

#[tokio::test]
async fn test_open_position_means_only_the_position_query() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 50_000.0, 240);
    fake.set_position("BTCUSDT", 0.8);

    let (mut sched, _tx) = scheduler(&fake, btc(), SchedulerConfig::default());
    let outcome = sched.run_cycle().await.unwrap();

    assert_eq!(outcome, CycleOutcome::Skipped { exposure: 0.8 });
    assert_eq!(fake.calls(), vec![Call::Positions]);
}

#[tokio::test]
async fn test_flat_position_on_symbol_does_not_guard() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 100.0, 200);
    fake.set_position("BTCUSDT", 0.0);
    fake.set_position("ETHUSDT", 4.0);

    let (mut sched, _tx) = scheduler(&fake, btc(), SchedulerConfig::default());
    assert!(matches!(sched.run_cycle().await, Ok(CycleOutcome::Placed { .. })));
}

#[tokio::test]
async fn test_rejected_grid_surfaces_as_rejection() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 50_000.0, 200);
    fake.reject_orders("notional below minimum");

    let (mut sched, _tx) = scheduler(&fake, btc(), SchedulerConfig::default());
    let err = sched.run_cycle().await.unwrap_err();
    assert!(matches!(err, BotError::Rejected(_)));
    // Old grid was still cancelled first.
    assert!(fake.calls().contains(&Call::Cancel("BTCUSDT".into())));
}

#[tokio::test]
async fn test_budget_is_split_evenly_across_instruments() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 50_000.0, 200);
    fake.set_flat_history("ETHUSDT", 2_500.0, 200);

    let config = SchedulerConfig {
        grid: GridParams {
            budget_per_instrument: GridParams::split_budget(100_000.0, 2).unwrap(),
            ..GridParams::default()
        },
        ..SchedulerConfig::default()
    };

    let (mut btc_sched, _tx1) = scheduler(&fake, btc(), config.clone());
    let (mut eth_sched, _tx2) = scheduler(&fake, Instrument::new("ETHUSDT", 200), config);
    btc_sched.run_cycle().await.unwrap();
    eth_sched.run_cycle().await.unwrap();

    let btc_orders = fake.resting("BTCUSDT");
    let eth_orders = fake.resting("ETHUSDT");
    assert!(btc_orders.iter().all(|o| approx(o.quantity, 0.2)));
    assert!(eth_orders.iter().all(|o| approx(o.quantity, 4.0)));

    let btc_total: f64 = btc_orders.iter().map(|o| o.quantity).sum::<f64>() * 50_000.0;
    let eth_total: f64 = eth_orders.iter().map(|o| o.quantity).sum::<f64>() * 2_500.0;
    assert!(approx(btc_total, 50_000.0));
    assert!(approx(eth_total, 50_000.0));
}

#[tokio::test]
async fn test_unbuildable_grid_still_clears_the_stale_one() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 50_000.0, 240);

    let (mut sched, _tx) = scheduler(&fake, btc(), SchedulerConfig::default());
    sched.run_cycle().await.unwrap();
    assert_eq!(fake.resting("BTCUSDT").len(), 5);

    // A zero target cannot produce a grid.
    fake.set_flat_history("BTCUSDT", 0.0, 240);
    let err = sched.run_cycle().await.unwrap_err();
    assert!(matches!(err, BotError::InvalidInput(_)));

    let calls = fake.calls_for("BTCUSDT");
    assert_eq!(
        calls[3..],
        [Call::Candles("BTCUSDT".into()), Call::Cancel("BTCUSDT".into())]
    );
    assert!(fake.resting("BTCUSDT").is_empty());
}

// -- Loops on a paused clock --

#[tokio::test(start_paused = true)]
async fn test_each_cycle_replaces_the_previous_grid() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 50_000.0, 200);

    let (sched, tx) = scheduler(&fake, btc(), SchedulerConfig::default());
    let handle = tokio::spawn(sched.run());

    tokio::time::sleep(POLL * 2 + Duration::from_secs(1)).await;
    tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), SchedulerState::Stopped);

    let calls = fake.calls_for("BTCUSDT");
    let expected_cycle = [
        Call::Candles("BTCUSDT".into()),
        Call::Cancel("BTCUSDT".into()),
        Call::Place("BTCUSDT".into(), 5),
    ];
    assert_eq!(calls.len(), 9);
    for cycle in calls.chunks(3) {
        assert_eq!(cycle, expected_cycle);
    }
    // Only one generation rests at a time.
    assert_eq!(fake.resting("BTCUSDT").len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_interval_is_measured_from_cycle_completion() {
    let fake = Arc::new(FakeExchange::with_fetch_latency(Duration::from_secs(5)));
    fake.set_flat_history("BTCUSDT", 50_000.0, 200);

    let (sched, tx) = scheduler(&fake, btc(), SchedulerConfig::default());
    let handle = tokio::spawn(sched.run());

    tokio::time::sleep(POLL * 2).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    let times = fake.placement_times();
    assert!(times.len() >= 2);
    assert_eq!(times[1] - times[0], POLL + Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_halt_after_skip_ends_the_loop() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_position("BTCUSDT", 1.0);
    let config = SchedulerConfig { after_skip: AfterSkip::Halt, ..SchedulerConfig::default() };

    let (sched, _tx) = scheduler(&fake, btc(), config);
    assert_eq!(sched.run().await, SchedulerState::Halted);
    assert_eq!(fake.calls(), vec![Call::Positions]);
}

#[tokio::test(start_paused = true)]
async fn test_rearm_after_skip_resumes_when_position_closes() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 50_000.0, 200);
    fake.set_position("BTCUSDT", 1.0);

    let (sched, tx) = scheduler(&fake, btc(), SchedulerConfig::default());
    let handle = tokio::spawn(sched.run());

    tokio::time::sleep(POLL / 2).await;
    assert!(fake.calls_for("BTCUSDT").is_empty());

    fake.clear_positions();
    tokio::time::sleep(POLL).await;
    assert!(fake.calls_for("BTCUSDT").contains(&Call::Place("BTCUSDT".into(), 5)));

    tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), SchedulerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_errors_back_off_then_recover() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 50_000.0, 200);
    fake.fail_next(vec![
        BotError::Connectivity("timeout".into()),
        BotError::Connectivity("timeout".into()),
    ]);

    let (sched, tx) = scheduler(&fake, btc(), SchedulerConfig::default());
    let start = Instant::now();
    let handle = tokio::spawn(sched.run());

    // 30s and 60s backoff (±20% jitter) both land well inside one poll.
    tokio::time::sleep(Duration::from_secs(200)).await;
    let placed = fake.placement_times();
    assert_eq!(placed.len(), 1);
    assert!(placed[0] - start < POLL);

    tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), SchedulerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_insufficient_history_rearms_at_poll_interval() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 50_000.0, 20);

    let (sched, tx) = scheduler(&fake, btc(), SchedulerConfig::default());
    let handle = tokio::spawn(sched.run());

    tokio::time::sleep(POLL - Duration::from_secs(1)).await;
    assert_eq!(fake.calls_for("BTCUSDT").len(), 1);

    fake.set_flat_history("BTCUSDT", 50_000.0, 250);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(fake.calls_for("BTCUSDT").contains(&Call::Place("BTCUSDT".into(), 5)));

    tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_halt_after_error_ends_the_loop() {
    let fake = Arc::new(FakeExchange::new());
    fake.fail_next(vec![BotError::Connectivity("refused".into())]);
    let config = SchedulerConfig { after_error: AfterError::Halt, ..SchedulerConfig::default() };

    let (sched, _tx) = scheduler(&fake, btc(), config);
    assert_eq!(sched.run().await, SchedulerState::Halted);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_the_sleep() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 50_000.0, 200);

    let (sched, tx) = scheduler(&fake, btc(), SchedulerConfig::default());
    let start = Instant::now();
    let handle = tokio::spawn(sched.run());

    tokio::time::sleep(Duration::from_secs(10)).await;
    tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), SchedulerState::Stopped);
    assert!(Instant::now() - start < POLL);
    assert_eq!(fake.placement_times().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_instruments_run_independently() {
    let fake = Arc::new(FakeExchange::new());
    fake.set_flat_history("BTCUSDT", 50_000.0, 200);
    fake.set_flat_history("ETHUSDT", 2_500.0, 200);
    fake.set_position("ETHUSDT", 2.0);

    let (tx, rx) = watch::channel(false);
    let config = Arc::new(SchedulerConfig::default());
    let exchange: Arc<dyn Exchange> = fake.clone();
    let handles: Vec<_> = [btc(), Instrument::new("ETHUSDT", 200)]
        .into_iter()
        .map(|inst| {
            let sched = InstrumentScheduler::new(inst, exchange.clone(), config.clone(), rx.clone());
            tokio::spawn(sched.run())
        })
        .collect();

    tokio::time::sleep(POLL + Duration::from_secs(1)).await;
    tx.send(true).unwrap();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), SchedulerState::Stopped);
    }

    assert_eq!(
        fake.calls_for("BTCUSDT")
            .iter()
            .filter(|c| matches!(c, Call::Place(..)))
            .count(),
        2
    );
    assert!(fake.calls_for("ETHUSDT").is_empty());
}
