// End-to-end pipeline checks: clock + ledger + risk + events + persistence
// wired together the same way the binary wires them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use arena_sim::clock::{Command, SimulationClock};
use arena_sim::config::SimParams;
use arena_sim::domain::{Action, Event, Signals, Snapshot, Tick, TradeIntent};
use arena_sim::events::EventSink;
use arena_sim::persist::{self, JsonlStore, Store};
use arena_sim::strategy::{Strategy, StrategyCtx, StrategyOutput, StrategyRegistry};

fn snap(prices: &[(&str, f64)], ts: i64) -> Snapshot {
    let mut s = Snapshot { timestamp_ms: ts, ticks: Default::default() };
    for (sym, px) in prices {
        s.ticks.insert(
            sym.to_string(),
            Tick {
                symbol: sym.to_string(),
                price: *px,
                volume: 1_000.0,
                bid: px - 0.01,
                ask: px + 0.01,
                bids: vec![(px - 0.01, 1.0)],
                asks: vec![(px + 0.01, 1.0)],
                signals: Signals::default(),
                timestamp_ms: ts,
            },
        );
    }
    s
}

fn no_slip() -> SimParams {
    SimParams { slippage_min: 0.0, slippage_max: 0.0, ..SimParams::default() }
}

struct BuyAndHold;
impl Strategy for BuyAndHold {
    fn decide(&self, ctx: &StrategyCtx) -> StrategyOutput {
        if ctx.portfolio.get("BTC").copied().unwrap_or(0.0) != 0.0 {
            return StrategyOutput::hold();
        }
        StrategyOutput {
            intent: TradeIntent { action: Action::Buy, symbol: Some("BTC".into()), quantity: 0.3 },
            custom_state: None,
        }
    }
}

struct AlwaysPanic;
impl Strategy for AlwaysPanic {
    fn decide(&self, _ctx: &StrategyCtx) -> StrategyOutput {
        panic!("bad agent code");
    }
}

#[tokio::test]
async fn full_pipeline_emits_events_and_records_jsonl() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlStore::open(dir.path()).unwrap();
    let (persist_handle, worker) = persist::spawn(store, 1024);
    let (sink, mut event_rx) = EventSink::new(4096);

    let mut clock = SimulationClock::new(
        vec!["BTC".into()],
        "BTC".into(),
        no_slip(),
        Arc::new(StrategyRegistry::new()),
        sink,
        Some(persist_handle),
    );
    clock.load_custom_agent("holder", Arc::new(BuyAndHold));

    let mut price = 100.0;
    for i in 1..=5 {
        price += 0.05;
        assert!(clock.run_tick(&snap(&[("BTC", price)], i * 1_000)));
    }
    assert_eq!(clock.chart_len(), 5);
    drop(clock); // releases the persist handle
    worker.await.unwrap();

    let mut saw = (false, false, false, false);
    while let Ok(event) = event_rx.try_recv() {
        match event {
            Event::MarketTick { .. } => saw.0 = true,
            Event::ChartTick(_) => saw.1 = true,
            Event::TradeLog { agent, action, .. } => {
                assert_eq!(agent, "holder");
                assert_eq!(action, Action::Buy);
                saw.2 = true;
            }
            Event::LeaderboardUpdate(rows) => {
                assert_eq!(rows.len(), 1);
                saw.3 = true;
            }
            _ => {}
        }
    }
    assert!(saw.0 && saw.1 && saw.2 && saw.3, "missing event kinds: {saw:?}");

    let accounts = std::fs::read_to_string(dir.path().join("accounts.jsonl")).unwrap();
    assert_eq!(accounts.lines().count(), 5); // one upsert per tick
    let chart = std::fs::read_to_string(dir.path().join("chart.jsonl")).unwrap();
    assert_eq!(chart.lines().count(), 5);
}

#[tokio::test]
async fn panicking_agent_is_isolated_from_the_rest() {
    let (sink, _event_rx) = EventSink::new(4096);
    let mut clock = SimulationClock::new(
        vec!["BTC".into()],
        "BTC".into(),
        no_slip(),
        Arc::new(StrategyRegistry::new()),
        sink,
        None,
    );
    clock.load_custom_agent("bad", Arc::new(AlwaysPanic));
    clock.load_custom_agent("good", Arc::new(BuyAndHold));

    for i in 1..=20 {
        clock.run_tick(&snap(&[("BTC", 100.0 + i as f64 * 0.001)], i * 1_000));
    }

    let bad = clock.account("bad").unwrap();
    assert_eq!(bad.trades_count, 0);
    assert_eq!(bad.cash, 100.0);
    assert_eq!(bad.equity, 100.0);

    let good = clock.account("good").unwrap();
    assert_eq!(good.trades_count, 1);
    assert!(good.holdings["BTC"] > 0.0);
}

#[tokio::test]
async fn reset_wipes_persisted_collections() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlStore::open(dir.path()).unwrap();
    let (persist_handle, worker) = persist::spawn(store, 1024);
    let (sink, _event_rx) = EventSink::new(4096);

    let mut clock = SimulationClock::new(
        vec!["BTC".into()],
        "BTC".into(),
        no_slip(),
        Arc::new(StrategyRegistry::new()),
        sink,
        Some(persist_handle),
    );
    clock.load_custom_agent("holder", Arc::new(BuyAndHold));

    for i in 1..=3 {
        clock.run_tick(&snap(&[("BTC", 100.0)], i * 1_000));
    }
    clock.reset().await;
    assert_eq!(clock.chart_len(), 0);
    assert!(clock.account("holder").is_none()); // not in the default set

    drop(clock);
    worker.await.unwrap();

    let chart = std::fs::read_to_string(dir.path().join("chart.jsonl")).unwrap();
    assert!(chart.is_empty());
    let accounts = std::fs::read_to_string(dir.path().join("accounts.jsonl")).unwrap();
    assert!(accounts.is_empty());
}

#[tokio::test]
async fn restart_restores_accounts_and_chart_from_the_store() {
    let dir = tempfile::tempdir().unwrap();

    // First life: trade a bit, then shut down cleanly.
    let (cash_before, equity_before, last_ts) = {
        let store = JsonlStore::open(dir.path()).unwrap();
        let (persist_handle, worker) = persist::spawn(store, 1024);
        let (sink, _event_rx) = EventSink::new(4096);
        let mut clock = SimulationClock::new(
            vec!["BTC".into()],
            "BTC".into(),
            no_slip(),
            Arc::new(StrategyRegistry::new()),
            sink,
            Some(persist_handle),
        );
        clock.load_custom_agent("holder", Arc::new(BuyAndHold));
        for i in 1..=4 {
            clock.run_tick(&snap(&[("BTC", 100.0)], i * 1_000));
        }
        let a = clock.account("holder").unwrap();
        let out = (a.cash, a.equity, 4_000i64);
        drop(clock);
        worker.await.unwrap();
        out
    };
    assert!(cash_before < 100.0); // a position was opened

    // Second life: the same record dir seeds the fresh engine.
    let mut store = JsonlStore::open(dir.path()).unwrap();
    let accounts = store.load_accounts().unwrap();
    let chart = store.load_chart().unwrap();
    assert_eq!(chart.len(), 4);

    let (sink, _event_rx) = EventSink::new(4096);
    let mut clock = SimulationClock::new(
        vec!["BTC".into()],
        "BTC".into(),
        no_slip(),
        Arc::new(StrategyRegistry::new()),
        sink,
        None,
    );
    clock.load_custom_agent("holder", Arc::new(BuyAndHold));
    clock.restore(accounts, chart);

    let restored = clock.account("holder").unwrap();
    assert_eq!(restored.cash, cash_before);
    assert_eq!(restored.equity, equity_before);
    assert!(restored.holdings["BTC"] > 0.0);
    assert_eq!(clock.chart_len(), 4);

    // The restored tail timestamp is a duplicate, not a new tick.
    assert!(!clock.run_tick(&snap(&[("BTC", 100.0)], last_ts)));
    assert!(clock.run_tick(&snap(&[("BTC", 100.0)], last_ts + 1_000)));
    // Restored position means the strategy holds rather than re-buying.
    assert_eq!(clock.account("holder").unwrap().trades_count, 1);
}

#[tokio::test]
async fn clock_task_stops_on_command() {
    let (sink, _event_rx) = EventSink::new(64);
    let mut clock = SimulationClock::new(
        vec!["BTC".into()],
        "BTC".into(),
        no_slip(),
        Arc::new(StrategyRegistry::new()),
        sink,
        None,
    );
    clock.load_custom_agent("holder", Arc::new(BuyAndHold));

    let (snap_tx, snap_rx) = watch::channel(None);
    let (cmd_tx, cmd_rx) = mpsc::channel(4);
    let running = Arc::new(AtomicBool::new(true));
    let task = tokio::spawn(clock.run(snap_rx, cmd_rx, running.clone()));

    snap_tx.send(Some(Arc::new(snap(&[("BTC", 100.0)], 1_000)))).unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    cmd_tx.send(Command::Stop).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("clock did not stop on command")
        .unwrap();
    assert!(!running.load(Ordering::Relaxed));
}
