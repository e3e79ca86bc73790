// ===============================
// src/main.rs (multi-agent market simulation)
// ===============================
//
// Task layout:
//   feed      -> watch slot (latest snapshot, Arc, single writer)
//   clock     -> sequential agent pipeline, reads the slot on a cadence
//   persist   -> bounded queue + worker owning the store
//   events    -> bounded queue + sink task (structured log lines)
//   metrics   -> Prometheus text endpoint on its own OS thread
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use arena_sim::clock::{Command, SimulationClock};
use arena_sim::config::{self, FeedMode};
use arena_sim::events::{self, EventSink};
use arena_sim::feed::{self, MockSource, RestSource};
use arena_sim::metrics;
use arena_sim::persist::{self, JsonlStore, Store};
use arena_sim::strategy::StrategyRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (args, params) = config::load();
    info!(
        symbols = args.symbols.join(",").as_str(),
        benchmark = %args.benchmark,
        feed = args.feed_mode.as_str(),
        agents = args.agents.len(),
        "arena starting"
    );

    metrics::init();
    metrics::serve_metrics(args.metrics_port).await;
    metrics::CONFIG_FEED_MODE.with_label_values(&[args.feed_mode.as_str()]).set(1);
    for sym in &args.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[sym]).set(1);
    }
    for (name, kind) in &args.agents {
        metrics::CONFIG_AGENT.with_label_values(&[name, kind.as_str()]).set(1);
    }

    let running = Arc::new(AtomicBool::new(true));

    // ---- market feed -> watch slot ----
    let (snap_tx, snap_rx) = watch::channel(None);
    match args.feed_mode {
        FeedMode::Mock => {
            let source = MockSource::new(&args.symbols);
            tokio::spawn(feed::run(
                source,
                snap_tx,
                args.tick_interval_ms,
                params.feed_backoff_max_secs,
                running.clone(),
            ));
        }
        FeedMode::Rest => {
            let source = RestSource::new(args.rest_url.clone());
            tokio::spawn(feed::run(
                source,
                snap_tx,
                args.tick_interval_ms,
                params.feed_backoff_max_secs,
                running.clone(),
            ));
        }
    }

    // ---- persistence (optional) ----
    let mut persist_worker = None;
    let mut restored_accounts = Vec::new();
    let mut restored_chart = Vec::new();
    let persist_handle = match &args.record_dir {
        Some(dir) => match JsonlStore::open(dir) {
            Ok(mut store) => {
                // Restore before the worker takes ownership of the store.
                restored_accounts = store.load_accounts().unwrap_or_default();
                restored_chart = store.load_chart().unwrap_or_default();
                let (handle, worker) = persist::spawn(store, params.persist_queue_cap);
                persist_worker = Some(worker);
                info!(dir = %dir, "recording to JSONL");
                Some(handle)
            }
            Err(e) => {
                error!(?e, dir = %dir, "cannot open record dir, persistence disabled");
                None
            }
        },
        None => None,
    };

    // ---- event sink ----
    let (sink, event_rx) = EventSink::new(params.event_queue_cap);
    let sink_task = tokio::spawn(events::run(event_rx));

    // ---- agents + clock ----
    let registry = Arc::new(StrategyRegistry::new());
    let mut clock = SimulationClock::new(
        args.symbols.clone(),
        args.benchmark.clone(),
        params,
        registry,
        sink,
        persist_handle,
    );
    clock.load_default_agents(&args.agents);
    if !restored_accounts.is_empty() || !restored_chart.is_empty() {
        info!(
            accounts = restored_accounts.len(),
            chart_points = restored_chart.len(),
            "restoring persisted state"
        );
        clock.restore(restored_accounts, restored_chart);
    }

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(16);
    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                running.store(false, Ordering::Relaxed);
                let _ = cmd_tx.send(Command::Stop).await;
            }
        });
    }

    clock.run(snap_rx, cmd_rx, running.clone()).await;

    // Clock dropped its persist handle; wait for the final flush.
    if let Some(worker) = persist_worker {
        let _ = worker.await;
    }
    sink_task.abort();
    info!("arena stopped");
}
