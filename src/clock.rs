// ===============================
// src/clock.rs (simulation tick pipeline)
// ===============================
//
// Owns the agents: accounts, processing order, chart history. Each tick:
//   1. dedup  — a snapshot with an unchanged timestamp is skipped
//   2. agents — sequentially: build context, invoke strategy (panic-safe),
//               validate the intent, execute on the ledger, mark, risk-check
//   3. emit   — market tick, chart point, leaderboard; persist upserts
//
// Agents are strictly sequential within a tick, so every agent on a tick
// sees the same snapshot and the ledger never needs interior locking.
// Control arrives on a command channel and only interleaves between ticks.
//

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::SimParams;
use crate::domain::{Account, Action, ChartPoint, Event, LeaderboardRow, Snapshot, TradeRecord};
use crate::events::EventSink;
use crate::ledger::Ledger;
use crate::metrics::{
    AGENT_EQUITY, AGENT_ROI, INTENTS, INTENTS_COERCED, REJECTS, SNAPSHOTS_STALE, TICKS, TRADES,
};
use crate::persist::PersistHandle;
use crate::risk::RiskController;
use crate::strategy::{build_ctx, validate, Strategy, StrategyKind, StrategyRegistry};

const HISTORY_TAIL: usize = 20;
const RETURNS_CAP: usize = 1_000;

#[derive(Debug)]
pub enum Command {
    LoadAgent { name: String, kind: StrategyKind },
    ReloadAgent { name: String },
    UnloadAgent { name: String },
    /// Wipe persisted collections and reseed the default agents.
    Reset,
    /// Reseed in memory only; persisted history is kept.
    SoftReset,
    Stop,
}

pub struct SimulationClock {
    symbols: Vec<String>,
    benchmark: String,
    params: SimParams,
    registry: Arc<StrategyRegistry>,
    ledger: Ledger,
    risk: RiskController,
    sink: EventSink,
    persist: Option<PersistHandle>,
    default_agents: Vec<(String, StrategyKind)>,

    accounts: HashMap<String, Account>,
    order: Vec<String>,
    last_decisions: HashMap<String, String>,
    chart: VecDeque<ChartPoint>,
    last_ts: i64,
    tick: u64,
}

impl SimulationClock {
    pub fn new(
        symbols: Vec<String>,
        benchmark: String,
        params: SimParams,
        registry: Arc<StrategyRegistry>,
        sink: EventSink,
        persist: Option<PersistHandle>,
    ) -> Self {
        let ledger = Ledger::new(params.clone());
        let risk = RiskController::new(params.clone());
        Self {
            symbols,
            benchmark,
            params,
            registry,
            ledger,
            risk,
            sink,
            persist,
            default_agents: Vec::new(),
            accounts: HashMap::new(),
            order: Vec::new(),
            last_decisions: HashMap::new(),
            chart: VecDeque::new(),
            last_ts: 0,
            tick: 0,
        }
    }

    /// Agents loaded here are also the reseed set for Reset/SoftReset.
    pub fn load_default_agents(&mut self, agents: &[(String, StrategyKind)]) {
        self.default_agents = agents.to_vec();
        for (name, kind) in agents {
            self.load_agent(name, *kind);
        }
    }

    pub fn load_agent(&mut self, name: &str, kind: StrategyKind) {
        self.registry.load(name, kind);
        self.ensure_account(name);
    }

    /// Caller-supplied implementation behind the same contract.
    pub fn load_custom_agent(&mut self, name: &str, strategy: Arc<dyn Strategy>) {
        self.registry.load_custom(name, strategy);
        self.ensure_account(name);
    }

    fn ensure_account(&mut self, name: &str) {
        if !self.accounts.contains_key(name) {
            self.accounts
                .insert(name.to_string(), Account::new(name, self.params.starting_cash, &self.symbols));
            self.order.push(name.to_string());
        }
    }

    pub fn unload_agent(&mut self, name: &str) {
        self.registry.unload(name);
        self.accounts.remove(name);
        self.order.retain(|n| n != name);
        self.last_decisions.remove(name);
    }

    pub fn reload_agent(&mut self, name: &str) -> bool {
        self.registry.reload(name)
    }

    pub fn account(&self, name: &str) -> Option<&Account> {
        self.accounts.get(name)
    }

    pub fn chart_len(&self) -> usize {
        self.chart.len()
    }

    fn reseed(&mut self) {
        for name in self.order.clone() {
            self.registry.unload(&name);
        }
        self.accounts.clear();
        self.order.clear();
        self.last_decisions.clear();
        self.chart.clear();
        self.last_ts = 0;
        self.tick = 0;
        for (name, kind) in self.default_agents.clone() {
            self.load_agent(&name, kind);
        }
    }

    /// Seed state recovered from the store on restart. Only accounts whose
    /// agent is currently loaded are taken; the chart tail is bounded as
    /// usual and the newest restored timestamp primes the dedup so the same
    /// snapshot is not processed twice across a restart.
    pub fn restore(&mut self, accounts: Vec<Account>, chart: Vec<ChartPoint>) {
        for acct in accounts {
            if self.accounts.contains_key(&acct.name) {
                info!(agent = %acct.name, equity = acct.equity, "clock: account restored");
                self.accounts.insert(acct.name.clone(), acct);
            }
        }
        let skip = chart.len().saturating_sub(self.params.chart_history_cap);
        for point in chart.into_iter().skip(skip) {
            self.last_ts = self.last_ts.max(point.timestamp_ms);
            self.chart.push_back(point);
        }
    }

    pub async fn reset(&mut self) {
        info!("clock: reset (persisted history wiped)");
        if let Some(p) = &self.persist {
            p.delete_all().await;
        }
        self.reseed();
    }

    pub fn soft_reset(&mut self) {
        info!("clock: soft reset");
        self.reseed();
    }

    /// One pipeline pass over a snapshot. Returns false when the snapshot
    /// was a stale duplicate and nothing ran.
    pub fn run_tick(&mut self, snap: &Snapshot) -> bool {
        if snap.timestamp_ms == self.last_ts {
            SNAPSHOTS_STALE.inc();
            return false;
        }
        self.last_ts = snap.timestamp_ms;

        let bench_price = snap.price(&self.benchmark);
        if bench_price > 0.0 && snap.timestamp_ms > 0 {
            self.sink
                .publish(Event::MarketTick { price: bench_price, timestamp: snap.timestamp_ms });
        }

        for name in self.order.clone() {
            self.step_agent(&name, snap);
        }

        // Chart point with post-trade equities.
        if bench_price > 0.0 && snap.timestamp_ms > 0 {
            let mut agents = HashMap::new();
            for (name, acct) in self.accounts.iter() {
                agents.insert(name.clone(), acct.equity);
            }
            let point =
                ChartPoint { timestamp_ms: snap.timestamp_ms, price: bench_price, agents };
            if self.chart.len() == self.params.chart_history_cap {
                self.chart.pop_front();
            }
            self.chart.push_back(point.clone());
            if let Some(p) = &self.persist {
                p.insert_chart_point(point.clone());
            }
            self.sink.publish(Event::ChartTick(point));
        }

        self.sink.publish(Event::LeaderboardUpdate(self.leaderboard()));

        TICKS.inc();
        self.tick += 1;
        true
    }

    fn step_agent(&mut self, name: &str, snap: &Snapshot) {
        let Some(account) = self.accounts.get_mut(name) else { return };

        let tail_start = account.trade_history.len().saturating_sub(HISTORY_TAIL);
        let history_tail: Vec<TradeRecord> = account.trade_history[tail_start..].to_vec();

        let output = {
            let ctx = build_ctx(account, snap, self.tick, None, &history_tail);
            self.registry.invoke(name, &ctx)
        };
        if let Some(state) = output.custom_state {
            account.custom_state = state;
        }

        let (intent, coerced) = validate(output.intent, &self.symbols);
        INTENTS.with_label_values(&[name, intent.action.as_str()]).inc();
        if coerced {
            INTENTS_COERCED.with_label_values(&[name]).inc();
        }
        let decision = match &intent.symbol {
            Some(sym) if intent.action != Action::Hold => {
                format!("{} {}", intent.action.as_str(), sym)
            }
            _ => intent.action.as_str().to_string(),
        };
        self.last_decisions.insert(name.to_string(), decision);

        if intent.action != Action::Hold {
            match self.ledger.execute(account, &intent, snap) {
                Ok(fill) => {
                    TRADES.with_label_values(&[name]).inc();
                    self.sink.publish(Event::TradeLog {
                        agent: name.to_string(),
                        action: intent.action,
                        symbol: intent.symbol.clone().unwrap_or_default(),
                        price: fill.filled_price,
                        timestamp: snap.timestamp_ms,
                        fee: fill.fee,
                    });
                }
                Err(reject) => {
                    REJECTS.with_label_values(&[name]).inc();
                    debug!(agent = %name, %reject, "clock: order rejected");
                }
            }
        }

        // Per-tick return against last tick's marked equity, taken before
        // any risk reset rewrites the equity field.
        let prev_equity = account.equity;
        if prev_equity > 0.0 {
            account.returns_history.push(account.mark_equity(snap) / prev_equity - 1.0);
            if account.returns_history.len() > RETURNS_CAP {
                account.returns_history.remove(0);
            }
        }

        if let Some(event) = self.risk.apply(account, snap) {
            self.sink.publish(event);
        }

        AGENT_EQUITY.with_label_values(&[name]).set(account.equity);
        AGENT_ROI.with_label_values(&[name]).set(account.roi);
        if let Some(p) = &self.persist {
            p.upsert_account(account);
        }
    }

    pub fn leaderboard(&self) -> Vec<LeaderboardRow> {
        let mut rows: Vec<LeaderboardRow> = self
            .order
            .iter()
            .filter_map(|name| self.accounts.get(name))
            .map(|a| LeaderboardRow {
                name: a.name.clone(),
                equity: a.equity,
                roi: a.roi,
                cash: a.cash,
                total_fees: a.total_fees,
                cashed_out: a.cashed_out,
                portfolio: a.holdings.clone(),
                last_decision: self
                    .last_decisions
                    .get(&a.name)
                    .cloned()
                    .unwrap_or_else(|| "HOLD".into()),
                trades: a.trades_count,
                win_rate: a.win_rate(),
                sharpe: a.sharpe(),
            })
            .collect();
        rows.sort_by(|x, y| y.equity.partial_cmp(&x.equity).unwrap_or(std::cmp::Ordering::Equal));
        rows
    }

    /// Main loop: poll the watch slot on a short cadence (dedup makes the
    /// repeats free), handle control commands between ticks.
    pub async fn run(
        mut self,
        snap_rx: watch::Receiver<Option<Arc<Snapshot>>>,
        mut cmd_rx: mpsc::Receiver<Command>,
        running: Arc<AtomicBool>,
    ) {
        info!(agents = self.order.len(), "clock: started");
        while running.load(Ordering::Relaxed) {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::LoadAgent { name, kind }) => self.load_agent(&name, kind),
                    Some(Command::ReloadAgent { name }) => { self.reload_agent(&name); }
                    Some(Command::UnloadAgent { name }) => self.unload_agent(&name),
                    Some(Command::Reset) => self.reset().await,
                    Some(Command::SoftReset) => self.soft_reset(),
                    Some(Command::Stop) | None => running.store(false, Ordering::Relaxed),
                },
                _ = sleep(Duration::from_millis(100)) => {
                    let snap = snap_rx.borrow().clone();
                    if let Some(snap) = snap {
                        self.run_tick(&snap);
                    }
                }
            }
        }
        info!(ticks = self.tick, "clock: stopped");
    }
}
