// ===============================
// src/strategy.rs
// ===============================
//
// Builtin strategy catalog:
// 1) Momentum       -> signal-scored entries, PnL-based exits, tick cooldown
// 2) MeanReversion  -> rolling-mean band around the mid price
// 3) Breakout       -> rolling high/low range break
//
// A strategy is a pure function of its call context. Any state it wants to
// keep between ticks (cooldown counters, price windows, remembered entries)
// travels through the per-agent `custom` blob the engine hands back on every
// call — never through process-wide globals, so reloaded instances cannot
// corrupt each other.
//
// The registry isolates every strategy behind one invocation contract:
// a panic inside decide() is caught and downgraded to HOLD, and hot reload
// is an atomic swap of the active Arc taken under a lock held only for the
// swap itself, never across an invocation.
//

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::domain::{Account, Action, Snapshot, TradeIntent, TradeRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Momentum,
    MeanReversion,
    Breakout,
}

impl StrategyKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "momentum" | "mom" => Some(StrategyKind::Momentum),
            "mean_reversion" | "meanreversion" | "mr" => Some(StrategyKind::MeanReversion),
            "breakout" | "vol_breakout" | "vb" => Some(StrategyKind::Breakout),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Momentum => "momentum",
            StrategyKind::MeanReversion => "mean_reversion",
            StrategyKind::Breakout => "breakout",
        }
    }

    fn build(&self) -> Arc<dyn Strategy> {
        match self {
            StrategyKind::Momentum => Arc::new(Momentum::default()),
            StrategyKind::MeanReversion => Arc::new(MeanReversion::default()),
            StrategyKind::Breakout => Arc::new(Breakout::default()),
        }
    }
}

/// Unrealized PnL of one open position, computed by the clock from the
/// recorded entry price and the live price.
#[derive(Debug, Clone, Serialize)]
pub struct PnlView {
    pub pnl_percent: f64,
    pub pnl_value: f64,
    pub entry_price: f64,
    pub current_price: f64,
}

pub struct AgentState<'a> {
    pub entry_prices: &'a HashMap<String, f64>,
    pub current_pnl: HashMap<String, PnlView>,
    pub custom: &'a Value,
    /// Tail of the account's trade log (most recent last, at most 20 rows).
    pub trade_history: &'a [TradeRecord],
}

pub struct StrategyCtx<'a> {
    pub snapshot: &'a Snapshot,
    pub tick: u64,
    pub cash: f64,
    pub portfolio: &'a HashMap<String, f64>,
    pub market_state: Option<&'a Value>,
    pub agent_state: AgentState<'a>,
}

pub struct StrategyOutput {
    pub intent: TradeIntent,
    /// Replacement for the agent's custom blob; None leaves it unchanged.
    pub custom_state: Option<Value>,
}

impl StrategyOutput {
    pub fn hold() -> Self {
        Self { intent: TradeIntent::hold(), custom_state: None }
    }
}

pub trait Strategy: Send + Sync {
    fn decide(&self, ctx: &StrategyCtx) -> StrategyOutput;
}

/// Engine-side intent validation: a malformed quantity or unknown symbol is
/// coerced to HOLD rather than escalated. Returns (intent, was_coerced).
pub fn validate(intent: TradeIntent, symbols: &[String]) -> (TradeIntent, bool) {
    if intent.action == Action::Hold {
        return (TradeIntent::hold(), false);
    }
    if !intent.quantity.is_finite() || intent.quantity <= 0.0 {
        return (TradeIntent::hold(), true);
    }
    match &intent.symbol {
        Some(sym) if symbols.contains(sym) => (intent, false),
        _ => (TradeIntent::hold(), true),
    }
}

// -----------------------------------------------------------------------------
// Registry
// -----------------------------------------------------------------------------

struct AgentSlot {
    kind: Option<StrategyKind>,
    // Locked only to swap or clone the active pointer, never across decide().
    active: Mutex<Arc<dyn Strategy>>,
}

#[derive(Default)]
pub struct StrategyRegistry {
    slots: RwLock<HashMap<String, Arc<AgentSlot>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, name: &str, kind: StrategyKind) -> bool {
        let slot = Arc::new(AgentSlot { kind: Some(kind), active: Mutex::new(kind.build()) });
        self.slots.write().unwrap().insert(name.to_string(), slot);
        info!(agent = %name, strategy = kind.as_str(), "registry: loaded");
        true
    }

    /// Register a caller-supplied implementation (externally authored code
    /// behind the same contract). Not reloadable from a kind.
    pub fn load_custom(&self, name: &str, strategy: Arc<dyn Strategy>) {
        let slot = Arc::new(AgentSlot { kind: None, active: Mutex::new(strategy) });
        self.slots.write().unwrap().insert(name.to_string(), slot);
        info!(agent = %name, strategy = "custom", "registry: loaded");
    }

    /// Atomic swap of the active implementation. The account is untouched;
    /// the swap can only interleave between ticks because invoke() holds the
    /// same slot lock while cloning the pointer.
    pub fn reload(&self, name: &str) -> bool {
        let slot = match self.slots.read().unwrap().get(name) {
            Some(s) => s.clone(),
            None => return false,
        };
        let Some(kind) = slot.kind else {
            warn!(agent = %name, "registry: custom strategy is not reloadable");
            return false;
        };
        let fresh = kind.build();
        *slot.active.lock().unwrap() = fresh;
        info!(agent = %name, strategy = kind.as_str(), "registry: reloaded");
        true
    }

    pub fn unload(&self, name: &str) {
        if self.slots.write().unwrap().remove(name).is_some() {
            info!(agent = %name, "registry: unloaded");
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.read().unwrap().contains_key(name)
    }

    /// Invoke the agent's active strategy once. A panic inside the strategy
    /// body is caught and converted to HOLD so one broken agent never stops
    /// the clock or the others.
    pub fn invoke(&self, name: &str, ctx: &StrategyCtx) -> StrategyOutput {
        let strategy = {
            let slots = self.slots.read().unwrap();
            match slots.get(name) {
                Some(slot) => slot.active.lock().unwrap().clone(),
                None => return StrategyOutput::hold(),
            }
        };

        match panic::catch_unwind(AssertUnwindSafe(|| strategy.decide(ctx))) {
            Ok(out) => out,
            Err(_) => {
                warn!(agent = %name, tick = ctx.tick, "strategy panicked, holding");
                StrategyOutput::hold()
            }
        }
    }
}

// -----------------------------------------------------------------------------
// 1) MOMENTUM
//    Entries: score each symbol from the supplied alpha signals (sentiment,
//    attention, order-book imbalance, OFI, micro-price premium) and buy the
//    best candidate above a threshold. Exits: take profit / stop loss on the
//    unrealized PnL the engine computes per open position.
// -----------------------------------------------------------------------------

#[derive(Default, Serialize, Deserialize)]
struct MomentumState {
    last_trade_tick: u64,
}

pub struct Momentum {
    cooldown_ticks: u64,
    take_profit_pct: f64,
    stop_loss_pct: f64,
    entry_fraction: f64,
}

impl Default for Momentum {
    fn default() -> Self {
        Self { cooldown_ticks: 60, take_profit_pct: 3.0, stop_loss_pct: -5.0, entry_fraction: 0.3 }
    }
}

impl Strategy for Momentum {
    fn decide(&self, ctx: &StrategyCtx) -> StrategyOutput {
        let mut st: MomentumState =
            serde_json::from_value(ctx.agent_state.custom.clone()).unwrap_or_default();

        if ctx.tick.saturating_sub(st.last_trade_tick) < self.cooldown_ticks && st.last_trade_tick > 0 {
            return StrategyOutput::hold();
        }

        // Exits first: close any position past its profit target or stop.
        for (sym, qty) in ctx.portfolio.iter() {
            if *qty <= 0.0 {
                continue;
            }
            if let Some(pnl) = ctx.agent_state.current_pnl.get(sym) {
                if pnl.pnl_percent >= self.take_profit_pct || pnl.pnl_percent <= self.stop_loss_pct {
                    st.last_trade_tick = ctx.tick;
                    return StrategyOutput {
                        intent: TradeIntent { action: Action::Sell, symbol: Some(sym.clone()), quantity: *qty },
                        custom_state: serde_json::to_value(&st).ok(),
                    };
                }
            }
        }

        // Entry: best-scoring flat symbol.
        let mut best: Option<(&String, i32, f64)> = None;
        for (sym, tick) in ctx.snapshot.ticks.iter() {
            if ctx.portfolio.get(sym).copied().unwrap_or(0.0) != 0.0 || tick.price <= 0.0 {
                continue;
            }
            let s = &tick.signals;
            let mut score = 0;
            if s.sentiment > 0.6 && s.attention > 1.0 {
                score += 3;
            }
            if s.obi_weighted > 0.2 {
                score += 2;
            }
            if s.ofi > 0.0 {
                score += 1;
            }
            if s.micro_price > tick.price {
                score += 1;
            }
            if best.map(|(_, b, _)| score > b).unwrap_or(true) {
                best = Some((sym, score, tick.price));
            }
        }

        if let Some((sym, score, price)) = best {
            if score >= 4 {
                let quantity = (ctx.cash * self.entry_fraction) / price;
                if quantity > 0.0 {
                    st.last_trade_tick = ctx.tick;
                    return StrategyOutput {
                        intent: TradeIntent { action: Action::Buy, symbol: Some(sym.clone()), quantity },
                        custom_state: serde_json::to_value(&st).ok(),
                    };
                }
            }
        }
        StrategyOutput::hold()
    }
}

// -----------------------------------------------------------------------------
// 2) MEAN-REVERSION
//    Keeps a rolling mid-price window per symbol in the custom blob. Buys a
//    dip below the mean band, sells held positions back above it. Needs a
//    full window before trading; whipsaw is damped by the cooldown.
// -----------------------------------------------------------------------------

#[derive(Default, Serialize, Deserialize)]
struct WindowState {
    windows: std::collections::HashMap<String, VecDeque<f64>>,
    last_trade_tick: u64,
}

impl WindowState {
    fn push(&mut self, sym: &str, price: f64, cap: usize) -> &VecDeque<f64> {
        let win = self.windows.entry(sym.to_string()).or_default();
        if win.len() == cap {
            win.pop_front();
        }
        win.push_back(price);
        win
    }
}

pub struct MeanReversion {
    window: usize,
    edge: f64,
    cooldown_ticks: u64,
    entry_fraction: f64,
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self { window: 64, edge: 0.002, cooldown_ticks: 30, entry_fraction: 0.2 }
    }
}

impl Strategy for MeanReversion {
    fn decide(&self, ctx: &StrategyCtx) -> StrategyOutput {
        let mut st: WindowState =
            serde_json::from_value(ctx.agent_state.custom.clone()).unwrap_or_default();

        let mut intent = TradeIntent::hold();
        for (sym, tick) in ctx.snapshot.ticks.iter() {
            let mid = if tick.bid > 0.0 && tick.ask > 0.0 { (tick.bid + tick.ask) / 2.0 } else { tick.price };
            let win = st.push(sym, mid, self.window);
            if win.len() < self.window || intent.action != Action::Hold {
                continue;
            }
            let fair: f64 = win.iter().sum::<f64>() / win.len() as f64;
            let held = ctx.portfolio.get(sym).copied().unwrap_or(0.0);

            let cooled = ctx.tick.saturating_sub(st.last_trade_tick) >= self.cooldown_ticks
                || st.last_trade_tick == 0;
            if !cooled {
                continue;
            }

            if held > 0.0 && tick.price > fair * (1.0 + self.edge) {
                intent = TradeIntent { action: Action::Sell, symbol: Some(sym.clone()), quantity: held };
            } else if held == 0.0 && tick.price < fair * (1.0 - self.edge) && tick.price > 0.0 {
                let quantity = (ctx.cash * self.entry_fraction) / tick.price;
                if quantity > 0.0 {
                    intent = TradeIntent { action: Action::Buy, symbol: Some(sym.clone()), quantity };
                }
            }
        }

        if intent.action != Action::Hold {
            st.last_trade_tick = ctx.tick;
        }
        StrategyOutput { intent, custom_state: serde_json::to_value(&st).ok() }
    }
}

// -----------------------------------------------------------------------------
// 3) BREAKOUT
//    Rolling high/low per symbol in the blob; buys an upside range break with
//    a small buffer, exits when the price falls back below the rolling low.
// -----------------------------------------------------------------------------

pub struct Breakout {
    window: usize,
    edge: f64,
    cooldown_ticks: u64,
    entry_fraction: f64,
}

impl Default for Breakout {
    fn default() -> Self {
        Self { window: 100, edge: 0.001, cooldown_ticks: 20, entry_fraction: 0.25 }
    }
}

impl Strategy for Breakout {
    fn decide(&self, ctx: &StrategyCtx) -> StrategyOutput {
        let mut st: WindowState =
            serde_json::from_value(ctx.agent_state.custom.clone()).unwrap_or_default();

        let mut intent = TradeIntent::hold();
        for (sym, tick) in ctx.snapshot.ticks.iter() {
            // Range is computed over the window *before* this tick's price.
            let prior: Vec<f64> = st
                .windows
                .get(sym)
                .map(|w| w.iter().copied().collect())
                .unwrap_or_default();
            st.push(sym, tick.price, self.window);

            if prior.len() < self.window - 1 || intent.action != Action::Hold {
                continue;
            }
            let hi = prior.iter().copied().fold(f64::MIN, f64::max);
            let lo = prior.iter().copied().fold(f64::MAX, f64::min);
            let held = ctx.portfolio.get(sym).copied().unwrap_or(0.0);

            let cooled = ctx.tick.saturating_sub(st.last_trade_tick) >= self.cooldown_ticks
                || st.last_trade_tick == 0;
            if !cooled {
                continue;
            }

            if held == 0.0 && tick.price > hi * (1.0 + self.edge) {
                let quantity = (ctx.cash * self.entry_fraction) / tick.price;
                if quantity > 0.0 {
                    intent = TradeIntent { action: Action::Buy, symbol: Some(sym.clone()), quantity };
                }
            } else if held > 0.0 && tick.price < lo * (1.0 - self.edge) {
                intent = TradeIntent { action: Action::Sell, symbol: Some(sym.clone()), quantity: held };
            }
        }

        if intent.action != Action::Hold {
            st.last_trade_tick = ctx.tick;
        }
        StrategyOutput { intent, custom_state: serde_json::to_value(&st).ok() }
    }
}

/// Build the call context for one agent on one tick, including per-position
/// unrealized PnL derived from recorded entry prices and live marks.
pub fn build_ctx<'a>(
    account: &'a Account,
    snapshot: &'a Snapshot,
    tick: u64,
    market_state: Option<&'a Value>,
    history_tail: &'a [TradeRecord],
) -> StrategyCtx<'a> {
    let mut current_pnl = HashMap::new();
    for (sym, qty) in account.holdings.iter() {
        if *qty == 0.0 {
            continue;
        }
        let Some(entry) = account.entry_prices.get(sym).copied() else { continue };
        let current = snapshot.price(sym);
        if entry <= 0.0 || current <= 0.0 {
            continue;
        }
        let pnl_percent = if *qty > 0.0 {
            (current - entry) / entry * 100.0
        } else {
            (entry - current) / entry * 100.0
        };
        let pnl_value = if *qty > 0.0 {
            (current - entry) * qty
        } else {
            (entry - current) * qty.abs()
        };
        current_pnl.insert(
            sym.clone(),
            PnlView { pnl_percent, pnl_value, entry_price: entry, current_price: current },
        );
    }

    StrategyCtx {
        snapshot,
        tick,
        cash: account.cash,
        portfolio: &account.holdings,
        market_state,
        agent_state: AgentState {
            entry_prices: &account.entry_prices,
            current_pnl,
            custom: &account.custom_state,
            trade_history: history_tail,
        },
    }
}
