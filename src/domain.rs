// ===============================
// src/domain.rs
// ===============================
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action { Buy, Sell, Hold }

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self { Action::Buy => "BUY", Action::Sell => "SELL", Action::Hold => "HOLD" }
    }
}

/// Derived per-symbol signals supplied by the snapshot source. The engine
/// never computes these, it only hands them to strategies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signals {
    pub obi_weighted: f64,
    pub micro_price: f64,
    pub sentiment: f64,
    pub ofi: f64,
    pub taker_ratio: f64,
    pub parkinson_vol: f64,
    pub attention: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub bid: f64,
    pub ask: f64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub signals: Signals,
    pub timestamp_ms: i64,
}

/// One coherent market observation: symbol -> Tick, all sharing a logical
/// timestamp. Immutable once published; shared between tasks as Arc<Snapshot>.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp_ms: i64,
    pub ticks: HashMap<String, Tick>,
}

impl Snapshot {
    pub fn price(&self, symbol: &str) -> f64 {
        self.ticks.get(symbol).map(|t| t.price).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub action: Action,
    pub symbol: Option<String>,
    pub quantity: f64,
}

impl TradeIntent {
    pub fn hold() -> Self { Self { action: Action::Hold, symbol: None, quantity: 0.0 } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub action: Action,
    pub symbol: String,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct FillResult {
    pub filled_price: f64,
    pub fee: f64,
    pub quantity: f64,
    pub new_position: f64,
}

/// Simulated cash+position account, one per loaded agent. Holdings sign
/// encodes direction: >0 long, <0 short, 0 flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    pub cash: f64,
    pub equity: f64,
    pub roi: f64,
    pub cashed_out: f64,
    pub total_fees: f64,
    pub holdings: HashMap<String, f64>,
    pub entry_prices: HashMap<String, f64>,
    pub custom_state: serde_json::Value,
    pub trade_history: Vec<TradeRecord>,
    /// Per-tick equity returns (bounded by the clock), feeds the Sharpe column.
    pub returns_history: Vec<f64>,
    pub trades_count: u64,
    pub wins: u64,
}

impl Account {
    pub fn new(name: &str, starting_cash: f64, symbols: &[String]) -> Self {
        let mut holdings = HashMap::new();
        for s in symbols {
            holdings.insert(s.clone(), 0.0);
        }
        Self {
            name: name.to_string(),
            cash: starting_cash,
            equity: starting_cash,
            roi: 0.0,
            cashed_out: 0.0,
            total_fees: 0.0,
            holdings,
            entry_prices: HashMap::new(),
            custom_state: serde_json::Value::Null,
            trade_history: Vec::new(),
            returns_history: Vec::new(),
            trades_count: 0,
            wins: 0,
        }
    }

    /// cash + mark-to-market of every open position.
    pub fn mark_equity(&self, snap: &Snapshot) -> f64 {
        let mut equity = self.cash;
        for (sym, qty) in self.holdings.iter() {
            if *qty != 0.0 {
                equity += qty * snap.price(sym);
            }
        }
        equity
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades_count == 0 { 0.0 } else { self.wins as f64 / self.trades_count as f64 * 100.0 }
    }

    /// Annualization-free Sharpe over the recorded per-tick returns.
    pub fn sharpe(&self) -> f64 {
        let n = self.returns_history.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.returns_history.iter().sum::<f64>() / n as f64;
        let var = self
            .returns_history
            .iter()
            .map(|r| (r - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        let std = var.sqrt();
        if std <= 0.0 { 0.0 } else { mean / std * (n as f64).sqrt() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartPoint {
    pub timestamp_ms: i64,
    pub price: f64,
    pub agents: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardRow {
    pub name: String,
    pub equity: f64,
    pub roi: f64,
    pub cash: f64,
    pub total_fees: f64,
    pub cashed_out: f64,
    pub portfolio: HashMap<String, f64>,
    pub last_decision: String,
    pub trades: u64,
    pub win_rate: f64,
    pub sharpe: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    MarketTick { price: f64, timestamp: i64 },
    ChartTick(ChartPoint),
    TradeLog { agent: String, action: Action, symbol: String, price: f64, timestamp: i64, fee: f64 },
    LeaderboardUpdate(Vec<LeaderboardRow>),
    AgentCashout { agent: String, profit: f64, total_cashed_out: f64, timestamp: i64 },
    EmergencyStop { agent: String, loss: f64, final_equity: f64, timestamp: i64 },
}
