// ===============================
// src/config.rs
// ===============================
use std::env;

use dotenvy::dotenv;

use crate::strategy::StrategyKind;

/// Market data source mode
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Rest,
}

impl FeedMode {
    pub fn from_env(key: &str, default_mode: FeedMode) -> FeedMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => FeedMode::Mock,
            "rest" => FeedMode::Rest,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Mock => "mock",
            FeedMode::Rest => "rest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Args {
    pub symbols: Vec<String>,
    pub benchmark: String,

    pub record_dir: Option<String>,
    pub metrics_port: u16,

    pub feed_mode: FeedMode,
    pub rest_url: String,
    pub tick_interval_ms: u64,

    /// AGENTS=Scalper=momentum,Captain=mean_reversion,Hunter=breakout
    pub agents: Vec<(String, StrategyKind)>,
}

/// Execution and risk knobs shared by the ledger and the risk controller.
#[derive(Clone, Debug)]
pub struct SimParams {
    pub starting_cash: f64,
    pub fee_rate: f64,
    pub slippage_min: f64,
    pub slippage_max: f64,
    pub max_leverage: f64,
    pub cashout_threshold_pct: f64,
    pub emergency_stop_pct: f64,
    pub trade_history_cap: usize,
    pub chart_history_cap: usize,
    pub persist_queue_cap: usize,
    pub event_queue_cap: usize,
    pub feed_backoff_max_secs: u64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            starting_cash: 100.0,
            fee_rate: 0.000_75,
            slippage_min: 0.000_1,
            slippage_max: 0.000_5,
            max_leverage: 4.0,
            cashout_threshold_pct: 0.50,
            emergency_stop_pct: -2.0,
            trade_history_cap: 100,
            chart_history_cap: 50_000,
            persist_queue_cap: 8192,
            event_queue_cap: 4096,
            feed_backoff_max_secs: 32,
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn parse_agents(raw: &str) -> Vec<(String, StrategyKind)> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, kind) = pair.split_once('=')?;
            let kind = StrategyKind::parse(kind.trim())?;
            let name = name.trim();
            if name.is_empty() { None } else { Some((name.to_string(), kind)) }
        })
        .collect()
}

pub fn load() -> (Args, SimParams) {
    let _ = dotenv();

    // ===== Symbols =====
    let symbols: Vec<String> = env::var("SYMBOLS")
        .ok()
        .map(|s| {
            s.split(',')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| x.to_ascii_uppercase())
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| vec!["BTC".into(), "ETH".into(), "SOL".into()]);

    let benchmark = env::var("BENCHMARK")
        .map(|s| s.to_ascii_uppercase())
        .ok()
        .filter(|b| symbols.contains(b))
        .unwrap_or_else(|| symbols[0].clone());

    // ===== Files / metrics =====
    let record_dir = env::var("RECORD_DIR").ok();
    let metrics_port = env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9898);

    // ===== Feed =====
    let feed_mode = FeedMode::from_env("FEED_MODE", FeedMode::Mock);
    let rest_url = env::var("REST_URL").unwrap_or_else(|_| "http://127.0.0.1:8080/snapshot".into());
    let tick_interval_ms = env_u64("TICK_INTERVAL_MS", 1000);

    // ===== Agents =====
    let agents = env::var("AGENTS")
        .ok()
        .map(|raw| parse_agents(&raw))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| {
            vec![
                ("Aggressive_Scalper".into(), StrategyKind::Momentum),
                ("Conservative_Captain".into(), StrategyKind::MeanReversion),
                ("Volatility_Hunter".into(), StrategyKind::Breakout),
            ]
        });

    let args = Args {
        symbols,
        benchmark,
        record_dir,
        metrics_port,
        feed_mode,
        rest_url,
        tick_interval_ms,
        agents,
    };

    // ===== Simulation parameters =====
    let d = SimParams::default();
    let params = SimParams {
        starting_cash: env_f64("STARTING_CASH", d.starting_cash),
        fee_rate: env_f64("FEE_RATE", d.fee_rate),
        slippage_min: env_f64("SLIPPAGE_MIN", d.slippage_min),
        slippage_max: env_f64("SLIPPAGE_MAX", d.slippage_max),
        max_leverage: env_f64("MAX_LEVERAGE", d.max_leverage),
        cashout_threshold_pct: env_f64("CASHOUT_THRESHOLD_PCT", d.cashout_threshold_pct),
        emergency_stop_pct: env_f64("EMERGENCY_STOP_PCT", d.emergency_stop_pct),
        trade_history_cap: env_u64("TRADE_HISTORY_CAP", d.trade_history_cap as u64) as usize,
        chart_history_cap: env_u64("CHART_HISTORY_CAP", d.chart_history_cap as u64) as usize,
        persist_queue_cap: env_u64("PERSIST_QUEUE_CAP", d.persist_queue_cap as u64) as usize,
        event_queue_cap: env_u64("EVENT_QUEUE_CAP", d.event_queue_cap as u64) as usize,
        feed_backoff_max_secs: env_u64("FEED_BACKOFF_MAX_SECS", d.feed_backoff_max_secs),
    };

    (args, params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_agents_skips_malformed_entries() {
        let agents = parse_agents("A=momentum, B=mean_reversion ,=breakout,C=unknown,D=breakout");
        assert_eq!(agents.len(), 3);
        assert_eq!(agents[0].0, "A");
        assert_eq!(agents[2], ("D".to_string(), StrategyKind::Breakout));
    }
}
