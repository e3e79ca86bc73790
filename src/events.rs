// ===============================
// src/events.rs (outbound event fan-out)
// ===============================
//
// Thin wrapper over a bounded mpsc channel. Publishing never blocks the
// tick loop: on overflow the event is dropped and counted. A single sink
// task drains the channel and renders one structured log line per event;
// anything that wants the full payload (a UI, a websocket bridge) would
// subscribe here instead.
//

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::Event;
use crate::metrics::EVENTS_DROPPED;

#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Best-effort publish. Drops (and counts) on a full queue.
    pub fn publish(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            EVENTS_DROPPED.inc();
        }
    }
}

/// Drains the sink queue until every sender is gone.
pub async fn run(mut rx: mpsc::Receiver<Event>) {
    info!("events: sink started");
    while let Some(event) = rx.recv().await {
        match event {
            Event::MarketTick { price, timestamp } => {
                debug!(price, timestamp, "event: market_tick");
            }
            Event::ChartTick(point) => {
                debug!(
                    timestamp = point.timestamp_ms,
                    price = point.price,
                    agents = point.agents.len(),
                    "event: chart_tick"
                );
            }
            Event::TradeLog { agent, action, symbol, price, fee, .. } => {
                info!(
                    %agent,
                    action = action.as_str(),
                    %symbol,
                    price = format!("{price:.4}"),
                    fee = format!("{fee:.6}"),
                    "event: trade"
                );
            }
            Event::LeaderboardUpdate(rows) => {
                if let Some(top) = rows.first() {
                    debug!(
                        leader = %top.name,
                        equity = format!("{:.2}", top.equity),
                        agents = rows.len(),
                        "event: leaderboard"
                    );
                }
            }
            Event::AgentCashout { agent, profit, total_cashed_out, .. } => {
                info!(
                    %agent,
                    profit = format!("{profit:.4}"),
                    total = format!("{total_cashed_out:.4}"),
                    "event: cashout"
                );
            }
            Event::EmergencyStop { agent, loss, final_equity, .. } => {
                warn!(
                    %agent,
                    loss = format!("{loss:.4}"),
                    final_equity = format!("{final_equity:.4}"),
                    "event: emergency_stop"
                );
            }
        }
    }
    info!("events: sink stopped");
}
