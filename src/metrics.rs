// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Feed / clock --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "simulation ticks processed").unwrap());

pub static SNAPSHOTS_STALE: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("snapshots_stale_total", "snapshot reads with unchanged timestamp").unwrap()
});

pub static FEED_ERRORS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("feed_errors_total", "market source fetch failures").unwrap());

// -------- Agents --------
pub static INTENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("intents_total", "strategy intents (labels: agent, action)"),
        &["agent", "action"],
    )
    .unwrap()
});

pub static INTENTS_COERCED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("intents_coerced_total", "invalid or failed intents downgraded to HOLD"),
        &["agent"],
    )
    .unwrap()
});

pub static TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("trades_total", "filled orders"), &["agent"]).unwrap()
});

pub static REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rejects_total", "orders rejected by the ledger"),
        &["agent"],
    )
    .unwrap()
});

pub static AGENT_EQUITY: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("agent_equity", "mark-to-market equity"), &["agent"]).unwrap()
});

pub static AGENT_ROI: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(Opts::new("agent_roi", "ROI percent vs starting cash"), &["agent"]).unwrap()
});

pub static CASHOUTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("cashouts_total", "profit lock-in events"), &["agent"]).unwrap()
});

pub static EMERGENCY_STOPS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("emergency_stops_total", "forced liquidation events"),
        &["agent"],
    )
    .unwrap()
});

// -------- Persistence / events --------
pub static PERSIST_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("persist_queue_dropped_total", "records dropped on queue overflow").unwrap()
});

pub static PERSIST_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("persist_errors_total", "best-effort store write failures").unwrap()
});

pub static EVENTS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("events_dropped_total", "events dropped on sink overflow").unwrap()
});

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_feed_mode", "feed mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub static CONFIG_AGENT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_agent", "loaded agents (labels: agent, strategy)"),
        &["agent", "strategy"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(SNAPSHOTS_STALE.clone())),
        REGISTRY.register(Box::new(FEED_ERRORS.clone())),
        REGISTRY.register(Box::new(INTENTS.clone())),
        REGISTRY.register(Box::new(INTENTS_COERCED.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(REJECTS.clone())),
        REGISTRY.register(Box::new(AGENT_EQUITY.clone())),
        REGISTRY.register(Box::new(AGENT_ROI.clone())),
        REGISTRY.register(Box::new(CASHOUTS.clone())),
        REGISTRY.register(Box::new(EMERGENCY_STOPS.clone())),
        REGISTRY.register(Box::new(PERSIST_DROPPED.clone())),
        REGISTRY.register(Box::new(PERSIST_ERRORS.clone())),
        REGISTRY.register(Box::new(EVENTS_DROPPED.clone())),
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
        REGISTRY.register(Box::new(CONFIG_AGENT.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                eprintln!("metrics bind {} failed: {}", addr, e);
                return;
            }
        };
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
