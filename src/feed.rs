// ===============================
// src/feed.rs
// ===============================
//
// Market data feed:
// - MarketSource    : pull contract (fetch one Snapshot or fail transiently)
// - MockSource      : random-walk generator with synthetic book tops/signals
// - RestSource      : polls an HTTP endpoint returning a Snapshot as JSON
// - run             : fixed-cadence poll loop publishing the newest snapshot
//                     through a single-slot watch channel
//
// The published Arc<Snapshot> is immutable; readers clone the Arc out of the
// watch slot and can never observe a half-written snapshot. A slow fetch only
// delays the next publish, it never blocks readers of the previous one.
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::domain::{Signals, Snapshot, Tick};
use crate::metrics::FEED_ERRORS;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bad snapshot shape: {0}")]
    BadShape(String),
}

pub trait MarketSource: Send + Sync + 'static {
    fn fetch(&self) -> impl std::future::Future<Output = Result<Snapshot, FeedError>> + Send;
}

/// Random-walk source. Prices start around 100.0 and drift a few bps per
/// fetch; book tops and signal fields are synthesized around the mid.
pub struct MockSource {
    prices: Mutex<Vec<(String, f64)>>,
}

impl MockSource {
    pub fn new(symbols: &[String]) -> Self {
        let prices = symbols.iter().map(|s| (s.clone(), 100.0)).collect();
        Self { prices: Mutex::new(prices) }
    }
}

impl MarketSource for MockSource {
    async fn fetch(&self) -> Result<Snapshot, FeedError> {
        let ts = Utc::now().timestamp_millis();
        let mut snap = Snapshot { timestamp_ms: ts, ticks: Default::default() };

        let mut prices = self.prices.lock().unwrap_or_else(|p| p.into_inner());
        let mut rng = rand::thread_rng();
        for (sym, px) in prices.iter_mut() {
            let step = rng.gen_range(-0.0005..=0.0005);
            *px = (*px * (1.0 + step)).max(1.0);
            let spread = *px * 0.0002;
            let bid = *px - spread / 2.0;
            let ask = *px + spread / 2.0;
            let bid_vol = rng.gen_range(0.5..5.0);
            let ask_vol = rng.gen_range(0.5..5.0);
            snap.ticks.insert(
                sym.clone(),
                Tick {
                    symbol: sym.clone(),
                    price: *px,
                    volume: rng.gen_range(100.0..10_000.0),
                    bid,
                    ask,
                    bids: vec![(bid, bid_vol)],
                    asks: vec![(ask, ask_vol)],
                    signals: Signals {
                        obi_weighted: (bid_vol - ask_vol) / (bid_vol + ask_vol),
                        micro_price: (bid * ask_vol + ask * bid_vol) / (bid_vol + ask_vol),
                        sentiment: rng.gen_range(-1.0..1.0),
                        ofi: rng.gen_range(-5.0..5.0),
                        taker_ratio: rng.gen_range(0.8..1.2),
                        parkinson_vol: rng.gen_range(0.0..0.02),
                        attention: rng.gen_range(0.0..2.0),
                    },
                    timestamp_ms: ts,
                },
            );
        }
        Ok(snap)
    }
}

/// Pulls a full Snapshot from an HTTP endpoint (JSON body). Transport and
/// decode failures are transient; the poll loop retries with backoff.
pub struct RestSource {
    client: reqwest::Client,
    url: String,
}

impl RestSource {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, url }
    }
}

impl MarketSource for RestSource {
    async fn fetch(&self) -> Result<Snapshot, FeedError> {
        let snap: Snapshot = self.client.get(&self.url).send().await?.json().await?;
        if snap.ticks.is_empty() {
            return Err(FeedError::BadShape("empty tick map".into()));
        }
        Ok(snap)
    }
}

/// Poll loop: fetch on a fixed cadence, publish the newest snapshot, back off
/// on failure (capped exponential + jitter), never crash.
pub async fn run<S: MarketSource>(
    source: S,
    snap_tx: watch::Sender<Option<Arc<Snapshot>>>,
    interval_ms: u64,
    backoff_max_secs: u64,
    running: Arc<AtomicBool>,
) {
    info!(interval_ms, "feed: started");
    let mut attempt: u32 = 0;

    while running.load(Ordering::Relaxed) {
        match source.fetch().await {
            Ok(snap) => {
                attempt = 0;
                let _ = snap_tx.send(Some(Arc::new(snap)));
                sleep(Duration::from_millis(interval_ms)).await;
            }
            Err(e) => {
                FEED_ERRORS.inc();
                attempt = attempt.saturating_add(1);
                let shift = attempt.min(6);
                let base_ms = 500u64.saturating_mul(1u64 << shift).min(backoff_max_secs * 1000);
                let jitter = rand::thread_rng().gen_range(0..=250);
                warn!(?e, attempt, backoff_ms = base_ms + jitter, "feed: fetch failed, retrying");
                sleep(Duration::from_millis(base_ms + jitter)).await;
            }
        }
    }
    info!("feed: stopped");
}
