// ===============================
// src/persist.rs (async persistence gateway)
// ===============================
//
// The tick loop never touches storage directly: it enqueues jobs on a
// bounded channel and moves on. A single worker task owns the Store and
// drains the queue, flushing on a fixed interval and once more on
// shutdown. Queue overflow drops the job (accounts are upserted every
// tick anyway, so a dropped write is superseded by the next one).
//
// JsonlStore appends one JSON document per line, one file per collection,
// under a recording directory. A failed write drops the handle and the
// next write reopens the file.
//

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::{Account, ChartPoint};
use crate::metrics::{PERSIST_DROPPED, PERSIST_ERRORS};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

pub trait Store: Send + 'static {
    fn upsert_account(&mut self, account: &Account) -> io::Result<()>;
    fn insert_chart_point(&mut self, point: &ChartPoint) -> io::Result<()>;
    /// Wipe every collection (simulation reset).
    fn delete_all(&mut self) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    /// Restart restore: newest record per account name. Best effort — a
    /// missing collection is an empty result, a bad record is skipped.
    fn load_accounts(&mut self) -> io::Result<Vec<Account>>;
    fn load_chart(&mut self) -> io::Result<Vec<ChartPoint>>;
}

// -------- JSONL store --------

pub struct JsonlStore {
    dir: PathBuf,
    accounts: Option<BufWriter<File>>,
    chart: Option<BufWriter<File>>,
}

impl JsonlStore {
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, accounts: None, chart: None })
    }

    fn writer(dir: &Path, name: &str) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(name))?;
        Ok(BufWriter::new(file))
    }

    fn append<T: serde::Serialize>(
        dir: &Path,
        slot: &mut Option<BufWriter<File>>,
        name: &str,
        value: &T,
    ) -> io::Result<()> {
        if slot.is_none() {
            *slot = Some(Self::writer(dir, name)?);
        }
        let w = slot.as_mut().unwrap();
        let line = serde_json::to_string(value).map_err(io::Error::other)?;
        if let Err(e) = writeln!(w, "{line}") {
            // reopen on the next write
            *slot = None;
            return Err(e);
        }
        Ok(())
    }
}

impl Store for JsonlStore {
    fn upsert_account(&mut self, account: &Account) -> io::Result<()> {
        Self::append(&self.dir, &mut self.accounts, "accounts.jsonl", account)
    }

    fn insert_chart_point(&mut self, point: &ChartPoint) -> io::Result<()> {
        Self::append(&self.dir, &mut self.chart, "chart.jsonl", point)
    }

    fn delete_all(&mut self) -> io::Result<()> {
        self.accounts = None;
        self.chart = None;
        File::create(self.dir.join("accounts.jsonl"))?;
        File::create(self.dir.join("chart.jsonl"))?;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(w) = self.accounts.as_mut() {
            w.flush()?;
        }
        if let Some(w) = self.chart.as_mut() {
            w.flush()?;
        }
        Ok(())
    }

    fn load_accounts(&mut self) -> io::Result<Vec<Account>> {
        let path = self.dir.join("accounts.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        // Upserts are appended, so the last line per name wins.
        let mut latest: std::collections::HashMap<String, Account> = Default::default();
        for line in std::fs::read_to_string(&path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Account>(line) {
                Ok(a) => {
                    latest.insert(a.name.clone(), a);
                }
                Err(e) => warn!(?e, "persist: skipping unreadable account record"),
            }
        }
        Ok(latest.into_values().collect())
    }

    fn load_chart(&mut self) -> io::Result<Vec<ChartPoint>> {
        let path = self.dir.join("chart.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut points = Vec::new();
        for line in std::fs::read_to_string(&path)?.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChartPoint>(line) {
                Ok(p) => points.push(p),
                Err(e) => warn!(?e, "persist: skipping unreadable chart record"),
            }
        }
        Ok(points)
    }
}

// -------- gateway --------

enum Job {
    UpsertAccount(Box<Account>),
    InsertChartPoint(ChartPoint),
    DeleteAll,
}

#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<Job>,
}

impl PersistHandle {
    /// Best-effort enqueue. Drops (and counts) on a full queue.
    pub fn upsert_account(&self, account: &Account) {
        if self.tx.try_send(Job::UpsertAccount(Box::new(account.clone()))).is_err() {
            PERSIST_DROPPED.inc();
        }
    }

    pub fn insert_chart_point(&self, point: ChartPoint) {
        if self.tx.try_send(Job::InsertChartPoint(point)).is_err() {
            PERSIST_DROPPED.inc();
        }
    }

    /// Reset path waits for queue space; the wipe must not be dropped.
    pub async fn delete_all(&self) {
        if self.tx.send(Job::DeleteAll).await.is_err() {
            warn!("persist: worker gone, delete_all ignored");
        }
    }
}

/// Spawn the worker that owns the store. The worker exits (after a final
/// flush) once every handle clone has been dropped.
pub fn spawn<S: Store>(mut store: S, queue_cap: usize) -> (PersistHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Job>(queue_cap);

    let worker = tokio::spawn(async move {
        info!("persist: worker started");
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    let res = match job {
                        Job::UpsertAccount(a) => store.upsert_account(&a),
                        Job::InsertChartPoint(p) => store.insert_chart_point(&p),
                        Job::DeleteAll => store.delete_all(),
                    };
                    if let Err(e) = res {
                        PERSIST_ERRORS.inc();
                        warn!(?e, "persist: write failed");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = store.flush() {
                        PERSIST_ERRORS.inc();
                        warn!(?e, "persist: flush failed");
                    }
                }
            }
        }
        let _ = store.flush();
        info!("persist: worker stopped");
    });

    (PersistHandle { tx }, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChartPoint;

    fn point(ts: i64) -> ChartPoint {
        ChartPoint { timestamp_ms: ts, price: 100.0, agents: Default::default() }
    }

    #[tokio::test]
    async fn worker_writes_jsonl_and_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        let (handle, worker) = spawn(store, 64);

        let acct = Account::new("a", 100.0, &["BTC".to_string()]);
        handle.upsert_account(&acct);
        handle.insert_chart_point(point(1));
        handle.insert_chart_point(point(2));
        drop(handle);
        worker.await.unwrap();

        let accounts = std::fs::read_to_string(dir.path().join("accounts.jsonl")).unwrap();
        assert_eq!(accounts.lines().count(), 1);
        let parsed: Account = serde_json::from_str(accounts.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.name, "a");

        let chart = std::fs::read_to_string(dir.path().join("chart.jsonl")).unwrap();
        assert_eq!(chart.lines().count(), 2);
    }

    #[tokio::test]
    async fn delete_all_truncates_collections() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        let (handle, worker) = spawn(store, 64);

        handle.insert_chart_point(point(1));
        handle.delete_all().await;
        drop(handle);
        worker.await.unwrap();

        let chart = std::fs::read_to_string(dir.path().join("chart.jsonl")).unwrap();
        assert!(chart.is_empty());
    }

    #[tokio::test]
    async fn load_returns_latest_record_per_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        let (handle, worker) = spawn(store, 64);

        let mut acct = Account::new("a", 100.0, &["BTC".to_string()]);
        handle.upsert_account(&acct);
        acct.cash = 42.0;
        handle.upsert_account(&acct);
        handle.upsert_account(&Account::new("b", 100.0, &["BTC".to_string()]));
        handle.insert_chart_point(point(1));
        handle.insert_chart_point(point(2));
        drop(handle);
        worker.await.unwrap();

        let mut reopened = JsonlStore::open(dir.path()).unwrap();
        let mut accounts = reopened.load_accounts().unwrap();
        accounts.sort_by(|x, y| x.name.cmp(&y.name));
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[0].name, "a");
        assert_eq!(accounts[0].cash, 42.0);
        assert_eq!(accounts[1].cash, 100.0);

        let chart = reopened.load_chart().unwrap();
        assert_eq!(chart.len(), 2);
        assert_eq!(chart[1].timestamp_ms, 2);
    }

    #[tokio::test]
    async fn load_on_empty_dir_is_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlStore::open(dir.path()).unwrap();
        assert!(store.load_accounts().unwrap().is_empty());
        assert!(store.load_chart().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        // Capacity 1 and a worker that hasn't run yet: most sends must drop,
        // and none may block the caller.
        let (handle, worker) = spawn(store, 1);
        for i in 0..100 {
            handle.insert_chart_point(point(i));
        }
        drop(handle);
        worker.await.unwrap();

        let chart = std::fs::read_to_string(dir.path().join("chart.jsonl")).unwrap();
        assert!(chart.lines().count() < 100);
    }
}
