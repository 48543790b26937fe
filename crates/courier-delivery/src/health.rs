//! Worker heartbeat registry.
//!
//! Each poll loop registers itself on start and beats after every tick. A
//! worker is alive while its loop runs and its last heartbeat is younger
//! than three poll intervals.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::Clock;
use serde::Serialize;
use tokio::sync::RwLock;

const STALE_AFTER_INTERVALS: u32 = 3;

#[derive(Debug, Clone)]
struct WorkerRecord {
    interval: Duration,
    running: bool,
    last_heartbeat: Option<DateTime<Utc>>,
    last_tick_duration: Option<Duration>,
    consecutive_tick_errors: u32,
}

/// Health snapshot of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    /// Worker name.
    pub worker: String,
    /// Loop running with a fresh heartbeat.
    pub alive: bool,
    /// Last completed tick.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Duration of the last tick in milliseconds.
    pub last_tick_duration_ms: Option<u64>,
    /// Ticks in a row that failed.
    pub consecutive_tick_errors: u32,
    /// Poll interval in seconds.
    pub interval_seconds: u64,
}

/// Shared heartbeat registry.
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    workers: Arc<RwLock<BTreeMap<&'static str, WorkerRecord>>>,
    clock: Arc<dyn Clock>,
}

impl HealthRegistry {
    /// Creates an empty registry.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { workers: Arc::new(RwLock::new(BTreeMap::new())), clock }
    }

    /// Registers a worker loop as running.
    pub async fn started(&self, worker: &'static str, interval: Duration) {
        let mut workers = self.workers.write().await;
        let record = workers.entry(worker).or_insert(WorkerRecord {
            interval,
            running: false,
            last_heartbeat: None,
            last_tick_duration: None,
            consecutive_tick_errors: 0,
        });
        record.interval = interval;
        record.running = true;
        record.last_heartbeat = Some(self.clock.now_utc());
    }

    /// Marks a worker loop as stopped.
    pub async fn stopped(&self, worker: &'static str) {
        if let Some(record) = self.workers.write().await.get_mut(worker) {
            record.running = false;
        }
    }

    /// Records a finished tick.
    pub async fn heartbeat(&self, worker: &'static str, tick_duration: Duration, succeeded: bool) {
        let now = self.clock.now_utc();
        if let Some(record) = self.workers.write().await.get_mut(worker) {
            record.last_heartbeat = Some(now);
            record.last_tick_duration = Some(tick_duration);
            if succeeded {
                record.consecutive_tick_errors = 0;
            } else {
                record.consecutive_tick_errors += 1;
            }
        }
    }

    /// Snapshot of every registered worker, ordered by name.
    pub async fn snapshot(&self) -> Vec<WorkerHealth> {
        let now = self.clock.now_utc();
        self.workers
            .read()
            .await
            .iter()
            .map(|(name, record)| WorkerHealth {
                worker: (*name).to_string(),
                alive: is_alive(record, now),
                last_heartbeat: record.last_heartbeat,
                last_tick_duration_ms: record
                    .last_tick_duration
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                consecutive_tick_errors: record.consecutive_tick_errors,
                interval_seconds: record.interval.as_secs(),
            })
            .collect()
    }

    /// Returns true when at least one worker is registered and all are alive.
    pub async fn all_alive(&self) -> bool {
        let snapshot = self.snapshot().await;
        !snapshot.is_empty() && snapshot.iter().all(|worker| worker.alive)
    }
}

fn is_alive(record: &WorkerRecord, now: DateTime<Utc>) -> bool {
    let Some(last_heartbeat) = record.last_heartbeat else {
        return false;
    };
    let Ok(stale_after) = chrono::Duration::from_std(record.interval * STALE_AFTER_INTERVALS) else {
        return record.running;
    };
    record.running && now - last_heartbeat <= stale_after
}
