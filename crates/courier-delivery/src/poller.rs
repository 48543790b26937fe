//! Checkpointed poll loop shared by every worker.
//!
//! A loop wakes on its own timer, optionally takes the worker-role lease,
//! runs one tick and reports a heartbeat. Ticks of the same loop never
//! overlap: a tick requested while another is in flight is skipped.
//! Cancellation is cooperative; a running tick always completes.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_core::Clock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{error::Result, health::HealthRegistry, storage::DeliveryStorage};

/// Items handled by one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Items fetched.
    pub fetched: usize,
    /// Items whose outcome was recorded.
    pub processed: usize,
    /// Items that hit a processing error and will be retried.
    pub errored: usize,
}

/// One worker role.
#[async_trait]
pub trait PollingWorker: Send + Sync {
    /// Stable worker name, also the checkpoint and lease key.
    fn name(&self) -> &'static str;

    /// Processes one batch.
    ///
    /// Per-item failures are counted in the summary. An `Err` means the
    /// tick could not run at all, for example because storage is down.
    async fn tick(&self) -> Result<TickSummary>;
}

/// Lease settings for a loop.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Unique id of this process.
    pub owner: String,
    /// How long a lease stays valid without renewal.
    pub ttl: Duration,
}

/// Why a tick did not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickRun {
    /// The tick ran.
    Completed(TickSummary),
    /// A previous tick of this loop is still running.
    Busy,
    /// Another instance holds the worker lease.
    LeaseHeld,
}

/// Drives a [`PollingWorker`] on a fixed interval.
#[derive(Clone)]
pub struct PollLoop {
    worker: Arc<dyn PollingWorker>,
    interval: Duration,
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    health: HealthRegistry,
    lease: Option<LeaseSettings>,
    in_flight: Arc<AtomicBool>,
}

struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PollLoop {
    /// Creates a loop for `worker`.
    pub fn new(
        worker: Arc<dyn PollingWorker>,
        interval: Duration,
        storage: Arc<dyn DeliveryStorage>,
        clock: Arc<dyn Clock>,
        health: HealthRegistry,
        lease: Option<LeaseSettings>,
    ) -> Self {
        Self {
            worker,
            interval,
            storage,
            clock,
            health,
            lease,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Worker name.
    pub fn name(&self) -> &'static str {
        self.worker.name()
    }

    /// Runs a single tick, honoring the single-flight guard and the lease.
    ///
    /// # Errors
    ///
    /// Returns error if the lease cannot be checked or the tick fails.
    pub async fn tick_once(&self) -> Result<TickRun> {
        if self.in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err()
        {
            debug!(worker = self.name(), "previous tick still running, skipping");
            return Ok(TickRun::Busy);
        }
        let _guard = InFlight(self.in_flight.clone());

        if let Some(lease) = &self.lease {
            let now = self.clock.now_utc();
            let expires_at = now
                + chrono::Duration::from_std(lease.ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
            let acquired = self
                .storage
                .try_acquire_lease(self.name(), lease.owner.clone(), expires_at, now)
                .await?;
            if !acquired {
                debug!(worker = self.name(), "lease held by another instance, skipping tick");
                return Ok(TickRun::LeaseHeld);
            }
        }

        let started = self.clock.now();
        let result = self.worker.tick().await;
        let elapsed = self.clock.now().duration_since(started);
        self.health.heartbeat(self.name(), elapsed, result.is_ok()).await;

        let summary = result?;
        if summary.fetched > 0 {
            debug!(
                worker = self.name(),
                fetched = summary.fetched,
                processed = summary.processed,
                errored = summary.errored,
                duration_ms = elapsed.as_millis(),
                "tick completed"
            );
        }
        Ok(TickRun::Completed(summary))
    }

    /// Runs until `cancellation` fires, then releases the lease.
    pub async fn run(self, cancellation: CancellationToken) {
        info!(worker = self.name(), interval_ms = self.interval.as_millis(), "worker starting");
        self.health.started(self.name(), self.interval).await;

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {},
                () = cancellation.cancelled() => break,
            }

            if let Err(error) = self.tick_once().await {
                error!(worker = self.name(), error = %error, "worker tick failed");
            }
        }

        if let Some(lease) = &self.lease {
            if let Err(error) = self.storage.release_lease(self.name(), lease.owner.clone()).await {
                warn!(worker = self.name(), error = %error, "failed to release worker lease");
            }
        }
        self.health.stopped(self.name()).await;
        info!(worker = self.name(), "worker stopped");
    }
}
