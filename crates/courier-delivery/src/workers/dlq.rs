//! Dead-letter auto-retry.
//!
//! Each tick first returns entries orphaned in `retrying` by a crashed
//! tick, then claims due entries and replays them through the executor.
//! Backoff compounds across cycles: the `n`-th failed cycle waits
//! `min(60s * 2^(n-1), 1h)` with jitter.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    events::DeliveryEvent,
    models::{DlqEntry, Route},
    Clock,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::Result,
    executor::{DeliveryExecutor, DeliveryOutcome, Dispatch},
    poller::{PollingWorker, TickSummary},
    storage::DeliveryStorage,
};

/// Lease key of the DLQ worker.
pub const DLQ_WORKER: &str = "dlq";

/// DLQ worker tuning.
#[derive(Debug, Clone)]
pub struct DlqWorkerConfig {
    /// Entries claimed per tick.
    pub batch_size: u32,
    /// Age after which a `retrying` entry is considered orphaned.
    pub stale_after: Duration,
}

impl Default for DlqWorkerConfig {
    fn default() -> Self {
        Self { batch_size: 50, stale_after: Duration::from_secs(600) }
    }
}

/// Replays due dead-letter entries.
pub struct DlqWorker {
    storage: Arc<dyn DeliveryStorage>,
    executor: DeliveryExecutor,
    clock: Arc<dyn Clock>,
    config: DlqWorkerConfig,
}

impl DlqWorker {
    /// Creates the worker.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        executor: DeliveryExecutor,
        clock: Arc<dyn Clock>,
        config: DlqWorkerConfig,
    ) -> Self {
        Self { storage, executor, clock, config }
    }

    fn after(&self, delay: Duration) -> DateTime<Utc> {
        let now = self.clock.now_utc();
        now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
    }

    async fn abandon(&self, entry: &DlqEntry, attempts: i32, last_error: Option<String>) -> Result<()> {
        let now = self.clock.now_utc();
        if self.storage.abandon_dlq(entry.id, Some(attempts), last_error.clone(), now).await? {
            warn!(
                entry_id = %entry.id,
                attempts,
                last_error = last_error.as_deref().unwrap_or(""),
                "dead-letter entry abandoned"
            );
            self.executor
                .events()
                .handle_event(DeliveryEvent::Abandoned {
                    entry_id: entry.id,
                    route_id: entry.route_id,
                    tenant_id: entry.tenant_id,
                    attempts,
                    last_error,
                    abandoned_at: now,
                })
                .await;
        }
        Ok(())
    }

    async fn replay(&self, entry: &DlqEntry, route: Route) -> Result<()> {
        let now = self.clock.now_utc();

        match self.executor.execute(Dispatch::replay(route, entry)).await? {
            DeliveryOutcome::Delivered { attempts, .. } => {
                info!(entry_id = %entry.id, attempts, "dead-letter entry delivered");
                self.storage.delete_dlq(entry.id).await?;
            },
            DeliveryOutcome::RateLimited { reset_at } => {
                debug!(entry_id = %entry.id, "route rate limited, retrying after window reset");
                self.storage
                    .reschedule_dlq(entry.id, entry.attempt_count, reset_at.max(now), None, now)
                    .await?;
            },
            DeliveryOutcome::CircuitOpen { .. } => {
                debug!(entry_id = %entry.id, "route circuit open, postponing");
                let next = self.after(self.executor.dlq_policy().delay_for(1));
                self.storage.reschedule_dlq(entry.id, entry.attempt_count, next, None, now).await?;
            },
            DeliveryOutcome::Failed { error, retryable, .. } => {
                let attempts = entry.attempt_count.saturating_add(1);
                let last_error = Some(error.to_string());

                if retryable && entry.has_retries_left(attempts) {
                    let budget = u32::try_from(entry.max_retries).unwrap_or(0);
                    let delay = self
                        .executor
                        .dlq_policy()
                        .with_max_attempts(budget)
                        .delay_for(u32::try_from(attempts).unwrap_or(u32::MAX));
                    let next = self.after(delay);
                    debug!(entry_id = %entry.id, attempts, next_retry_at = %next, "dead-letter retry failed");
                    self.storage.reschedule_dlq(entry.id, attempts, next, last_error, now).await?;
                } else {
                    self.abandon(entry, attempts, last_error).await?;
                }
            },
        }

        Ok(())
    }

    async fn process_entry(&self, entry: &DlqEntry) -> Result<()> {
        match self.storage.find_route(entry.route_id).await? {
            Some(route) if route.active => self.replay(entry, route).await,
            Some(_) => self.abandon(entry, entry.attempt_count, Some("route is inactive".into())).await,
            None => self.abandon(entry, entry.attempt_count, Some("route no longer exists".into())).await,
        }
    }
}

#[async_trait]
impl PollingWorker for DlqWorker {
    fn name(&self) -> &'static str {
        DLQ_WORKER
    }

    async fn tick(&self) -> Result<TickSummary> {
        let now = self.clock.now_utc();
        let stale = chrono::Duration::from_std(self.config.stale_after).unwrap_or(chrono::Duration::zero());
        let recovered = self.storage.recover_stale_dlq(now - stale).await?;
        if recovered > 0 {
            warn!(recovered, "recovered orphaned dead-letter entries");
        }

        let entries = self.storage.claim_due_dlq(now, self.config.batch_size).await?;
        let mut summary = TickSummary { fetched: entries.len(), ..TickSummary::default() };

        for entry in &entries {
            let span = info_span!(
                "dlq_entry",
                worker = DLQ_WORKER,
                entry_id = %entry.id,
                route_id = %entry.route_id,
                tenant_id = %entry.tenant_id,
                attempt = entry.attempt_count
            );
            match self.process_entry(entry).instrument(span).await {
                Ok(()) => summary.processed += 1,
                Err(error) => {
                    // Left in `retrying`; stale recovery hands it back.
                    warn!(entry_id = %entry.id, error = %error, "dead-letter replay errored");
                    summary.errored += 1;
                },
            }
        }

        Ok(summary)
    }
}
