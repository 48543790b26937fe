//! Time-scheduled deliveries.
//!
//! A due entry is delivered once and moved out of `pending`. Recurring
//! entries never change their schedule in place: each completion inserts
//! the next occurrence as a fresh entry, in the same statement that closes
//! the current one.
//!
//! An entry refused by its route's rate limiter or open circuit stays
//! `pending` but is postponed out of the due window, so a blocked route
//! cannot fill every batch ahead of healthy ones.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{
    models::{DeliveryOrigin, ScheduledDelivery, ScheduledStatus},
    Clock,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::Result,
    executor::{DeliveryExecutor, DeliveryOutcome, Dispatch},
    poller::{PollingWorker, TickSummary},
    schedule::next_occurrence,
    storage::DeliveryStorage,
};

/// Lease key of the scheduler worker.
pub const SCHEDULER_WORKER: &str = "scheduler";

/// Delivers scheduled entries whose time has come.
pub struct SchedulerWorker {
    storage: Arc<dyn DeliveryStorage>,
    executor: DeliveryExecutor,
    clock: Arc<dyn Clock>,
    batch_size: u32,
}

impl SchedulerWorker {
    /// Creates the worker.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        executor: DeliveryExecutor,
        clock: Arc<dyn Clock>,
        batch_size: u32,
    ) -> Self {
        Self { storage, executor, clock, batch_size }
    }

    async fn process_entry(&self, entry: &ScheduledDelivery) -> Result<()> {
        let route = match self.storage.find_route(entry.route_id).await? {
            Some(route) if route.active => route,
            _ => {
                info!("route missing or inactive, cancelling scheduled delivery");
                self.storage
                    .complete_scheduled(
                        entry.id,
                        ScheduledStatus::Cancelled,
                        Some("route missing or inactive".to_string()),
                        self.clock.now_utc(),
                        None,
                    )
                    .await?;
                return Ok(());
            },
        };

        let dispatch =
            Dispatch::live(route, entry.tenant_id, entry.payload.clone(), DeliveryOrigin::Scheduled);
        let outcome = self.executor.execute_route(dispatch).await?;

        let (status, last_error) = match &outcome {
            DeliveryOutcome::Delivered { .. } => (ScheduledStatus::Completed, None),
            DeliveryOutcome::Failed { error, .. } => (ScheduledStatus::Failed, Some(error.to_string())),
            DeliveryOutcome::RateLimited { reset_at } => {
                let until = (*reset_at).max(self.clock.now_utc());
                debug!(until = %until, "route rate limited, postponing until window reset");
                self.storage.postpone_scheduled(entry.id, until).await?;
                return Ok(());
            },
            DeliveryOutcome::CircuitOpen { .. } => {
                let delay = self.executor.dlq_policy().delay_for(1);
                let until = self.clock.now_utc()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                debug!(until = %until, "route circuit open, postponing");
                self.storage.postpone_scheduled(entry.id, until).await?;
                return Ok(());
            },
        };

        let now = self.clock.now_utc();
        let next = self.next_entry(entry, now);
        let closed = self.storage.complete_scheduled(entry.id, status, last_error, now, next).await?;
        if !closed {
            debug!("entry already left pending");
        }
        Ok(())
    }

    /// Next occurrence after both the entry's slot and now, so a backlog
    /// does not replay every missed slot.
    fn next_entry(
        &self,
        entry: &ScheduledDelivery,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<ScheduledDelivery> {
        let recurrence = entry.recurrence.as_ref()?;
        let after = entry.scheduled_for.max(now);
        match next_occurrence(recurrence, after) {
            Ok(scheduled_for) => Some(entry.next_occurrence(scheduled_for, now)),
            Err(error) => {
                warn!(error = %error, "cannot compute next occurrence, recurrence ends");
                None
            },
        }
    }
}

#[async_trait]
impl PollingWorker for SchedulerWorker {
    fn name(&self) -> &'static str {
        SCHEDULER_WORKER
    }

    async fn tick(&self) -> Result<TickSummary> {
        let due = self.storage.find_due_scheduled(self.clock.now_utc(), self.batch_size).await?;
        let mut summary = TickSummary { fetched: due.len(), ..TickSummary::default() };

        for entry in &due {
            let span = info_span!(
                "scheduled_delivery",
                worker = SCHEDULER_WORKER,
                entry_id = %entry.id,
                route_id = %entry.route_id,
                tenant_id = %entry.tenant_id
            );
            match self.process_entry(entry).instrument(span).await {
                Ok(()) => summary.processed += 1,
                Err(error) => {
                    warn!(entry_id = %entry.id, error = %error, "scheduled delivery failed, will retry");
                    summary.errored += 1;
                },
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::{
        models::{RateLimitPolicy, Schedule, TenantId},
        TestClock,
    };
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{
        fixtures::{executor, push_route},
        storage::mock::MockDeliveryStorage,
    };

    fn worker(storage: &MockDeliveryStorage, clock: &TestClock) -> SchedulerWorker {
        SchedulerWorker::new(
            Arc::new(storage.clone()),
            executor(storage, clock),
            Arc::new(clock.clone()),
            10,
        )
    }

    async fn server(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(matchers::any()).respond_with(ResponseTemplate::new(status)).mount(&server).await;
        server
    }

    #[tokio::test]
    async fn one_shot_entry_completes() {
        let server = server(200).await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let route = push_route(TenantId::new(), &server.uri());
        storage.add_route(route.clone()).await;
        let entry = ScheduledDelivery::pending(
            route.id,
            route.tenant_id,
            clock.now_utc(),
            json!({"reminder": true}),
            None,
            clock.now_utc(),
        );
        storage.add_scheduled(entry.clone()).await;

        worker(&storage, &clock).tick().await.unwrap();

        let entries = storage.scheduled_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ScheduledStatus::Completed);
    }

    #[tokio::test]
    async fn future_entry_is_not_due() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let route = push_route(TenantId::new(), "http://127.0.0.1:1");
        storage.add_route(route.clone()).await;
        storage
            .add_scheduled(ScheduledDelivery::pending(
                route.id,
                route.tenant_id,
                clock.now_utc() + chrono::Duration::minutes(5),
                json!({}),
                None,
                clock.now_utc(),
            ))
            .await;

        let summary = worker(&storage, &clock).tick().await.unwrap();

        assert_eq!(summary.fetched, 0);
    }

    #[tokio::test]
    async fn recurring_entry_inserts_next_occurrence() {
        let server = server(200).await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let route = push_route(TenantId::new(), &server.uri());
        storage.add_route(route.clone()).await;
        let first = ScheduledDelivery::pending(
            route.id,
            route.tenant_id,
            clock.now_utc(),
            json!({"digest": "daily"}),
            Some(Schedule::Interval { seconds: 3600 }),
            clock.now_utc(),
        );
        storage.add_scheduled(first.clone()).await;

        worker(&storage, &clock).tick().await.unwrap();

        let entries = storage.scheduled_entries().await;
        assert_eq!(entries.len(), 2);
        let completed = entries.iter().find(|e| e.id == first.id).unwrap();
        assert_eq!(completed.status, ScheduledStatus::Completed);
        assert_eq!(completed.scheduled_for, first.scheduled_for);
        let next = entries.iter().find(|e| e.id != first.id).unwrap();
        assert_eq!(next.status, ScheduledStatus::Pending);
        assert_eq!(next.scheduled_for, clock.now_utc() + chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn failed_delivery_marks_failed_and_dead_letters() {
        let server = server(400).await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let route = push_route(TenantId::new(), &server.uri());
        storage.add_route(route.clone()).await;
        storage
            .add_scheduled(ScheduledDelivery::pending(
                route.id,
                route.tenant_id,
                clock.now_utc(),
                json!({}),
                None,
                clock.now_utc(),
            ))
            .await;

        worker(&storage, &clock).tick().await.unwrap();

        let entries = storage.scheduled_entries().await;
        assert_eq!(entries[0].status, ScheduledStatus::Failed);
        assert!(entries[0].last_error.as_deref().unwrap().contains("400"));
        assert_eq!(storage.dlq_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_route_cancels_entry() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let route = push_route(TenantId::new(), "http://127.0.0.1:1");
        storage
            .add_scheduled(ScheduledDelivery::pending(
                route.id,
                route.tenant_id,
                clock.now_utc(),
                json!({}),
                None,
                clock.now_utc(),
            ))
            .await;

        worker(&storage, &clock).tick().await.unwrap();

        assert_eq!(storage.scheduled_entries().await[0].status, ScheduledStatus::Cancelled);
    }

    #[tokio::test]
    async fn rate_limited_entry_is_postponed_past_now() {
        let server = server(200).await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let mut route = push_route(TenantId::new(), &server.uri());
        route.rate_limit = Some(RateLimitPolicy { window_seconds: 60, max_requests: 0 });
        storage.add_route(route.clone()).await;
        storage
            .add_scheduled(ScheduledDelivery::pending(
                route.id,
                route.tenant_id,
                clock.now_utc(),
                json!({}),
                None,
                clock.now_utc(),
            ))
            .await;

        worker(&storage, &clock).tick().await.unwrap();

        let entry = &storage.scheduled_entries().await[0];
        assert_eq!(entry.status, ScheduledStatus::Pending);
        assert!(entry.scheduled_for > clock.now_utc());
        assert!(storage.dlq_entries().await.is_empty());
    }

    #[tokio::test]
    async fn open_circuit_does_not_starve_other_routes() {
        let server = server(200).await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let broken = push_route(TenantId::new(), &server.uri());
        let healthy = push_route(TenantId::new(), &server.uri());
        storage.add_route(broken.clone()).await;
        storage.add_route(healthy.clone()).await;
        storage.set_failures(broken.id, 5).await;

        for minutes in 1..=10 {
            storage
                .add_scheduled(ScheduledDelivery::pending(
                    broken.id,
                    broken.tenant_id,
                    clock.now_utc() - chrono::Duration::minutes(minutes),
                    json!({"n": minutes}),
                    None,
                    clock.now_utc(),
                ))
                .await;
        }
        let waiting = ScheduledDelivery::pending(
            healthy.id,
            healthy.tenant_id,
            clock.now_utc(),
            json!({"healthy": true}),
            None,
            clock.now_utc(),
        );
        storage.add_scheduled(waiting.clone()).await;
        let worker = worker(&storage, &clock);

        let first = worker.tick().await.unwrap();
        assert_eq!(first.fetched, 10);
        let second = worker.tick().await.unwrap();
        assert_eq!(second.fetched, 1);

        let entries = storage.scheduled_entries().await;
        let delivered = entries.iter().find(|e| e.id == waiting.id).unwrap();
        assert_eq!(delivered.status, ScheduledStatus::Completed);
        let blocked: Vec<_> = entries.iter().filter(|e| e.route_id == broken.id).collect();
        assert_eq!(blocked.len(), 10);
        assert!(blocked
            .iter()
            .all(|e| e.status == ScheduledStatus::Pending && e.scheduled_for > clock.now_utc()));
        assert!(storage.dlq_entries().await.is_empty());
    }
}
