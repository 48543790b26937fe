//! Event-driven push delivery.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_core::{
    models::{DeliveryOrigin, Direction, Route, SourceEvent},
    Clock,
};
use futures::{stream, StreamExt};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    dedup::{DedupKey, DedupStore},
    error::{DeliveryError, Result},
    executor::{DeliveryExecutor, Dispatch},
    poller::{PollingWorker, TickSummary},
    scope::{route_matches, TenantChain},
    storage::DeliveryStorage,
};

/// Checkpoint and lease key of the delivery worker.
pub const DELIVERY_WORKER: &str = "delivery";

/// Delivery worker settings.
#[derive(Debug, Clone)]
pub struct EventDeliveryConfig {
    /// Events fetched per tick.
    pub batch_size: u32,
    /// Events processed concurrently within a tick.
    pub concurrency: usize,
    /// Events older than this are dropped without delivery.
    pub max_event_age: Duration,
}

impl Default for EventDeliveryConfig {
    fn default() -> Self {
        Self { batch_size: 5, concurrency: 5, max_event_age: Duration::from_secs(24 * 60 * 60) }
    }
}

/// Reads upstream events after the checkpoint and pushes them to every
/// matching route.
pub struct EventDeliveryWorker {
    storage: Arc<dyn DeliveryStorage>,
    executor: DeliveryExecutor,
    dedup: Arc<dyn DedupStore>,
    clock: Arc<dyn Clock>,
    config: EventDeliveryConfig,
}

impl EventDeliveryWorker {
    /// Creates the worker.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        executor: DeliveryExecutor,
        dedup: Arc<dyn DedupStore>,
        clock: Arc<dyn Clock>,
        config: EventDeliveryConfig,
    ) -> Self {
        Self { storage, executor, dedup, clock, config }
    }

    async fn process_event(&self, event: &SourceEvent) -> Result<()> {
        let now = self.clock.now_utc();
        let max_age = chrono::Duration::from_std(self.config.max_event_age)
            .unwrap_or(chrono::Duration::MAX);
        if now - event.created_at > max_age {
            debug!(created_at = %event.created_at, "event older than max age, dropping");
            return Ok(());
        }

        let key = DedupKey::new(event.tenant_id, &event.event_type, &event.payload);
        if !self.dedup.check_and_mark(&key).await {
            debug!(digest = key.payload_digest(), "duplicate event within dedup window, skipping");
            return Ok(());
        }

        let result = self.deliver_to_routes(event).await;
        if result.is_err() {
            self.dedup.forget(&key).await;
        }
        result
    }

    async fn deliver_to_routes(&self, event: &SourceEvent) -> Result<()> {
        let chain =
            TenantChain::new(event.tenant_id, self.storage.tenant_ancestors(event.tenant_id).await?);
        let candidates =
            self.storage.find_candidate_routes(event.event_type.clone(), Direction::Push).await?;
        let routes: Vec<Route> = candidates
            .into_iter()
            .filter(|route| route_matches(route, &chain, &event.event_type, Direction::Push))
            .collect();

        if routes.is_empty() {
            debug!("no matching routes");
            return Ok(());
        }

        let mut first_error = None;
        for route in routes {
            let route_id = route.id;
            if let Err(error) = self.deliver_route(route, event).await {
                warn!(route_id = %route_id, error = %error, "route delivery could not complete");
                first_error.get_or_insert(error);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn deliver_route(&self, route: Route, event: &SourceEvent) -> Result<()> {
        let dispatch =
            Dispatch::live(route, event.tenant_id, event.payload.clone(), DeliveryOrigin::Event)
                .with_event(event.id);
        self.executor.execute_route(dispatch).await.map(|_| ())
    }

    /// Processes one event and reports whether its outcome is resolved.
    async fn process_item(&self, event: &SourceEvent) -> (i64, bool) {
        let span = info_span!(
            "event",
            worker = DELIVERY_WORKER,
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            position = event.position,
            event_type = %event.event_type
        );

        match self.process_event(event).instrument(span).await {
            Ok(()) => (event.position, true),
            Err(error) => {
                log_item_error(event, &error);
                (event.position, false)
            },
        }
    }
}

/// Position the checkpoint may advance to: the last position before the
/// first unresolved item, or `None` if the first item is unresolved.
fn resolved_prefix(results: &[(i64, bool)]) -> Option<i64> {
    results.iter().take_while(|(_, resolved)| *resolved).last().map(|(position, _)| *position)
}

#[async_trait]
impl PollingWorker for EventDeliveryWorker {
    fn name(&self) -> &'static str {
        DELIVERY_WORKER
    }

    async fn tick(&self) -> Result<TickSummary> {
        let expired = self.dedup.sweep().await;
        if expired > 0 {
            debug!(expired, "dropped expired dedup keys");
        }

        let checkpoint = self.storage.load_checkpoint(DELIVERY_WORKER).await?.unwrap_or(0);
        let events = self.storage.fetch_events(checkpoint, self.config.batch_size).await?;
        if events.is_empty() {
            return Ok(TickSummary::default());
        }

        let pending: Vec<_> = events.iter().map(|event| self.process_item(event)).collect();
        let results: Vec<(i64, bool)> =
            stream::iter(pending).buffered(self.config.concurrency.max(1)).collect().await;

        let errored = results.iter().filter(|(_, resolved)| !resolved).count();
        if let Some(position) = resolved_prefix(&results) {
            self.storage.advance_checkpoint(DELIVERY_WORKER, position, self.clock.now_utc()).await?;
        }

        Ok(TickSummary { fetched: results.len(), processed: results.len() - errored, errored })
    }
}

fn log_item_error(event: &SourceEvent, error: &DeliveryError) {
    warn!(
        event_id = %event.id,
        position = event.position,
        error = %error,
        category = %error.category(),
        "event processing failed, will retry"
    );
}

#[cfg(test)]
mod tests {
    use courier_core::{
        models::{DeliveryStep, Target, TenantId, TransformConfig},
        TestClock,
    };
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{
        dedup::{DedupCache, DEFAULT_DEDUP_TTL},
        fixtures::{executor, push_route},
        storage::mock::MockDeliveryStorage,
    };

    fn worker(storage: &MockDeliveryStorage, clock: &TestClock) -> EventDeliveryWorker {
        EventDeliveryWorker::new(
            Arc::new(storage.clone()),
            executor(storage, clock),
            Arc::new(DedupCache::new(DEFAULT_DEDUP_TTL, Arc::new(clock.clone()))),
            Arc::new(clock.clone()),
            EventDeliveryConfig::default(),
        )
    }

    #[tokio::test]
    async fn expired_dedup_keys_are_swept_each_tick() {
        let server = MockServer::start().await;
        Mock::given(matchers::any()).respond_with(ResponseTemplate::new(200)).mount(&server).await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let tenant = TenantId::new();
        storage.add_route(push_route(tenant, &server.uri())).await;
        let cache = DedupCache::new(DEFAULT_DEDUP_TTL, Arc::new(clock.clone()));
        let worker = EventDeliveryWorker::new(
            Arc::new(storage.clone()),
            executor(&storage, &clock),
            Arc::new(cache.clone()),
            Arc::new(clock.clone()),
            EventDeliveryConfig::default(),
        );

        for round in 0..3 {
            for id in 0..5 {
                let payload = json!({"round": round, "id": id});
                storage.push_event(tenant, "order.created", payload, clock.now_utc()).await;
            }
            worker.tick().await.unwrap();
            assert_eq!(cache.len().await, 5);
            clock.advance(Duration::from_secs(600));
        }

        worker.tick().await.unwrap();
        assert!(cache.is_empty().await);
    }

    #[test]
    fn checkpoint_stops_before_first_unresolved() {
        assert_eq!(resolved_prefix(&[(40, true), (41, true), (42, false), (43, true)]), Some(41));
        assert_eq!(resolved_prefix(&[(42, false), (43, true)]), None);
        assert_eq!(resolved_prefix(&[(1, true), (2, true)]), Some(2));
    }

    #[tokio::test]
    async fn delivers_and_advances_checkpoint() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let tenant = TenantId::new();
        storage.add_route(push_route(tenant, &server.uri())).await;
        storage.push_event(tenant, "order.created", json!({"id": 1}), clock.now_utc()).await;
        storage.push_event(tenant, "order.created", json!({"id": 2}), clock.now_utc()).await;
        storage.push_event(tenant, "order.deleted", json!({"id": 3}), clock.now_utc()).await;

        let summary = worker(&storage, &clock).tick().await.unwrap();

        assert_eq!(summary, TickSummary { fetched: 3, processed: 3, errored: 0 });
        assert_eq!(storage.checkpoint(DELIVERY_WORKER).await, Some(3));
    }

    #[tokio::test]
    async fn duplicate_payload_within_window_is_delivered_once() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let tenant = TenantId::new();
        storage.add_route(push_route(tenant, &server.uri())).await;
        storage.push_event(tenant, "order.created", json!({"id": 1}), clock.now_utc()).await;
        storage.push_event(tenant, "order.created", json!({"id": 1}), clock.now_utc()).await;

        let mut worker = worker(&storage, &clock);
        worker.config.concurrency = 1;
        worker.tick().await.unwrap();

        assert_eq!(storage.outcomes().await.len(), 1);
        assert_eq!(storage.checkpoint(DELIVERY_WORKER).await, Some(2));
    }

    #[tokio::test]
    async fn stale_events_are_dropped() {
        let server = MockServer::start().await;
        Mock::given(matchers::any()).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let tenant = TenantId::new();
        storage.add_route(push_route(tenant, &server.uri())).await;
        storage
            .push_event(tenant, "order.created", json!({}), clock.now_utc() - chrono::Duration::days(2))
            .await;

        worker(&storage, &clock).tick().await.unwrap();

        assert_eq!(storage.checkpoint(DELIVERY_WORKER).await, Some(1));
        assert!(storage.outcomes().await.is_empty());
    }

    #[tokio::test]
    async fn child_tenant_reaches_parent_route_with_include_children() {
        let server = MockServer::start().await;
        Mock::given(matchers::any()).respond_with(ResponseTemplate::new(200)).expect(1).mount(&server).await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let (parent, child) = (TenantId::new(), TenantId::new());
        storage.set_tenant_parent(child, parent).await;
        let mut route = push_route(parent, &server.uri());
        route.scope.include_children = true;
        storage.add_route(route).await;
        storage.push_event(child, "order.created", json!({}), clock.now_utc()).await;

        worker(&storage, &clock).tick().await.unwrap();

        assert_eq!(storage.outcomes().await[0].tenant_id, child);
    }

    #[tokio::test]
    async fn multi_step_aborts_after_failed_step() {
        let server = MockServer::start().await;
        Mock::given(matchers::path("/one"))
            .respond_with(ResponseTemplate::new(422))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(matchers::path("/two"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let tenant = TenantId::new();
        let mut route = push_route(tenant, &server.uri());
        route.step_delay_ms = 500;
        route.steps = vec![
            DeliveryStep { name: "one".into(), target: Target::post(format!("{}/one", server.uri())) },
            DeliveryStep { name: "two".into(), target: Target::post(format!("{}/two", server.uri())) },
        ];
        storage.add_route(route).await;
        storage.push_event(tenant, "order.created", json!({}), clock.now_utc()).await;

        worker(&storage, &clock).tick().await.unwrap();

        let outcomes = storage.outcomes().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].step_index, Some(0));
        assert_eq!(storage.dlq_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn multi_step_waits_between_steps() {
        let server = MockServer::start().await;
        Mock::given(matchers::any()).respond_with(ResponseTemplate::new(200)).expect(2).mount(&server).await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let tenant = TenantId::new();
        let mut route = push_route(tenant, &server.uri());
        route.step_delay_ms = 1500;
        route.steps = vec![
            DeliveryStep { name: "a".into(), target: Target::post(server.uri()) },
            DeliveryStep {
                name: "b".into(),
                target: Target {
                    transform: TransformConfig::Wrap { key: "data".into() },
                    ..Target::post(server.uri())
                },
            },
        ];
        storage.add_route(route).await;
        storage.push_event(tenant, "order.created", json!({}), clock.now_utc()).await;
        let start = clock.elapsed();

        worker(&storage, &clock).tick().await.unwrap();

        assert!(clock.elapsed() - start >= Duration::from_millis(1500));
        assert_eq!(storage.outcomes().await.len(), 2);
    }

    #[tokio::test]
    async fn storage_failure_on_event_holds_checkpoint() {
        let server = MockServer::start().await;
        Mock::given(matchers::any()).respond_with(ResponseTemplate::new(200)).mount(&server).await;
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let tenant = TenantId::new();
        storage.add_route(push_route(tenant, &server.uri())).await;
        storage.push_event(tenant, "order.created", json!({"id": 1}), clock.now_utc()).await;
        storage.inject_error("tenant_ancestors", "connection reset").await;
        let worker = worker(&storage, &clock);

        let summary = worker.tick().await.unwrap();
        assert_eq!(summary.errored, 1);
        assert_eq!(storage.checkpoint(DELIVERY_WORKER).await, None);

        // The dedup key was released, so the retry delivers.
        worker.tick().await.unwrap();
        assert_eq!(storage.checkpoint(DELIVERY_WORKER).await, Some(1));
        assert_eq!(storage.outcomes().await.len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_read_failure_aborts_tick() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        storage.inject_error("load_checkpoint", "database down").await;

        assert!(worker(&storage, &clock).tick().await.is_err());
    }
}
