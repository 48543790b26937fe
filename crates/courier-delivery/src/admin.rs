//! Operator actions on engine state.
//!
//! Dead-letter management, rate-limit and circuit inspection with manual
//! resets, and worker health. Every action goes through the same storage
//! primitives the workers use.

use std::sync::Arc;

use courier_core::{
    models::{DlqEntry, DlqEntryId, DlqFilter, RateLimitPolicy, RouteId, TenantId},
    Clock,
};
use serde::Serialize;
use tracing::info;

use crate::{
    circuit::{CircuitBreaker, CircuitStatus},
    error::Result,
    health::{HealthRegistry, WorkerHealth},
    rate_limit::{RateLimitDecision, RateLimiter},
    storage::DeliveryStorage,
};

/// Rate-limit state of a route for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Route.
    pub route_id: RouteId,
    /// Tenant.
    pub tenant_id: TenantId,
    /// Configured policy; `None` when the route is unlimited.
    pub policy: Option<RateLimitPolicy>,
    /// Current window, when a policy is configured.
    pub window: Option<RateLimitDecision>,
}

/// Operator surface of the engine.
#[derive(Clone)]
pub struct Operations {
    storage: Arc<dyn DeliveryStorage>,
    rate_limiter: RateLimiter,
    circuit: CircuitBreaker,
    health: HealthRegistry,
    clock: Arc<dyn Clock>,
}

impl Operations {
    /// Creates the operator surface.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        rate_limiter: RateLimiter,
        circuit: CircuitBreaker,
        health: HealthRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, rate_limiter, circuit, health, clock }
    }

    /// Lists dead-letter entries.
    ///
    /// # Errors
    ///
    /// Returns error if storage is unreachable.
    pub async fn list_dlq(&self, filter: DlqFilter) -> Result<Vec<DlqEntry>> {
        Ok(self.storage.list_dlq(filter).await?)
    }

    /// Fetches one dead-letter entry.
    ///
    /// # Errors
    ///
    /// Returns error if storage is unreachable.
    pub async fn get_dlq(&self, id: DlqEntryId) -> Result<Option<DlqEntry>> {
        Ok(self.storage.find_dlq(id).await?)
    }

    /// Queues an entry for immediate retry with a fresh budget, including
    /// abandoned and non-retryable entries. Returns false when the entry is
    /// missing or currently being retried.
    ///
    /// # Errors
    ///
    /// Returns error if storage is unreachable.
    pub async fn retry_dlq(&self, id: DlqEntryId) -> Result<bool> {
        let requeued = self.storage.requeue_dlq(id, self.clock.now_utc()).await?;
        if requeued {
            info!(entry_id = %id, "dead-letter entry requeued by operator");
        }
        Ok(requeued)
    }

    /// Deletes an entry. Returns false when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if storage is unreachable.
    pub async fn delete_dlq(&self, id: DlqEntryId) -> Result<bool> {
        let deleted = self.storage.delete_dlq(id).await?;
        if deleted {
            info!(entry_id = %id, "dead-letter entry deleted by operator");
        }
        Ok(deleted)
    }

    /// Abandons an entry. Returns false when it is missing or already
    /// abandoned.
    ///
    /// # Errors
    ///
    /// Returns error if storage is unreachable.
    pub async fn abandon_dlq(&self, id: DlqEntryId) -> Result<bool> {
        let abandoned = self
            .storage
            .abandon_dlq(id, None, Some("abandoned by operator".into()), self.clock.now_utc())
            .await?;
        if abandoned {
            info!(entry_id = %id, "dead-letter entry abandoned by operator");
        }
        Ok(abandoned)
    }

    /// Current rate-limit window of a route for a tenant, without counting.
    /// `None` when the route does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if storage is unreachable.
    pub async fn rate_limit_status(
        &self,
        route_id: RouteId,
        tenant_id: TenantId,
    ) -> Result<Option<RateLimitStatus>> {
        let Some(route) = self.storage.find_route(route_id).await? else {
            return Ok(None);
        };

        let window = match &route.rate_limit {
            Some(policy) => Some(self.rate_limiter.status(route_id, tenant_id, policy).await?),
            None => None,
        };

        Ok(Some(RateLimitStatus { route_id, tenant_id, policy: route.rate_limit, window }))
    }

    /// Clears rate-limit windows. Returns the number of windows removed.
    ///
    /// # Errors
    ///
    /// Returns error if storage is unreachable.
    pub async fn reset_rate_limit(&self, route_id: RouteId, tenant_id: TenantId) -> Result<u64> {
        let removed = self.rate_limiter.reset(route_id, tenant_id).await?;
        info!(route_id = %route_id, tenant_id = %tenant_id, removed, "rate limit reset by operator");
        Ok(removed)
    }

    /// Circuit state of a route.
    ///
    /// # Errors
    ///
    /// Returns error if storage is unreachable.
    pub async fn circuit_status(&self, route_id: RouteId) -> Result<CircuitStatus> {
        self.circuit.status(route_id).await
    }

    /// Re-enables a route whose circuit is open.
    ///
    /// # Errors
    ///
    /// Returns error if storage is unreachable.
    pub async fn reset_circuit(&self, route_id: RouteId) -> Result<()> {
        self.circuit.reset(route_id).await?;
        info!(route_id = %route_id, "circuit reset by operator");
        Ok(())
    }

    /// Heartbeat state of every worker.
    pub async fn worker_health(&self) -> Vec<WorkerHealth> {
        self.health.snapshot().await
    }

    /// Checks that the persistence layer answers.
    ///
    /// # Errors
    ///
    /// Returns error if storage is unreachable.
    pub async fn storage_health(&self) -> Result<()> {
        Ok(self.storage.health_check().await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::{
        models::{DeliveryOrigin, DlqStatus},
        TestClock,
    };
    use serde_json::json;

    use super::*;
    use crate::{
        circuit::{CircuitConfig, CircuitState},
        fixtures::push_route,
        storage::mock::MockDeliveryStorage,
    };

    fn operations(storage: &MockDeliveryStorage, clock: &TestClock) -> Operations {
        let shared: Arc<MockDeliveryStorage> = Arc::new(storage.clone());
        let clock: Arc<TestClock> = Arc::new(clock.clone());
        Operations::new(
            shared.clone(),
            RateLimiter::new(shared.clone(), clock.clone()),
            CircuitBreaker::new(shared, clock.clone(), CircuitConfig::default()),
            HealthRegistry::new(clock.clone()),
            clock,
        )
    }

    fn abandoned_entry(route_id: RouteId, tenant_id: TenantId) -> DlqEntry {
        let now = Utc::now();
        DlqEntry {
            id: DlqEntryId::new(),
            route_id,
            tenant_id,
            event_id: None,
            step_index: None,
            origin: DeliveryOrigin::Event,
            payload: json!({}),
            pre_transformed: false,
            attempt_count: 5,
            max_retries: 5,
            retryable: false,
            status: DlqStatus::Abandoned,
            last_error: Some("HTTP 400".into()),
            next_retry_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn retry_resets_abandoned_entry() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let entry = abandoned_entry(RouteId::new(), TenantId::new());
        storage.add_dlq_entry(entry.clone()).await;
        let ops = operations(&storage, &clock);

        assert!(ops.retry_dlq(entry.id).await.unwrap());

        let current = storage.dlq_entry(entry.id).await.unwrap();
        assert_eq!(current.status, DlqStatus::PendingRetry);
        assert_eq!(current.attempt_count, 0);
        assert!(current.retryable);
        assert!(!ops.retry_dlq(DlqEntryId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn abandon_and_delete_report_missing_entries() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let entry = abandoned_entry(RouteId::new(), TenantId::new());
        storage.add_dlq_entry(entry.clone()).await;
        let ops = operations(&storage, &clock);

        assert!(!ops.abandon_dlq(entry.id).await.unwrap());
        assert!(ops.delete_dlq(entry.id).await.unwrap());
        assert!(!ops.delete_dlq(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_tenant() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let tenant = TenantId::new();
        storage.add_dlq_entry(abandoned_entry(RouteId::new(), tenant)).await;
        storage.add_dlq_entry(abandoned_entry(RouteId::new(), TenantId::new())).await;

        let listed = operations(&storage, &clock)
            .list_dlq(DlqFilter { tenant_id: Some(tenant), ..DlqFilter::default() })
            .await
            .unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tenant_id, tenant);
    }

    #[tokio::test]
    async fn rate_limit_status_reads_without_counting() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let tenant = TenantId::new();
        let mut route = push_route(tenant, "http://127.0.0.1:1");
        route.rate_limit = Some(RateLimitPolicy { window_seconds: 60, max_requests: 10 });
        storage.add_route(route.clone()).await;
        let ops = operations(&storage, &clock);

        let first = ops.rate_limit_status(route.id, tenant).await.unwrap().unwrap();
        let second = ops.rate_limit_status(route.id, tenant).await.unwrap().unwrap();

        assert_eq!(first.window.unwrap().count, 0);
        assert_eq!(second.window.unwrap().remaining, 10);
        assert!(ops.rate_limit_status(RouteId::new(), tenant).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn circuit_reset_closes_open_circuit() {
        let storage = MockDeliveryStorage::new();
        let clock = TestClock::new();
        let route_id = RouteId::new();
        storage.set_failures(route_id, 7).await;
        let ops = operations(&storage, &clock);

        assert_eq!(ops.circuit_status(route_id).await.unwrap().state, CircuitState::Open);
        ops.reset_circuit(route_id).await.unwrap();

        let status = ops.circuit_status(route_id).await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
    }
}
