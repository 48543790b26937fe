//! Storage abstraction layer for the delivery engine.
//!
//! Workers and the executor only see [`DeliveryStorage`]. Production wraps
//! the PostgreSQL repositories from `courier_core::storage`; tests use the
//! in-memory [`mock::MockDeliveryStorage`], which holds one lock per
//! operation so its counters are as atomic as the SQL upserts they mirror.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result,
    models::{
        Direction, DlqEntry, DlqEntryId, DlqFilter, FailureCounter, JobExecution, JobState,
        OutcomeRecord, Route, RouteId, ScheduledDelivery, ScheduledDeliveryId, ScheduledJob,
        ScheduledStatus, SourceEvent, TenantId,
    },
    storage::Storage,
};

/// Boxed future returned by every storage operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the delivery engine.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Events strictly after `position`, ascending, at most `limit`.
    fn fetch_events(&self, after: i64, limit: u32) -> StorageFuture<'_, Vec<SourceEvent>>;

    /// Current cursor of `worker`.
    fn load_checkpoint(&self, worker: &'static str) -> StorageFuture<'_, Option<i64>>;

    /// Moves the cursor of `worker` forward; never backwards. Returns the
    /// stored position.
    fn advance_checkpoint(
        &self,
        worker: &'static str,
        position: i64,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, i64>;

    /// Active routes with `direction` matching `event_type`, before tenant
    /// scope filtering.
    fn find_candidate_routes(
        &self,
        event_type: String,
        direction: Direction,
    ) -> StorageFuture<'_, Vec<Route>>;

    /// Route by id, active or not.
    fn find_route(&self, route_id: RouteId) -> StorageFuture<'_, Option<Route>>;

    /// The tenant followed by its ancestors, nearest first.
    fn tenant_ancestors(&self, tenant_id: TenantId) -> StorageFuture<'_, Vec<TenantId>>;

    /// Atomically increments a rate-limit window and returns the new count.
    fn increment_rate_window(
        &self,
        route_id: RouteId,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
    ) -> StorageFuture<'_, u32>;

    /// Reads a rate-limit window without incrementing it.
    fn rate_window_count(
        &self,
        route_id: RouteId,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
    ) -> StorageFuture<'_, u32>;

    /// Deletes all windows for the pair.
    fn reset_rate_windows(&self, route_id: RouteId, tenant_id: TenantId)
        -> StorageFuture<'_, u64>;

    /// Consecutive failure counter of a route.
    fn failure_counter(&self, route_id: RouteId) -> StorageFuture<'_, FailureCounter>;

    /// Atomically increments the failure counter and returns the new value.
    fn increment_failures(&self, route_id: RouteId, now: DateTime<Utc>) -> StorageFuture<'_, u32>;

    /// Sets the failure counter to zero.
    fn reset_failures(&self, route_id: RouteId) -> StorageFuture<'_, ()>;

    /// Inserts a dead-letter entry.
    fn create_dlq_entry(&self, entry: DlqEntry) -> StorageFuture<'_, DlqEntryId>;

    /// Claims due `pending_retry` entries, oldest first, marking them
    /// `retrying`.
    fn claim_due_dlq(&self, now: DateTime<Utc>, limit: u32) -> StorageFuture<'_, Vec<DlqEntry>>;

    /// Returns entries stuck in `retrying` since before `cutoff` to
    /// `pending_retry`.
    fn recover_stale_dlq(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64>;

    /// Puts a claimed entry back to `pending_retry`.
    fn reschedule_dlq(
        &self,
        id: DlqEntryId,
        attempt_count: i32,
        next_retry_at: DateTime<Utc>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Marks an entry abandoned. False if missing or already abandoned.
    fn abandon_dlq(
        &self,
        id: DlqEntryId,
        attempt_count: Option<i32>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Resets an entry to `pending_retry`, due now, with a fresh budget.
    fn requeue_dlq(&self, id: DlqEntryId, now: DateTime<Utc>) -> StorageFuture<'_, bool>;

    /// Deletes an entry.
    fn delete_dlq(&self, id: DlqEntryId) -> StorageFuture<'_, bool>;

    /// Finds an entry by id.
    fn find_dlq(&self, id: DlqEntryId) -> StorageFuture<'_, Option<DlqEntry>>;

    /// Lists entries matching `filter`.
    fn list_dlq(&self, filter: DlqFilter) -> StorageFuture<'_, Vec<DlqEntry>>;

    /// Pending scheduled deliveries due at `now`, earliest first.
    fn find_due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StorageFuture<'_, Vec<ScheduledDelivery>>;

    /// Moves a pending entry to a terminal status and inserts `next`
    /// atomically. False if the entry was no longer pending.
    fn complete_scheduled(
        &self,
        id: ScheduledDeliveryId,
        status: ScheduledStatus,
        last_error: Option<String>,
        now: DateTime<Utc>,
        next: Option<ScheduledDelivery>,
    ) -> StorageFuture<'_, bool>;

    /// Moves a pending entry's due time to `until`. False if the entry was
    /// no longer pending.
    fn postpone_scheduled(
        &self,
        id: ScheduledDeliveryId,
        until: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Active scheduled routes with their run state.
    fn find_scheduled_jobs(&self) -> StorageFuture<'_, Vec<ScheduledJob>>;

    /// Persists the run state of a scheduled route.
    fn save_job_state(
        &self,
        route_id: RouteId,
        state: JobState,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Appends a job execution record.
    fn record_job_execution(&self, execution: JobExecution) -> StorageFuture<'_, ()>;

    /// Appends a delivery outcome.
    fn record_outcome(&self, outcome: OutcomeRecord) -> StorageFuture<'_, ()>;

    /// Acquires or renews a worker lease.
    fn try_acquire_lease(
        &self,
        worker: &'static str,
        owner: String,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Releases a worker lease held by `owner`.
    fn release_lease(&self, worker: &'static str, owner: String) -> StorageFuture<'_, ()>;

    /// Verifies the store is reachable.
    fn health_check(&self) -> StorageFuture<'_, ()>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Underlying repositories.
    pub fn inner(&self) -> &Arc<Storage> {
        &self.storage
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn fetch_events(&self, after: i64, limit: u32) -> StorageFuture<'_, Vec<SourceEvent>> {
        Box::pin(self.storage.source_events.fetch_after(after, limit))
    }

    fn load_checkpoint(&self, worker: &'static str) -> StorageFuture<'_, Option<i64>> {
        Box::pin(async move {
            let checkpoint = self.storage.checkpoints.load(worker).await?;
            Ok(checkpoint.map(|checkpoint| checkpoint.position))
        })
    }

    fn advance_checkpoint(
        &self,
        worker: &'static str,
        position: i64,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, i64> {
        Box::pin(self.storage.checkpoints.advance(worker, position, now))
    }

    fn find_candidate_routes(
        &self,
        event_type: String,
        direction: Direction,
    ) -> StorageFuture<'_, Vec<Route>> {
        Box::pin(async move { self.storage.routes.find_candidates(&event_type, direction).await })
    }

    fn find_route(&self, route_id: RouteId) -> StorageFuture<'_, Option<Route>> {
        Box::pin(self.storage.routes.find_by_id(route_id))
    }

    fn tenant_ancestors(&self, tenant_id: TenantId) -> StorageFuture<'_, Vec<TenantId>> {
        Box::pin(self.storage.routes.tenant_ancestors(tenant_id))
    }

    fn increment_rate_window(
        &self,
        route_id: RouteId,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
    ) -> StorageFuture<'_, u32> {
        Box::pin(self.storage.rate_limits.increment(route_id, tenant_id, window_start))
    }

    fn rate_window_count(
        &self,
        route_id: RouteId,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
    ) -> StorageFuture<'_, u32> {
        Box::pin(self.storage.rate_limits.count(route_id, tenant_id, window_start))
    }

    fn reset_rate_windows(
        &self,
        route_id: RouteId,
        tenant_id: TenantId,
    ) -> StorageFuture<'_, u64> {
        Box::pin(self.storage.rate_limits.reset(route_id, tenant_id))
    }

    fn failure_counter(&self, route_id: RouteId) -> StorageFuture<'_, FailureCounter> {
        Box::pin(self.storage.route_failures.find(route_id))
    }

    fn increment_failures(&self, route_id: RouteId, now: DateTime<Utc>) -> StorageFuture<'_, u32> {
        Box::pin(self.storage.route_failures.increment(route_id, now))
    }

    fn reset_failures(&self, route_id: RouteId) -> StorageFuture<'_, ()> {
        Box::pin(self.storage.route_failures.reset(route_id))
    }

    fn create_dlq_entry(&self, entry: DlqEntry) -> StorageFuture<'_, DlqEntryId> {
        Box::pin(async move { self.storage.dlq_entries.create(&entry).await })
    }

    fn claim_due_dlq(&self, now: DateTime<Utc>, limit: u32) -> StorageFuture<'_, Vec<DlqEntry>> {
        Box::pin(self.storage.dlq_entries.claim_due(now, limit))
    }

    fn recover_stale_dlq(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64> {
        Box::pin(self.storage.dlq_entries.recover_stale(cutoff))
    }

    fn reschedule_dlq(
        &self,
        id: DlqEntryId,
        attempt_count: i32,
        next_retry_at: DateTime<Utc>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage
                .dlq_entries
                .reschedule(id, attempt_count, next_retry_at, last_error.as_deref(), now)
                .await
        })
    }

    fn abandon_dlq(
        &self,
        id: DlqEntryId,
        attempt_count: Option<i32>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage.dlq_entries.abandon(id, attempt_count, last_error.as_deref(), now).await
        })
    }

    fn requeue_dlq(&self, id: DlqEntryId, now: DateTime<Utc>) -> StorageFuture<'_, bool> {
        Box::pin(self.storage.dlq_entries.requeue(id, now))
    }

    fn delete_dlq(&self, id: DlqEntryId) -> StorageFuture<'_, bool> {
        Box::pin(self.storage.dlq_entries.delete(id))
    }

    fn find_dlq(&self, id: DlqEntryId) -> StorageFuture<'_, Option<DlqEntry>> {
        Box::pin(self.storage.dlq_entries.find_by_id(id))
    }

    fn list_dlq(&self, filter: DlqFilter) -> StorageFuture<'_, Vec<DlqEntry>> {
        Box::pin(async move { self.storage.dlq_entries.list(&filter).await })
    }

    fn find_due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> StorageFuture<'_, Vec<ScheduledDelivery>> {
        Box::pin(self.storage.scheduled_deliveries.find_due(now, limit))
    }

    fn complete_scheduled(
        &self,
        id: ScheduledDeliveryId,
        status: ScheduledStatus,
        last_error: Option<String>,
        now: DateTime<Utc>,
        next: Option<ScheduledDelivery>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage
                .scheduled_deliveries
                .complete(id, status, last_error.as_deref(), now, next.as_ref())
                .await
        })
    }

    fn postpone_scheduled(
        &self,
        id: ScheduledDeliveryId,
        until: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(self.storage.scheduled_deliveries.postpone(id, until))
    }

    fn find_scheduled_jobs(&self) -> StorageFuture<'_, Vec<ScheduledJob>> {
        Box::pin(self.storage.routes.find_scheduled_jobs())
    }

    fn save_job_state(
        &self,
        route_id: RouteId,
        state: JobState,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.job_runs.save_state(route_id, &state, now).await })
    }

    fn record_job_execution(&self, execution: JobExecution) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.job_runs.record_execution(&execution).await })
    }

    fn record_outcome(&self, outcome: OutcomeRecord) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.outcomes.record(&outcome).await })
    }

    fn try_acquire_lease(
        &self,
        worker: &'static str,
        owner: String,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        Box::pin(async move {
            self.storage.leases.try_acquire(worker, &owner, expires_at, now).await
        })
    }

    fn release_lease(&self, worker: &'static str, owner: String) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.leases.release(worker, &owner).await })
    }

    fn health_check(&self) -> StorageFuture<'_, ()> {
        Box::pin(self.storage.health_check())
    }
}

pub mod mock {
    //! In-memory storage for testing delivery logic without a database.
    //!
    //! All state sits behind a single lock; every trait operation takes it
    //! once, so increments and claims are atomic with respect to each other.
    //! Failures can be injected per operation name.

    use std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    };

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        models::{
            Direction, DlqEntry, DlqEntryId, DlqFilter, DlqStatus, EventId, FailureCounter,
            JobExecution, JobState, OutcomeRecord, Route, RouteId, ScheduledDelivery,
            ScheduledDeliveryId, ScheduledJob, ScheduledStatus, SourceEvent, TenantId,
        },
    };
    use tokio::sync::RwLock;

    use super::{DeliveryStorage, StorageFuture};

    type WindowKey = (RouteId, TenantId, DateTime<Utc>);

    #[derive(Default)]
    struct MockState {
        events: Vec<SourceEvent>,
        next_position: i64,
        checkpoints: HashMap<String, i64>,
        routes: HashMap<RouteId, Route>,
        tenant_parents: HashMap<TenantId, TenantId>,
        rate_windows: HashMap<WindowKey, u32>,
        failures: HashMap<RouteId, FailureCounter>,
        dlq: HashMap<DlqEntryId, DlqEntry>,
        scheduled: HashMap<ScheduledDeliveryId, ScheduledDelivery>,
        job_states: HashMap<RouteId, JobState>,
        executions: Vec<JobExecution>,
        outcomes: Vec<OutcomeRecord>,
        leases: HashMap<String, (String, DateTime<Utc>)>,
        injected: HashMap<&'static str, String>,
        sticky: HashSet<&'static str>,
    }

    impl MockState {
        fn check(&mut self, operation: &'static str) -> Result<()> {
            let message = if self.sticky.contains(operation) {
                self.injected.get(operation).cloned()
            } else {
                self.injected.remove(operation)
            };

            match message {
                Some(message) => Err(CoreError::Database(message)),
                None => Ok(()),
            }
        }
    }

    /// In-memory `DeliveryStorage`.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        state: Arc<RwLock<MockState>>,
    }

    impl MockDeliveryStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Appends an event to the source, assigning the next position.
        pub async fn push_event(
            &self,
            tenant_id: TenantId,
            event_type: &str,
            payload: serde_json::Value,
            created_at: DateTime<Utc>,
        ) -> SourceEvent {
            let mut state = self.state.write().await;
            state.next_position += 1;
            let event = SourceEvent {
                id: EventId::new(),
                position: state.next_position,
                tenant_id,
                event_type: event_type.to_string(),
                payload,
                created_at,
            };
            state.events.push(event.clone());
            event
        }

        /// Inserts an event with an explicit position.
        pub async fn insert_event(&self, event: SourceEvent) {
            let mut state = self.state.write().await;
            state.next_position = state.next_position.max(event.position);
            state.events.push(event);
            state.events.sort_by_key(|event| event.position);
        }

        /// Adds or replaces a route.
        pub async fn add_route(&self, route: Route) {
            self.state.write().await.routes.insert(route.id, route);
        }

        /// Removes a route.
        pub async fn remove_route(&self, route_id: RouteId) {
            self.state.write().await.routes.remove(&route_id);
        }

        /// Records `parent` as the parent of `child` in the tenant hierarchy.
        pub async fn set_tenant_parent(&self, child: TenantId, parent: TenantId) {
            self.state.write().await.tenant_parents.insert(child, parent);
        }

        /// Adds a scheduled delivery.
        pub async fn add_scheduled(&self, entry: ScheduledDelivery) {
            self.state.write().await.scheduled.insert(entry.id, entry);
        }

        /// Adds a dead-letter entry directly.
        pub async fn add_dlq_entry(&self, entry: DlqEntry) {
            self.state.write().await.dlq.insert(entry.id, entry);
        }

        /// Sets the failure counter of a route.
        pub async fn set_failures(&self, route_id: RouteId, consecutive_failures: u32) {
            self.state
                .write()
                .await
                .failures
                .insert(route_id, FailureCounter { consecutive_failures, last_failure_at: None });
        }

        /// Sets the run state of a scheduled route.
        pub async fn set_job_state(&self, route_id: RouteId, state: JobState) {
            self.state.write().await.job_states.insert(route_id, state);
        }

        /// Fails the next call of `operation` with a database error.
        pub async fn inject_error(&self, operation: &'static str, message: impl Into<String>) {
            self.state.write().await.injected.insert(operation, message.into());
        }

        /// Fails every call of `operation` until [`clear_errors`] is called.
        ///
        /// [`clear_errors`]: Self::clear_errors
        pub async fn fail_always(&self, operation: &'static str, message: impl Into<String>) {
            let mut state = self.state.write().await;
            state.injected.insert(operation, message.into());
            state.sticky.insert(operation);
        }

        /// Removes all injected failures.
        pub async fn clear_errors(&self) {
            let mut state = self.state.write().await;
            state.injected.clear();
            state.sticky.clear();
        }

        /// Current checkpoint of `worker`.
        pub async fn checkpoint(&self, worker: &str) -> Option<i64> {
            self.state.read().await.checkpoints.get(worker).copied()
        }

        /// All dead-letter entries, oldest first.
        pub async fn dlq_entries(&self) -> Vec<DlqEntry> {
            let mut entries: Vec<_> = self.state.read().await.dlq.values().cloned().collect();
            entries.sort_by_key(|entry| entry.created_at);
            entries
        }

        /// Dead-letter entry by id.
        pub async fn dlq_entry(&self, id: DlqEntryId) -> Option<DlqEntry> {
            self.state.read().await.dlq.get(&id).cloned()
        }

        /// All scheduled deliveries, by due time.
        pub async fn scheduled_entries(&self) -> Vec<ScheduledDelivery> {
            let mut entries: Vec<_> =
                self.state.read().await.scheduled.values().cloned().collect();
            entries.sort_by_key(|entry| (entry.scheduled_for, entry.created_at));
            entries
        }

        /// Recorded outcomes in insertion order.
        pub async fn outcomes(&self) -> Vec<OutcomeRecord> {
            self.state.read().await.outcomes.clone()
        }

        /// Recorded job executions in insertion order.
        pub async fn job_executions(&self) -> Vec<JobExecution> {
            self.state.read().await.executions.clone()
        }

        /// Run state of a scheduled route.
        pub async fn job_state(&self, route_id: RouteId) -> Option<JobState> {
            self.state.read().await.job_states.get(&route_id).copied()
        }

        /// Consecutive failures of a route.
        pub async fn failures(&self, route_id: RouteId) -> u32 {
            self.state
                .read()
                .await
                .failures
                .get(&route_id)
                .map_or(0, |counter| counter.consecutive_failures)
        }

        /// Current lease holder of `worker`.
        pub async fn lease_owner(&self, worker: &str) -> Option<String> {
            self.state.read().await.leases.get(worker).map(|(owner, _)| owner.clone())
        }

        /// Places a lease held by `owner` until `expires_at`.
        pub async fn set_lease(&self, worker: &str, owner: &str, expires_at: DateTime<Utc>) {
            self.state
                .write()
                .await
                .leases
                .insert(worker.to_string(), (owner.to_string(), expires_at));
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn fetch_events(&self, after: i64, limit: u32) -> StorageFuture<'_, Vec<SourceEvent>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("fetch_events")?;
                Ok(state
                    .events
                    .iter()
                    .filter(|event| event.position > after)
                    .take(limit as usize)
                    .cloned()
                    .collect())
            })
        }

        fn load_checkpoint(&self, worker: &'static str) -> StorageFuture<'_, Option<i64>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("load_checkpoint")?;
                Ok(state.checkpoints.get(worker).copied())
            })
        }

        fn advance_checkpoint(
            &self,
            worker: &'static str,
            position: i64,
            _now: DateTime<Utc>,
        ) -> StorageFuture<'_, i64> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("advance_checkpoint")?;
                let stored = state.checkpoints.entry(worker.to_string()).or_insert(position);
                *stored = (*stored).max(position);
                Ok(*stored)
            })
        }

        fn find_candidate_routes(
            &self,
            event_type: String,
            direction: Direction,
        ) -> StorageFuture<'_, Vec<Route>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("find_candidate_routes")?;
                let mut routes: Vec<_> = state
                    .routes
                    .values()
                    .filter(|route| {
                        route.active
                            && route.direction == direction
                            && route.handles_event_type(&event_type)
                    })
                    .cloned()
                    .collect();
                routes.sort_by_key(|route| route.created_at);
                Ok(routes)
            })
        }

        fn find_route(&self, route_id: RouteId) -> StorageFuture<'_, Option<Route>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("find_route")?;
                Ok(state.routes.get(&route_id).cloned())
            })
        }

        fn tenant_ancestors(&self, tenant_id: TenantId) -> StorageFuture<'_, Vec<TenantId>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("tenant_ancestors")?;
                let mut chain = vec![tenant_id];
                let mut current = tenant_id;
                while let Some(parent) = state.tenant_parents.get(&current).copied() {
                    if chain.contains(&parent) {
                        break;
                    }
                    chain.push(parent);
                    current = parent;
                }
                Ok(chain)
            })
        }

        fn increment_rate_window(
            &self,
            route_id: RouteId,
            tenant_id: TenantId,
            window_start: DateTime<Utc>,
        ) -> StorageFuture<'_, u32> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("increment_rate_window")?;
                let count = state.rate_windows.entry((route_id, tenant_id, window_start)).or_insert(0);
                *count += 1;
                Ok(*count)
            })
        }

        fn rate_window_count(
            &self,
            route_id: RouteId,
            tenant_id: TenantId,
            window_start: DateTime<Utc>,
        ) -> StorageFuture<'_, u32> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("rate_window_count")?;
                Ok(state.rate_windows.get(&(route_id, tenant_id, window_start)).copied().unwrap_or(0))
            })
        }

        fn reset_rate_windows(
            &self,
            route_id: RouteId,
            tenant_id: TenantId,
        ) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("reset_rate_windows")?;
                let before = state.rate_windows.len();
                state.rate_windows.retain(|(route, tenant, _), _| {
                    !(*route == route_id && *tenant == tenant_id)
                });
                Ok((before - state.rate_windows.len()) as u64)
            })
        }

        fn failure_counter(&self, route_id: RouteId) -> StorageFuture<'_, FailureCounter> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("failure_counter")?;
                Ok(state.failures.get(&route_id).copied().unwrap_or_default())
            })
        }

        fn increment_failures(
            &self,
            route_id: RouteId,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, u32> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("increment_failures")?;
                let counter = state.failures.entry(route_id).or_default();
                counter.consecutive_failures += 1;
                counter.last_failure_at = Some(now);
                Ok(counter.consecutive_failures)
            })
        }

        fn reset_failures(&self, route_id: RouteId) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("reset_failures")?;
                if let Some(counter) = state.failures.get_mut(&route_id) {
                    counter.consecutive_failures = 0;
                }
                Ok(())
            })
        }

        fn create_dlq_entry(&self, entry: DlqEntry) -> StorageFuture<'_, DlqEntryId> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("create_dlq_entry")?;
                if state.dlq.contains_key(&entry.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "dlq entry {} already exists",
                        entry.id
                    )));
                }
                let id = entry.id;
                state.dlq.insert(id, entry);
                Ok(id)
            })
        }

        fn claim_due_dlq(
            &self,
            now: DateTime<Utc>,
            limit: u32,
        ) -> StorageFuture<'_, Vec<DlqEntry>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("claim_due_dlq")?;
                let mut due: Vec<_> = state
                    .dlq
                    .values()
                    .filter(|entry| {
                        entry.status == DlqStatus::PendingRetry && entry.next_retry_at <= now
                    })
                    .map(|entry| (entry.created_at, entry.id))
                    .collect();
                due.sort();
                due.truncate(limit as usize);

                let mut claimed = Vec::with_capacity(due.len());
                for (_, id) in due {
                    if let Some(entry) = state.dlq.get_mut(&id) {
                        entry.status = DlqStatus::Retrying;
                        entry.updated_at = now;
                        claimed.push(entry.clone());
                    }
                }
                Ok(claimed)
            })
        }

        fn recover_stale_dlq(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("recover_stale_dlq")?;
                let mut recovered = 0;
                for entry in state.dlq.values_mut() {
                    if entry.status == DlqStatus::Retrying && entry.updated_at < cutoff {
                        entry.status = DlqStatus::PendingRetry;
                        entry.next_retry_at = entry.updated_at;
                        recovered += 1;
                    }
                }
                Ok(recovered)
            })
        }

        fn reschedule_dlq(
            &self,
            id: DlqEntryId,
            attempt_count: i32,
            next_retry_at: DateTime<Utc>,
            last_error: Option<String>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("reschedule_dlq")?;
                if let Some(entry) = state.dlq.get_mut(&id) {
                    entry.status = DlqStatus::PendingRetry;
                    entry.attempt_count = attempt_count;
                    entry.next_retry_at = next_retry_at;
                    if last_error.is_some() {
                        entry.last_error = last_error;
                    }
                    entry.updated_at = now;
                }
                Ok(())
            })
        }

        fn abandon_dlq(
            &self,
            id: DlqEntryId,
            attempt_count: Option<i32>,
            last_error: Option<String>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("abandon_dlq")?;
                match state.dlq.get_mut(&id) {
                    Some(entry) if entry.status != DlqStatus::Abandoned => {
                        entry.status = DlqStatus::Abandoned;
                        if let Some(attempt_count) = attempt_count {
                            entry.attempt_count = attempt_count;
                        }
                        if last_error.is_some() {
                            entry.last_error = last_error;
                        }
                        entry.updated_at = now;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn requeue_dlq(&self, id: DlqEntryId, now: DateTime<Utc>) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("requeue_dlq")?;
                match state.dlq.get_mut(&id) {
                    Some(entry) if entry.status != DlqStatus::Retrying => {
                        entry.status = DlqStatus::PendingRetry;
                        entry.attempt_count = 0;
                        entry.retryable = true;
                        entry.next_retry_at = now;
                        entry.updated_at = now;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn delete_dlq(&self, id: DlqEntryId) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("delete_dlq")?;
                Ok(state.dlq.remove(&id).is_some())
            })
        }

        fn find_dlq(&self, id: DlqEntryId) -> StorageFuture<'_, Option<DlqEntry>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("find_dlq")?;
                Ok(state.dlq.get(&id).cloned())
            })
        }

        fn list_dlq(&self, filter: DlqFilter) -> StorageFuture<'_, Vec<DlqEntry>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("list_dlq")?;
                let mut entries: Vec<_> =
                    state.dlq.values().filter(|entry| filter.matches(entry)).cloned().collect();
                entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                entries.truncate(filter.limit() as usize);
                Ok(entries)
            })
        }

        fn find_due_scheduled(
            &self,
            now: DateTime<Utc>,
            limit: u32,
        ) -> StorageFuture<'_, Vec<ScheduledDelivery>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("find_due_scheduled")?;
                let mut due: Vec<_> = state
                    .scheduled
                    .values()
                    .filter(|entry| {
                        entry.status == ScheduledStatus::Pending && entry.scheduled_for <= now
                    })
                    .cloned()
                    .collect();
                due.sort_by_key(|entry| entry.scheduled_for);
                due.truncate(limit as usize);
                Ok(due)
            })
        }

        fn complete_scheduled(
            &self,
            id: ScheduledDeliveryId,
            status: ScheduledStatus,
            last_error: Option<String>,
            now: DateTime<Utc>,
            next: Option<ScheduledDelivery>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("complete_scheduled")?;
                match state.scheduled.get_mut(&id) {
                    Some(entry) if entry.status == ScheduledStatus::Pending => {
                        entry.status = status;
                        entry.last_error = last_error;
                        entry.completed_at = Some(now);
                    },
                    _ => return Ok(false),
                }
                if let Some(next) = next {
                    state.scheduled.insert(next.id, next);
                }
                Ok(true)
            })
        }

        fn postpone_scheduled(
            &self,
            id: ScheduledDeliveryId,
            until: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("postpone_scheduled")?;
                match state.scheduled.get_mut(&id) {
                    Some(entry) if entry.status == ScheduledStatus::Pending => {
                        entry.scheduled_for = until;
                        Ok(true)
                    },
                    _ => Ok(false),
                }
            })
        }

        fn find_scheduled_jobs(&self) -> StorageFuture<'_, Vec<ScheduledJob>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("find_scheduled_jobs")?;
                let mut jobs: Vec<_> = state
                    .routes
                    .values()
                    .filter(|route| route.active && route.direction == Direction::Scheduled)
                    .map(|route| ScheduledJob {
                        route: route.clone(),
                        state: state.job_states.get(&route.id).copied().unwrap_or_default(),
                    })
                    .collect();
                jobs.sort_by_key(|job| job.route.created_at);
                Ok(jobs)
            })
        }

        fn save_job_state(
            &self,
            route_id: RouteId,
            job_state: JobState,
            _now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("save_job_state")?;
                state.job_states.insert(route_id, job_state);
                Ok(())
            })
        }

        fn record_job_execution(&self, execution: JobExecution) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("record_job_execution")?;
                state.executions.push(execution);
                Ok(())
            })
        }

        fn record_outcome(&self, outcome: OutcomeRecord) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("record_outcome")?;
                state.outcomes.push(outcome);
                Ok(())
            })
        }

        fn try_acquire_lease(
            &self,
            worker: &'static str,
            owner: String,
            expires_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("try_acquire_lease")?;
                let available = match state.leases.get(worker) {
                    Some((holder, held_until)) => *holder == owner || *held_until <= now,
                    None => true,
                };
                if available {
                    state.leases.insert(worker.to_string(), (owner, expires_at));
                }
                Ok(available)
            })
        }

        fn release_lease(&self, worker: &'static str, owner: String) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.check("release_lease")?;
                if state.leases.get(worker).is_some_and(|(holder, _)| *holder == owner) {
                    state.leases.remove(worker);
                }
                Ok(())
            })
        }

        fn health_check(&self) -> StorageFuture<'_, ()> {
            Box::pin(async move { self.state.write().await.check("health_check") })
        }
    }

    #[cfg(test)]
    mod tests {
        use chrono::TimeZone;

        use super::*;

        #[tokio::test]
        async fn checkpoint_never_moves_backwards() {
            let storage = MockDeliveryStorage::new();
            let now = Utc::now();

            assert_eq!(storage.advance_checkpoint("delivery", 10, now).await.unwrap(), 10);
            assert_eq!(storage.advance_checkpoint("delivery", 7, now).await.unwrap(), 10);
            assert_eq!(storage.load_checkpoint("delivery").await.unwrap(), Some(10));
        }

        #[tokio::test]
        async fn injected_error_fails_once() {
            let storage = MockDeliveryStorage::new();
            storage.inject_error("fetch_events", "connection reset").await;

            assert!(storage.fetch_events(0, 10).await.is_err());
            assert!(storage.fetch_events(0, 10).await.is_ok());
        }

        #[tokio::test]
        async fn sticky_error_persists_until_cleared() {
            let storage = MockDeliveryStorage::new();
            storage.fail_always("health_check", "down").await;

            assert!(storage.health_check().await.is_err());
            assert!(storage.health_check().await.is_err());

            storage.clear_errors().await;
            assert!(storage.health_check().await.is_ok());
        }

        #[tokio::test]
        async fn lease_is_exclusive_until_expiry() {
            let storage = MockDeliveryStorage::new();
            let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let later = now + chrono::Duration::seconds(30);

            assert!(storage.try_acquire_lease("dlq", "a".into(), later, now).await.unwrap());
            assert!(!storage.try_acquire_lease("dlq", "b".into(), later, now).await.unwrap());
            assert!(storage.try_acquire_lease("dlq", "a".into(), later, now).await.unwrap());
            assert!(storage.try_acquire_lease("dlq", "b".into(), later, later).await.unwrap());
            assert_eq!(storage.lease_owner("dlq").await.as_deref(), Some("b"));
        }

        #[tokio::test]
        async fn tenant_chain_walks_to_root() {
            let storage = MockDeliveryStorage::new();
            let (root, mid, leaf) = (TenantId::new(), TenantId::new(), TenantId::new());
            storage.set_tenant_parent(leaf, mid).await;
            storage.set_tenant_parent(mid, root).await;

            assert_eq!(storage.tenant_ancestors(leaf).await.unwrap(), vec![leaf, mid, root]);
            assert_eq!(storage.tenant_ancestors(root).await.unwrap(), vec![root]);
        }
    }
}
