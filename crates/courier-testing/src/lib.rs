//! Deterministic test environment for the delivery engine.
//!
//! [`TestEnv`] wires a [`DeliveryEngine`] to in-memory storage, a virtual
//! clock, a recording event handler and a wiremock endpoint. Workers are
//! driven one tick at a time, so tests read as a sequence of ticks and
//! clock advances instead of sleeps.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use courier_core::{models::SourceEvent, Route};
pub use courier_core::{
    models::{DlqStatus, TenantId},
    Clock, TestClock,
};
use courier_delivery::{
    client::DeliveryClient,
    data_source::{SourceFetcher, DEFAULT_FETCH_TIMEOUT},
    poller::{TickRun, TickSummary},
    storage::mock::MockDeliveryStorage,
    DeliveryEngine, EngineConfig, Operations, WorkerKind,
};
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

pub mod events;
pub mod fixtures;
pub mod scenario;

pub use events::EventLog;
pub use fixtures::{DlqEntryBuilder, EventBuilder, RouteBuilder};
pub use scenario::{FailureKind, ScenarioBuilder};

/// Engine, storage, clock and endpoint for one test.
pub struct TestEnv {
    /// Mock endpoint every route built by [`TestEnv::route`] posts to.
    pub http_mock: MockServer,
    /// Virtual clock shared by the engine.
    pub clock: TestClock,
    /// In-memory storage shared by the engine.
    pub storage: MockDeliveryStorage,
    /// Lifecycle signals emitted by the engine.
    pub events: EventLog,
    engine: DeliveryEngine,
}

impl TestEnv {
    /// Environment with default engine settings and leasing disabled.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be built.
    pub async fn new() -> Result<Self> {
        Self::with_config(EngineConfig { lease: None, ..EngineConfig::default() }).await
    }

    /// Environment with a custom engine configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be built.
    pub async fn with_config(config: EngineConfig) -> Result<Self> {
        let http_mock = MockServer::start().await;
        let clock = TestClock::new();
        let storage = MockDeliveryStorage::new();
        let events = EventLog::new();

        let fetch_client = DeliveryClient::new(config.client.clone())?;
        let data_source =
            SourceFetcher::new(None, fetch_client.http().clone(), DEFAULT_FETCH_TIMEOUT);
        let engine = DeliveryEngine::with_storage(
            Arc::new(storage.clone()),
            Arc::new(data_source),
            Arc::new(clock.clone()),
            config,
        )?
        .with_events(Arc::new(events.clone()));

        Ok(Self { http_mock, clock, storage, events, engine })
    }

    /// The engine under test.
    pub fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    /// Operator surface of the engine.
    pub fn operations(&self) -> Operations {
        self.engine.operations()
    }

    /// Route builder targeting the mock endpoint.
    pub fn route(&self, tenant_id: TenantId) -> RouteBuilder {
        RouteBuilder::new(tenant_id, self.http_mock.uri())
    }

    /// Route builder targeting `path` on the mock endpoint.
    pub fn route_to(&self, tenant_id: TenantId, path: &str) -> RouteBuilder {
        RouteBuilder::new(tenant_id, format!("{}{path}", self.http_mock.uri()))
    }

    /// Stores a route.
    pub async fn add_route(&self, route: &Route) {
        self.storage.add_route(route.clone()).await;
    }

    /// Appends an upstream event.
    pub async fn ingest(&self, event: EventBuilder) -> SourceEvent {
        let created_at = self.clock.now_utc()
            - chrono::Duration::from_std(event.age).unwrap_or(chrono::Duration::zero());
        self.storage.push_event(event.tenant_id, &event.event_type, event.payload, created_at).await
    }

    /// Runs one tick of `kind`.
    ///
    /// # Errors
    ///
    /// Returns error if the tick failed or did not run.
    pub async fn run(&self, kind: WorkerKind) -> Result<TickSummary> {
        match self.engine.run_once(kind).await? {
            TickRun::Completed(summary) => Ok(summary),
            other => bail!("{kind:?} tick did not run: {other:?}"),
        }
    }

    /// Runs one delivery worker tick.
    ///
    /// # Errors
    ///
    /// Returns error if the tick failed.
    pub async fn run_delivery_cycle(&self) -> Result<TickSummary> {
        self.run(WorkerKind::Delivery).await
    }

    /// Advances the virtual clock.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Replaces every endpoint mock with one answering `status` and clears
    /// the request log.
    pub async fn respond_with(&self, status: u16) {
        self.respond_with_template(ResponseTemplate::new(status)).await;
    }

    /// Replaces every endpoint mock with one answering `template`.
    pub async fn respond_with_template(&self, template: ResponseTemplate) {
        self.http_mock.reset().await;
        Mock::given(matchers::any()).respond_with(template).mount(&self.http_mock).await;
    }

    /// Requests received by the mock endpoint.
    pub async fn request_count(&self) -> usize {
        self.http_mock.received_requests().await.map_or(0, |requests| requests.len())
    }

    /// Requests received on `path`.
    pub async fn request_count_for(&self, path: &str) -> usize {
        self.http_mock
            .received_requests()
            .await
            .map_or(0, |requests| requests.iter().filter(|r| r.url.path() == path).count())
    }
}
