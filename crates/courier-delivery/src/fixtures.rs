//! Shared builders for unit tests inside this crate.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use courier_core::{
    events::{DeliveryEvent, EventHandler},
    models::{
        AuthConfig, Direction, RetrySettings, Route, RouteId, Target, TenantId, TenantScope,
        TransformConfig,
    },
    TestClock,
};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    circuit::{CircuitBreaker, CircuitConfig},
    client::DeliveryClient,
    collaborators::{ConfigAuthProvider, TransformError, Transformer},
    executor::{DeliveryExecutor, ExecutorParts},
    rate_limit::RateLimiter,
    retry::RetryPolicy,
    storage::mock::MockDeliveryStorage,
};

pub(crate) fn push_route(tenant_id: TenantId, url: &str) -> Route {
    Route {
        id: RouteId::new(),
        tenant_id,
        name: "test-route".to_string(),
        direction: Direction::Push,
        event_types: vec!["order.created".to_string()],
        scope: TenantScope::default(),
        target: Target::post(url),
        auth: AuthConfig::None,
        retry: RetrySettings::default(),
        rate_limit: None,
        steps: Vec::new(),
        step_delay_ms: 0,
        schedule: None,
        data_source: None,
        active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub(crate) fn executor(storage: &MockDeliveryStorage, clock: &TestClock) -> DeliveryExecutor {
    let storage: Arc<MockDeliveryStorage> = Arc::new(storage.clone());
    let clock: Arc<TestClock> = Arc::new(clock.clone());

    DeliveryExecutor::new(ExecutorParts {
        storage: storage.clone(),
        client: DeliveryClient::with_defaults().expect("client builds"),
        rate_limiter: RateLimiter::new(storage.clone(), clock.clone()),
        circuit: CircuitBreaker::new(storage.clone(), clock.clone(), CircuitConfig::default()),
        transformer: Arc::new(crate::collaborators::BuiltinTransformer),
        auth: Arc::new(ConfigAuthProvider),
        events: Arc::new(RecordingEvents::default()),
        clock,
        immediate_policy: RetryPolicy::immediate(3),
        dlq_policy: RetryPolicy::dead_letter(5),
    })
}

/// Transformer that always fails the same way.
#[derive(Debug)]
pub(crate) struct ScriptedTransformer(TransformError);

impl ScriptedTransformer {
    pub(crate) fn rejecting(message: &str) -> Self {
        Self(TransformError::Rejected(message.to_string()))
    }

    pub(crate) fn unavailable(message: &str) -> Self {
        Self(TransformError::Unavailable(message.to_string()))
    }
}

#[async_trait]
impl Transformer for ScriptedTransformer {
    async fn transform(
        &self,
        _payload: Value,
        _config: &TransformConfig,
    ) -> Result<Value, TransformError> {
        Err(self.0.clone())
    }
}

#[derive(Debug, Default, Clone)]
pub(crate) struct RecordingEvents {
    pub(crate) events: Arc<Mutex<Vec<DeliveryEvent>>>,
}

impl RecordingEvents {
    pub(crate) async fn snapshot(&self) -> Vec<DeliveryEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventHandler for RecordingEvents {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.lock().await.push(event);
    }
}
