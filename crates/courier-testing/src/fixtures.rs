//! Builders for routes, upstream events and dead-letter entries.
//!
//! Defaults describe the common case: an active push route for
//! `order.created` posting to one URL, with the stock retry settings.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::models::{
    AuthConfig, DataSourceConfig, DeliveryOrigin, DeliveryStep, Direction, DlqEntry, DlqEntryId,
    DlqStatus, HttpMethod, RateLimitPolicy, RetrySettings, Route, RouteId, Schedule, Target,
    TenantId, TenantScope, TransformConfig,
};
use serde_json::{json, Value};

/// Builder for test routes.
#[derive(Debug, Clone)]
pub struct RouteBuilder {
    route: Route,
}

impl RouteBuilder {
    /// Push route for `tenant_id` delivering `order.created` to `url`.
    pub fn new(tenant_id: TenantId, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            route: Route {
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
                created_at: now,
                updated_at: now,
            },
        }
    }

    /// Sets the route name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.route.name = name.into();
        self
    }

    /// Replaces the subscribed event types. An empty list matches all.
    #[must_use]
    pub fn event_types(mut self, event_types: &[&str]) -> Self {
        self.route.event_types = event_types.iter().map(ToString::to_string).collect();
        self
    }

    /// Delivers events of descendant tenants as well.
    #[must_use]
    pub fn include_children(mut self) -> Self {
        self.route.scope.include_children = true;
        self
    }

    /// Excludes a descendant tenant.
    #[must_use]
    pub fn exclude_tenant(mut self, tenant_id: TenantId) -> Self {
        self.route.scope.excluded_tenants.push(tenant_id);
        self
    }

    /// Sets the target HTTP method.
    #[must_use]
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.route.target.method = method;
        self
    }

    /// Adds a static target header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.route.target.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the target transform.
    #[must_use]
    pub fn transform(mut self, transform: TransformConfig) -> Self {
        self.route.target.transform = transform;
        self
    }

    /// Sets the auth configuration.
    #[must_use]
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.route.auth = auth;
        self
    }

    /// Sets the in-process attempt budget.
    #[must_use]
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.route.retry.retry_count = retry_count;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.route.retry.timeout_seconds = timeout.as_secs().max(1);
        self
    }

    /// Sets the dead-letter cycle budget.
    #[must_use]
    pub fn dlq_max_retries(mut self, dlq_max_retries: u32) -> Self {
        self.route.retry.dlq_max_retries = dlq_max_retries;
        self
    }

    /// Limits the route to `max_requests` per `window`.
    #[must_use]
    pub fn rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        let window_seconds = u32::try_from(window.as_secs()).unwrap_or(u32::MAX);
        self.route.rate_limit = Some(RateLimitPolicy { window_seconds, max_requests });
        self
    }

    /// Adds a multi-step target.
    #[must_use]
    pub fn step(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.route.steps.push(DeliveryStep { name: name.into(), target: Target::post(url) });
        self
    }

    /// Sets the pause between steps.
    #[must_use]
    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.route.step_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Turns the route into a scheduled job running every `interval`.
    #[must_use]
    pub fn every(mut self, interval: Duration) -> Self {
        self.route.direction = Direction::Scheduled;
        self.route.schedule = Some(Schedule::Interval { seconds: interval.as_secs() });
        self
    }

    /// Turns the route into a scheduled job on a cron expression.
    #[must_use]
    pub fn cron(mut self, expression: impl Into<String>, timezone: impl Into<String>) -> Self {
        self.route.direction = Direction::Scheduled;
        self.route.schedule =
            Some(Schedule::Cron { expression: expression.into(), timezone: timezone.into() });
        self
    }

    /// Sets the job data source.
    #[must_use]
    pub fn data_source(mut self, data_source: DataSourceConfig) -> Self {
        self.route.data_source = Some(data_source);
        self
    }

    /// Uses fixed rows as the job data source.
    #[must_use]
    pub fn static_rows(self, rows: Vec<Value>) -> Self {
        self.data_source(DataSourceConfig::Static { rows })
    }

    /// Marks the route inactive.
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.route.active = false;
        self
    }

    /// Builds the route.
    pub fn build(self) -> Route {
        self.route
    }
}

/// Builder for upstream events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    /// Emitting tenant.
    pub tenant_id: TenantId,
    /// Event type.
    pub event_type: String,
    /// Payload.
    pub payload: Value,
    /// Age relative to the test clock at ingestion.
    pub age: Duration,
}

impl EventBuilder {
    /// `order.created` event for `tenant_id` with a unique payload.
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            event_type: "order.created".to_string(),
            payload: json!({ "order_id": uuid::Uuid::new_v4().to_string() }),
            age: Duration::ZERO,
        }
    }

    /// Sets the event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Backdates the event.
    #[must_use]
    pub fn aged(mut self, age: Duration) -> Self {
        self.age = age;
        self
    }
}

/// Builder for dead-letter entries.
#[derive(Debug, Clone)]
pub struct DlqEntryBuilder {
    entry: DlqEntry,
}

impl DlqEntryBuilder {
    /// Retryable entry for `route`, due at `now`, with the route's budget.
    pub fn new(route: &Route, now: DateTime<Utc>) -> Self {
        Self {
            entry: DlqEntry {
                id: DlqEntryId::new(),
                route_id: route.id,
                tenant_id: route.tenant_id,
                event_id: None,
                step_index: None,
                origin: DeliveryOrigin::Event,
                payload: json!({ "replayed": true }),
                pre_transformed: false,
                attempt_count: 0,
                max_retries: i32::try_from(route.retry.dlq_max_retries).unwrap_or(i32::MAX),
                retryable: true,
                status: DlqStatus::PendingRetry,
                last_error: Some("server error: HTTP 503".to_string()),
                next_retry_at: now,
                created_at: now,
                updated_at: now,
            },
        }
    }

    /// Sets the completed cycle count.
    #[must_use]
    pub fn attempts(mut self, attempt_count: i32) -> Self {
        self.entry.attempt_count = attempt_count;
        self
    }

    /// Sets the cycle budget.
    #[must_use]
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.entry.max_retries = max_retries;
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn status(mut self, status: DlqStatus) -> Self {
        self.entry.status = status;
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn payload(mut self, payload: Value) -> Self {
        self.entry.payload = payload;
        self
    }

    /// Builds the entry.
    pub fn build(self) -> DlqEntry {
        self.entry
    }
}
