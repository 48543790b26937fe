//! Route configuration as read from the configuration subsystem.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RouteId, TenantId};

/// How a route is triggered.
///
/// Immutable after the route is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Driven by upstream events through the delivery worker.
    Push,
    /// Request/response proxying handled outside the delivery engine.
    Proxy,
    /// Driven by a cron expression or interval through the job worker.
    Scheduled,
}

text_enum!(Direction {
    Push => "push",
    Proxy => "proxy",
    Scheduled => "scheduled",
});

/// HTTP methods supported for outbound deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP GET.
    Get,
    /// HTTP POST (default).
    #[default]
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP PATCH.
    Patch,
    /// HTTP DELETE.
    Delete,
}

text_enum!(HttpMethod {
    Get => "GET",
    Post => "POST",
    Put => "PUT",
    Patch => "PATCH",
    Delete => "DELETE",
});

/// Credentials the auth collaborator turns into request headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication headers.
    #[default]
    None,
    /// `Authorization: Bearer <token>`.
    Bearer {
        /// Bearer token.
        token: String,
    },
    /// HTTP basic authentication.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// Static key sent in a custom header.
    ApiKey {
        /// Header name, e.g. `X-Api-Key`.
        header: String,
        /// Key value.
        value: String,
    },
    /// Arbitrary static headers.
    Headers {
        /// Header name to value.
        headers: HashMap<String, String>,
    },
}

/// Payload transformation applied before delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformConfig {
    /// Payload is delivered unchanged.
    #[default]
    Passthrough,
    /// Payload is nested under `key`.
    Wrap {
        /// Name of the wrapping field.
        key: String,
    },
    /// Output object built from JSON pointers into the input payload.
    Template {
        /// Output field name to JSON pointer, e.g. `"amount" => "/order/total"`.
        fields: HashMap<String, String>,
    },
    /// Script executed by an external sandboxed runtime.
    Script {
        /// Script language identifier.
        language: String,
        /// Script source.
        source: String,
    },
}

/// Per-route retry and timeout settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Total in-process attempts before escalating to the dead-letter queue.
    pub retry_count: u32,
    /// Per-attempt HTTP timeout in seconds.
    pub timeout_seconds: u64,
    /// Dead-letter retry cycles before an entry is abandoned.
    pub dlq_max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { retry_count: 3, timeout_seconds: 30, dlq_max_retries: 5 }
    }
}

/// Fixed-window request budget for a route and tenant pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Window length in seconds.
    pub window_seconds: u32,
    /// Requests allowed per window.
    pub max_requests: u32,
}

/// Which tenants a route serves besides its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TenantScope {
    /// Serve every descendant of the owning tenant.
    pub include_children: bool,
    /// Additional tenants served explicitly.
    pub included_tenants: Vec<TenantId>,
    /// Tenants (and their subtrees) never served.
    pub excluded_tenants: Vec<TenantId>,
}

/// Destination of one HTTP delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Endpoint URL.
    pub url: String,
    /// HTTP method.
    #[serde(default)]
    pub method: HttpMethod,
    /// Static headers added to every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Transformation applied to the payload for this target.
    #[serde(default)]
    pub transform: TransformConfig,
}

impl Target {
    /// Creates a POST target with no extra headers or transform.
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Post,
            headers: HashMap::new(),
            transform: TransformConfig::Passthrough,
        }
    }
}

/// One step of a multi-step delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStep {
    /// Step label used in logs and outcome records.
    pub name: String,
    /// Where this step delivers.
    pub target: Target,
}

/// When a scheduled route or recurring entry fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Cron expression evaluated in an IANA timezone.
    Cron {
        /// Cron expression, five or six fields.
        expression: String,
        /// IANA timezone name, e.g. `Europe/Berlin`.
        #[serde(default = "default_timezone")]
        timezone: String,
    },
    /// Fixed interval since the previous run.
    Interval {
        /// Interval length in seconds.
        seconds: u64,
    },
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Batch data source for scheduled jobs.
///
/// String values may contain `{{tenant_id}}`, `{{route_id}}`, `{{now}}`,
/// `{{today}}`, `{{yesterday}}` and `{{last_run}}` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSourceConfig {
    /// Read-only parameterized SQL query; each row becomes a JSON object.
    Query {
        /// SQL text with `$1..$n` placeholders.
        sql: String,
        /// Positional parameters, bound as text.
        #[serde(default)]
        params: Vec<String>,
    },
    /// Internal API call returning JSON.
    Http {
        /// Request URL.
        url: String,
        /// HTTP method.
        #[serde(default = "default_fetch_method")]
        method: HttpMethod,
        /// Request headers.
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Optional JSON request body.
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    /// Fixed rows, mostly useful for heartbeat-style jobs.
    Static {
        /// Rows delivered on every run.
        rows: Vec<serde_json::Value>,
    },
}

fn default_fetch_method() -> HttpMethod {
    HttpMethod::Get
}

/// A configured mapping from tenant and event type (or schedule) to an
/// external delivery target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Route identifier.
    pub id: RouteId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Human-readable name.
    pub name: String,
    /// Trigger kind.
    pub direction: Direction,
    /// Event types matched by push routes; `*` matches everything.
    pub event_types: Vec<String>,
    /// Tenants served besides the owner.
    pub scope: TenantScope,
    /// Primary delivery target.
    pub target: Target,
    /// Authentication configuration.
    pub auth: AuthConfig,
    /// Retry and timeout settings.
    pub retry: RetrySettings,
    /// Optional rate limit.
    pub rate_limit: Option<RateLimitPolicy>,
    /// Ordered steps; when non-empty they replace the primary target.
    pub steps: Vec<DeliveryStep>,
    /// Delay between consecutive steps in milliseconds.
    pub step_delay_ms: u64,
    /// Schedule for `scheduled` routes.
    pub schedule: Option<Schedule>,
    /// Data source for `scheduled` routes.
    pub data_source: Option<DataSourceConfig>,
    /// Stored active flag.
    pub active: bool,
    /// When the route was created.
    pub created_at: DateTime<Utc>,
    /// When the route was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Route {
    /// Returns true if this route delivers through more than one step.
    pub fn is_multi_step(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Targets in delivery order, paired with their step index.
    ///
    /// Single-target routes yield the primary target with no index.
    pub fn delivery_targets(&self) -> Vec<(Option<usize>, &Target)> {
        if self.steps.is_empty() {
            vec![(None, &self.target)]
        } else {
            self.steps.iter().enumerate().map(|(index, step)| (Some(index), &step.target)).collect()
        }
    }

    /// Resolves the target for a recorded step index.
    pub fn target_for(&self, step_index: Option<usize>) -> Option<&Target> {
        match step_index {
            None => Some(&self.target),
            Some(index) => self.steps.get(index).map(|step| &step.target),
        }
    }

    /// Returns true if the route matches `event_type`.
    pub fn handles_event_type(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|candidate| candidate == "*" || candidate == event_type)
    }
}
