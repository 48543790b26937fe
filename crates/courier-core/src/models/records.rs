//! Events, cursors and the records the engine appends as it works.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EventId, ExecutionId, Route, RouteId, TenantId};

/// Event read from the upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SourceEvent {
    /// Event identifier.
    pub id: EventId,
    /// Monotonic position in the source. Cursors compare against this.
    pub position: i64,
    /// Tenant the event belongs to.
    pub tenant_id: TenantId,
    /// Event type, e.g. `order.created`.
    pub event_type: String,
    /// Event payload.
    pub payload: serde_json::Value,
    /// When the source recorded the event.
    pub created_at: DateTime<Utc>,
}

/// Durable cursor for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Checkpoint {
    /// Owning worker name.
    pub worker: String,
    /// Last position whose outcome has been recorded.
    pub position: i64,
    /// When the cursor last moved.
    pub updated_at: DateTime<Utc>,
}

/// Consecutive endpoint failures for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FailureCounter {
    /// Failures since the last success or manual reset.
    pub consecutive_failures: u32,
    /// Time of the most recent failure.
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Which worker produced a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOrigin {
    /// Upstream event through the delivery worker.
    Event,
    /// Scheduled delivery entry.
    Scheduled,
    /// Scheduled job run.
    Job,
    /// Dead-letter retry cycle.
    DlqReplay,
}

text_enum!(DeliveryOrigin {
    Event => "event",
    Scheduled => "scheduled",
    Job => "job",
    DlqReplay => "dlq_replay",
});

/// Recorded result of one executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Endpoint accepted the delivery.
    Success,
    /// Delivery failed after its attempt budget.
    Failed,
    /// Skipped: route over its rate limit.
    RateLimited,
    /// Skipped: route circuit open.
    CircuitOpen,
}

text_enum!(OutcomeStatus {
    Success => "success",
    Failed => "failed",
    RateLimited => "rate_limited",
    CircuitOpen => "circuit_open",
});

impl OutcomeStatus {
    /// Returns true for resource-exhaustion skips.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::RateLimited | Self::CircuitOpen)
    }
}

/// Outcome appended to the observability sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    /// Record identifier.
    pub id: Uuid,
    /// Route delivered through.
    pub route_id: RouteId,
    /// Tenant delivered for.
    pub tenant_id: TenantId,
    /// Upstream event, if any.
    pub event_id: Option<EventId>,
    /// Multi-step index, if any.
    pub step_index: Option<i32>,
    /// Producing worker.
    pub origin: DeliveryOrigin,
    /// Result.
    pub status: OutcomeStatus,
    /// HTTP attempts made.
    pub attempts: u32,
    /// Final HTTP status, if the endpoint responded.
    pub http_status: Option<u16>,
    /// Failure description.
    pub error: Option<String>,
    /// Wall time spent in the executor.
    pub duration_ms: u64,
    /// When the outcome was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Persisted run state of a scheduled route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobState {
    /// Last time the job ran.
    pub last_run: Option<DateTime<Utc>>,
    /// Next cron fire time.
    pub next_run: Option<DateTime<Utc>>,
}

/// Scheduled route together with its run state.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    /// Route configuration.
    pub route: Route,
    /// Run state.
    pub state: JobState,
}

/// Stage of a scheduled job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    /// Pulling rows from the data source.
    Fetch,
    /// Transforming the batch.
    Transform,
    /// Delivering the batch.
    Deliver,
}

/// Result of one job stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage completed.
    Succeeded,
    /// Stage failed.
    Failed,
    /// Stage did not run, or ran and was skipped by a guard.
    Skipped,
}

/// Structured record of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage.
    pub stage: JobStage,
    /// Result.
    pub status: StageStatus,
    /// Error or skip reason.
    pub message: Option<String>,
    /// Stage duration.
    pub duration_ms: u64,
}

impl StageRecord {
    /// Record for a stage that never ran.
    pub fn skipped(stage: JobStage, reason: impl Into<String>) -> Self {
        Self { stage, status: StageStatus::Skipped, message: Some(reason.into()), duration_ms: 0 }
    }
}

/// Execution record of one scheduled job run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    /// Record identifier.
    pub id: ExecutionId,
    /// Scheduled route.
    pub route_id: RouteId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Rows fetched, when the fetch stage succeeded.
    pub rows_fetched: Option<i32>,
    /// Per-stage results in execution order.
    pub stages: Vec<StageRecord>,
}

impl JobExecution {
    /// Returns the record for `stage`, if present.
    pub fn stage(&self, stage: JobStage) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.stage == stage)
    }

    /// Returns true when every stage succeeded.
    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|record| record.status == StageStatus::Succeeded)
    }
}
