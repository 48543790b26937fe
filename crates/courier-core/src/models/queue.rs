//! Dead-letter and scheduled-delivery entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    DeliveryOrigin, DlqEntryId, EventId, RouteId, Schedule, ScheduledDeliveryId, TenantId,
};

/// Dead-letter entry status.
///
/// ```text
/// pending_retry ──claim──▶ retrying ──success──▶ (deleted)
///       ▲                     │
///       └──── backoff ────────┤
///                             └──max retries──▶ abandoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    /// Waiting for `next_retry_at`.
    PendingRetry,
    /// Claimed by the DLQ worker.
    Retrying,
    /// Retry budget exhausted or failure was terminal. Kept for inspection.
    Abandoned,
}

text_enum!(DlqStatus {
    PendingRetry => "pending_retry",
    Retrying => "retrying",
    Abandoned => "abandoned",
});

/// A delivery that exhausted its immediate retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DlqEntry {
    /// Entry identifier.
    pub id: DlqEntryId,
    /// Route the delivery belongs to.
    pub route_id: RouteId,
    /// Tenant the delivery was made for.
    pub tenant_id: TenantId,
    /// Upstream event, when the delivery was event-driven.
    pub event_id: Option<EventId>,
    /// Multi-step index, when the failed delivery was a step.
    pub step_index: Option<i32>,
    /// Which worker produced the delivery.
    pub origin: DeliveryOrigin,
    /// Payload as handed to the executor.
    pub payload: serde_json::Value,
    /// True when `payload` was already transformed by the producer.
    pub pre_transformed: bool,
    /// Dead-letter retry cycles completed so far.
    pub attempt_count: i32,
    /// Retry cycles allowed before abandonment.
    pub max_retries: i32,
    /// False for terminal failures kept only for audit visibility.
    pub retryable: bool,
    /// Current status.
    pub status: DlqStatus,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Earliest time of the next retry cycle.
    pub next_retry_at: DateTime<Utc>,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry last changed.
    pub updated_at: DateTime<Utc>,
}

impl DlqEntry {
    /// Returns true if another retry cycle is allowed after `attempt_count`
    /// completed cycles.
    pub fn has_retries_left(&self, attempt_count: i32) -> bool {
        self.retryable && attempt_count < self.max_retries
    }

    /// Step index as a `usize`, if present and valid.
    pub fn step(&self) -> Option<usize> {
        self.step_index.and_then(|index| usize::try_from(index).ok())
    }
}

/// Filter for operator listings of dead-letter entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DlqFilter {
    /// Restrict to a tenant.
    pub tenant_id: Option<TenantId>,
    /// Restrict to a route.
    pub route_id: Option<RouteId>,
    /// Restrict to a status.
    pub status: Option<DlqStatus>,
    /// Maximum number of entries returned.
    pub limit: Option<u32>,
}

impl DlqFilter {
    /// Default page size for listings.
    pub const DEFAULT_LIMIT: u32 = 100;

    /// Returns true if `entry` satisfies every set criterion.
    pub fn matches(&self, entry: &DlqEntry) -> bool {
        self.tenant_id.is_none_or(|tenant| entry.tenant_id == tenant)
            && self.route_id.is_none_or(|route| entry.route_id == route)
            && self.status.is_none_or(|status| entry.status == status)
    }

    /// Effective limit.
    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }
}

/// Scheduled delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledStatus {
    /// Waiting for `scheduled_for`.
    Pending,
    /// Delivered.
    Completed,
    /// Delivery failed; retries continue through the dead-letter queue.
    Failed,
    /// Withdrawn, e.g. because the route no longer exists.
    Cancelled,
}

text_enum!(ScheduledStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

/// One-shot or recurring delayed delivery.
///
/// Each occurrence of a recurring schedule is its own immutable entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledDelivery {
    /// Entry identifier.
    pub id: ScheduledDeliveryId,
    /// Route to deliver through.
    pub route_id: RouteId,
    /// Tenant the delivery is for.
    pub tenant_id: TenantId,
    /// Due time.
    pub scheduled_for: DateTime<Utc>,
    /// Payload snapshot.
    pub payload: serde_json::Value,
    /// Current status.
    pub status: ScheduledStatus,
    /// Recurrence, evaluated in its own timezone.
    pub recurrence: Option<Schedule>,
    /// Failure message, for failed or cancelled entries.
    pub last_error: Option<String>,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry left `pending`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScheduledDelivery {
    /// Creates a pending entry.
    pub fn pending(
        route_id: RouteId,
        tenant_id: TenantId,
        scheduled_for: DateTime<Utc>,
        payload: serde_json::Value,
        recurrence: Option<Schedule>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ScheduledDeliveryId::new(),
            route_id,
            tenant_id,
            scheduled_for,
            payload,
            status: ScheduledStatus::Pending,
            recurrence,
            last_error: None,
            created_at,
            completed_at: None,
        }
    }

    /// Builds the next occurrence of a recurring entry.
    pub fn next_occurrence(&self, scheduled_for: DateTime<Utc>, created_at: DateTime<Utc>) -> Self {
        Self::pending(
            self.route_id,
            self.tenant_id,
            scheduled_for,
            self.payload.clone(),
            self.recurrence.clone(),
            created_at,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: DlqStatus) -> DlqEntry {
        DlqEntry {
            id: DlqEntryId::new(),
            route_id: RouteId::new(),
            tenant_id: TenantId::new(),
            event_id: None,
            step_index: Some(1),
            origin: DeliveryOrigin::Event,
            payload: serde_json::json!({"id": 1}),
            pre_transformed: false,
            attempt_count: 0,
            max_retries: 3,
            retryable: true,
            status,
            last_error: None,
            next_retry_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn retries_left_respects_budget_and_flag() {
        let mut dlq = entry(DlqStatus::PendingRetry);
        assert!(dlq.has_retries_left(2));
        assert!(!dlq.has_retries_left(3));

        dlq.retryable = false;
        assert!(!dlq.has_retries_left(0));
    }

    #[test]
    fn filter_matches_on_every_field() {
        let dlq = entry(DlqStatus::Abandoned);

        assert!(DlqFilter::default().matches(&dlq));
        assert!(DlqFilter { status: Some(DlqStatus::Abandoned), ..Default::default() }
            .matches(&dlq));
        assert!(!DlqFilter { status: Some(DlqStatus::PendingRetry), ..Default::default() }
            .matches(&dlq));
        assert!(!DlqFilter { route_id: Some(RouteId::new()), ..Default::default() }.matches(&dlq));
    }

    #[test]
    fn next_occurrence_is_a_fresh_pending_entry() {
        let now = Utc::now();
        let first = ScheduledDelivery::pending(
            RouteId::new(),
            TenantId::new(),
            now,
            serde_json::json!({"report": "daily"}),
            Some(Schedule::Interval { seconds: 3600 }),
            now,
        );

        let next = first.next_occurrence(now + chrono::Duration::hours(1), now);

        assert_ne!(next.id, first.id);
        assert_eq!(next.status, ScheduledStatus::Pending);
        assert_eq!(next.payload, first.payload);
        assert_eq!(next.recurrence, first.recurrence);
    }

    #[test]
    fn status_strings_are_stable() {
        assert_eq!(DlqStatus::PendingRetry.to_string(), "pending_retry");
        assert_eq!("cancelled".parse::<ScheduledStatus>(), Ok(ScheduledStatus::Cancelled));
    }
}
