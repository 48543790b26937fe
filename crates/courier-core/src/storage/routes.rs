//! Read-only access to route configuration and the tenant hierarchy.
//!
//! Routes are owned by the configuration subsystem. This repository only
//! narrows candidates by direction and event type; tenant scope matching
//! happens in the delivery crate as a pure predicate.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};

use crate::{
    error::Result,
    models::{
        AuthConfig, DataSourceConfig, DeliveryStep, Direction, JobState, RateLimitPolicy,
        RetrySettings, Route, RouteId, Schedule, ScheduledJob, Target, TenantId, TenantScope,
    },
};

const COLUMNS: &str = "r.id, r.tenant_id, r.name, r.direction, r.event_types, r.scope, \
                       r.target, r.auth, r.retry, r.rate_limit, r.steps, r.step_delay_ms, \
                       r.schedule, r.data_source, r.active, r.created_at, r.updated_at";

#[derive(sqlx::FromRow)]
struct RouteRow {
    id: RouteId,
    tenant_id: TenantId,
    name: String,
    direction: Direction,
    event_types: Vec<String>,
    scope: Json<TenantScope>,
    target: Json<Target>,
    auth: Json<AuthConfig>,
    retry: Json<RetrySettings>,
    rate_limit: Option<Json<RateLimitPolicy>>,
    steps: Json<Vec<DeliveryStep>>,
    step_delay_ms: i64,
    schedule: Option<Json<Schedule>>,
    data_source: Option<Json<DataSourceConfig>>,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RouteRow> for Route {
    fn from(row: RouteRow) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            direction: row.direction,
            event_types: row.event_types,
            scope: row.scope.0,
            target: row.target.0,
            auth: row.auth.0,
            retry: row.retry.0,
            rate_limit: row.rate_limit.map(|Json(policy)| policy),
            steps: row.steps.0,
            step_delay_ms: u64::try_from(row.step_delay_ms).unwrap_or_default(),
            schedule: row.schedule.map(|Json(schedule)| schedule),
            data_source: row.data_source.map(|Json(source)| source),
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScheduledJobRow {
    #[sqlx(flatten)]
    route: RouteRow,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

/// Repository for routes and tenants.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds a route by ID regardless of its active flag.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: RouteId) -> Result<Option<Route>> {
        let query = format!("SELECT {COLUMNS} FROM routes r WHERE r.id = $1");

        let row = sqlx::query_as::<_, RouteRow>(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    /// Active routes with `direction` whose event types include
    /// `event_type` or the `*` wildcard.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_candidates(&self, event_type: &str, direction: Direction) -> Result<Vec<Route>> {
        let query = format!(
            r"
            SELECT {COLUMNS}
            FROM routes r
            WHERE r.active
              AND r.direction = $1
              AND (r.event_types @> ARRAY[$2]::text[] OR r.event_types @> ARRAY['*']::text[])
            ORDER BY r.created_at ASC
            "
        );

        let rows = sqlx::query_as::<_, RouteRow>(&query)
            .bind(direction)
            .bind(event_type)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Active scheduled routes together with their run state.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        let query = format!(
            r"
            SELECT {COLUMNS}, j.last_run, j.next_run
            FROM routes r
            LEFT JOIN job_runs j ON j.route_id = r.id
            WHERE r.active AND r.direction = 'scheduled'
            ORDER BY r.created_at ASC
            "
        );

        let rows = sqlx::query_as::<_, ScheduledJobRow>(&query).fetch_all(&*self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|row| ScheduledJob {
                route: row.route.into(),
                state: JobState { last_run: row.last_run, next_run: row.next_run },
            })
            .collect())
    }

    /// The tenant followed by its ancestors, nearest first.
    ///
    /// Unknown tenants resolve to a chain containing only themselves.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn tenant_ancestors(&self, tenant_id: TenantId) -> Result<Vec<TenantId>> {
        let ancestors: Vec<TenantId> = sqlx::query_scalar(
            r"
            WITH RECURSIVE chain (id, parent_id, depth) AS (
                SELECT id, parent_id, 0 FROM tenants WHERE id = $1
                UNION ALL
                SELECT t.id, t.parent_id, c.depth + 1
                FROM tenants t
                JOIN chain c ON t.id = c.parent_id
                WHERE c.depth < 64
            )
            SELECT id FROM chain ORDER BY depth ASC
            ",
        )
        .bind(tenant_id)
        .fetch_all(&*self.pool)
        .await?;

        if ancestors.is_empty() {
            return Ok(vec![tenant_id]);
        }

        Ok(ancestors)
    }
}
