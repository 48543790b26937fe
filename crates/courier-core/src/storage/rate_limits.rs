//! Fixed-window request counters keyed by route, tenant and window start.
//!
//! Windows are derived from wall-clock time by the caller, so stale rows are
//! never read again and need no expiry job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::count_to_u32;
use crate::{
    error::Result,
    models::{RouteId, TenantId},
};

/// Repository for rate-limit windows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Atomically increments the window counter and returns the new count.
    ///
    /// The increment and the read happen in one statement, so concurrent
    /// callers each observe a distinct count.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn increment(
        &self,
        route_id: RouteId,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
    ) -> Result<u32> {
        let count: i32 = sqlx::query_scalar(
            r"
            INSERT INTO rate_limit_windows (route_id, tenant_id, window_start, request_count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (route_id, tenant_id, window_start) DO UPDATE
            SET request_count = rate_limit_windows.request_count + 1
            RETURNING request_count
            ",
        )
        .bind(route_id)
        .bind(tenant_id)
        .bind(window_start)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count_to_u32(count))
    }

    /// Reads the window counter without incrementing it.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count(
        &self,
        route_id: RouteId,
        tenant_id: TenantId,
        window_start: DateTime<Utc>,
    ) -> Result<u32> {
        let count: Option<i32> = sqlx::query_scalar(
            r"
            SELECT request_count
            FROM rate_limit_windows
            WHERE route_id = $1 AND tenant_id = $2 AND window_start = $3
            ",
        )
        .bind(route_id)
        .bind(tenant_id)
        .bind(window_start)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(count.map_or(0, count_to_u32))
    }

    /// Deletes every window for the pair. Returns the rows removed.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn reset(&self, route_id: RouteId, tenant_id: TenantId) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM rate_limit_windows
            WHERE route_id = $1 AND tenant_id = $2
            ",
        )
        .bind(route_id)
        .bind(tenant_id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
