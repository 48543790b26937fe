//! Per-route consecutive failure counters backing the circuit breaker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::count_to_u32;
use crate::{
    error::Result,
    models::{FailureCounter, RouteId},
};

/// Repository for route failure counters.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Reads the counter. Routes without a row have never failed.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, route_id: RouteId) -> Result<FailureCounter> {
        let row: Option<(i32, Option<DateTime<Utc>>)> = sqlx::query_as(
            r"
            SELECT consecutive_failures, last_failure_at
            FROM route_failure_counters
            WHERE route_id = $1
            ",
        )
        .bind(route_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row
            .map(|(failures, last_failure_at)| FailureCounter {
                consecutive_failures: count_to_u32(failures),
                last_failure_at,
            })
            .unwrap_or_default())
    }

    /// Increments the counter and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn increment(&self, route_id: RouteId, now: DateTime<Utc>) -> Result<u32> {
        let failures: i32 = sqlx::query_scalar(
            r"
            INSERT INTO route_failure_counters (route_id, consecutive_failures, last_failure_at)
            VALUES ($1, 1, $2)
            ON CONFLICT (route_id) DO UPDATE
            SET consecutive_failures = route_failure_counters.consecutive_failures + 1,
                last_failure_at = EXCLUDED.last_failure_at
            RETURNING consecutive_failures
            ",
        )
        .bind(route_id)
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count_to_u32(failures))
    }

    /// Sets the counter back to zero.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn reset(&self, route_id: RouteId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE route_failure_counters
            SET consecutive_failures = 0
            WHERE route_id = $1 AND consecutive_failures <> 0
            ",
        )
        .bind(route_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
