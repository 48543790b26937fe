//! Append-only delivery outcome log.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{error::Result, models::OutcomeRecord};

/// Repository for delivery outcomes.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends an outcome record.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn record(&self, outcome: &OutcomeRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO delivery_outcomes (
                id, route_id, tenant_id, event_id, step_index, origin, status,
                attempts, http_status, error, duration_ms, recorded_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ",
        )
        .bind(outcome.id)
        .bind(outcome.route_id)
        .bind(outcome.tenant_id)
        .bind(outcome.event_id)
        .bind(outcome.step_index)
        .bind(outcome.origin)
        .bind(outcome.status)
        .bind(i32::try_from(outcome.attempts).unwrap_or(i32::MAX))
        .bind(outcome.http_status.map(i32::from))
        .bind(&outcome.error)
        .bind(i64::try_from(outcome.duration_ms).unwrap_or(i64::MAX))
        .bind(outcome.recorded_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
