//! Run state and execution records for scheduled jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};

use crate::{
    error::Result,
    models::{JobExecution, JobState, RouteId},
};

/// Repository for job run state.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Stores `last_run` and `next_run` for a scheduled route.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn save_state(
        &self,
        route_id: RouteId,
        state: &JobState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO job_runs (route_id, last_run, next_run, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (route_id) DO UPDATE
            SET last_run = EXCLUDED.last_run,
                next_run = EXCLUDED.next_run,
                updated_at = EXCLUDED.updated_at
            ",
        )
        .bind(route_id)
        .bind(state.last_run)
        .bind(state.next_run)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Appends a structured execution record.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn record_execution(&self, execution: &JobExecution) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO job_executions (
                id, route_id, tenant_id, started_at, finished_at,
                rows_fetched, succeeded, stages
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(execution.id)
        .bind(execution.route_id)
        .bind(execution.tenant_id)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.rows_fetched)
        .bind(execution.succeeded())
        .bind(Json(&execution.stages))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
