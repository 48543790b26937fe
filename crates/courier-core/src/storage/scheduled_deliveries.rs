//! Repository for one-shot and recurring scheduled deliveries.
//!
//! Completing a recurring entry inserts the next occurrence in the same
//! transaction; the completed row itself is never rescheduled. A pending
//! row only moves its due time when delivery is postponed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{types::Json, Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{
        RouteId, Schedule, ScheduledDelivery, ScheduledDeliveryId, ScheduledStatus, TenantId,
    },
};

#[derive(sqlx::FromRow)]
struct ScheduledDeliveryRow {
    id: ScheduledDeliveryId,
    route_id: RouteId,
    tenant_id: TenantId,
    scheduled_for: DateTime<Utc>,
    payload: Value,
    status: ScheduledStatus,
    recurrence: Option<Json<Schedule>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<ScheduledDeliveryRow> for ScheduledDelivery {
    fn from(row: ScheduledDeliveryRow) -> Self {
        Self {
            id: row.id,
            route_id: row.route_id,
            tenant_id: row.tenant_id,
            scheduled_for: row.scheduled_for,
            payload: row.payload,
            status: row.status,
            recurrence: row.recurrence.map(|Json(schedule)| schedule),
            last_error: row.last_error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        }
    }
}

/// Repository for scheduled deliveries.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new entry.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, entry: &ScheduledDelivery) -> Result<ScheduledDeliveryId> {
        self.create_impl(&*self.pool, entry).await
    }

    /// Inserts a new entry within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &ScheduledDelivery,
    ) -> Result<ScheduledDeliveryId> {
        self.create_impl(&mut **tx, entry).await
    }

    async fn create_impl<'e, E>(
        &self,
        executor: E,
        entry: &ScheduledDelivery,
    ) -> Result<ScheduledDeliveryId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO scheduled_deliveries (
                id, route_id, tenant_id, scheduled_for, payload, status,
                recurrence, last_error, created_at, completed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            ",
        )
        .bind(entry.id)
        .bind(entry.route_id)
        .bind(entry.tenant_id)
        .bind(entry.scheduled_for)
        .bind(&entry.payload)
        .bind(entry.status)
        .bind(entry.recurrence.as_ref().map(Json))
        .bind(&entry.last_error)
        .bind(entry.created_at)
        .bind(entry.completed_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Returns up to `limit` pending entries due at `now`, earliest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ScheduledDelivery>> {
        let rows = sqlx::query_as::<_, ScheduledDeliveryRow>(
            r"
            SELECT id, route_id, tenant_id, scheduled_for, payload, status,
                   recurrence, last_error, created_at, completed_at
            FROM scheduled_deliveries
            WHERE status = 'pending' AND scheduled_for <= $1
            ORDER BY scheduled_for ASC
            LIMIT $2
            ",
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Finds an entry by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: ScheduledDeliveryId) -> Result<Option<ScheduledDelivery>> {
        let row = sqlx::query_as::<_, ScheduledDeliveryRow>(
            r"
            SELECT id, route_id, tenant_id, scheduled_for, payload, status,
                   recurrence, last_error, created_at, completed_at
            FROM scheduled_deliveries
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Pushes a pending entry's due time to `until`. Returns false when the
    /// entry was no longer pending.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn postpone(&self, id: ScheduledDeliveryId, until: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE scheduled_deliveries
            SET scheduled_for = $2
            WHERE id = $1 AND status = 'pending'
            ",
        )
        .bind(id)
        .bind(until)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Moves a pending entry to a terminal status and optionally inserts the
    /// next occurrence, atomically.
    ///
    /// Returns false when the entry was no longer pending; the next
    /// occurrence is not inserted in that case.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn complete(
        &self,
        id: ScheduledDeliveryId,
        status: ScheduledStatus,
        last_error: Option<&str>,
        now: DateTime<Utc>,
        next: Option<&ScheduledDelivery>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r"
            UPDATE scheduled_deliveries
            SET status = $2, last_error = $3, completed_at = $4
            WHERE id = $1 AND status = 'pending'
            ",
        )
        .bind(id)
        .bind(status)
        .bind(last_error)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(next) = next {
            self.create_in_tx(&mut tx, next).await?;
        }

        tx.commit().await?;

        Ok(true)
    }
}
