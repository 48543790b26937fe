//! Repository for the dead-letter queue.
//!
//! Entries move `pending_retry -> retrying` when claimed and then either
//! leave the table (success), go back to `pending_retry` with a later
//! `next_retry_at`, or become `abandoned`. Abandoned entries are never
//! deleted automatically.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{DlqEntry, DlqEntryId, DlqFilter},
};

const COLUMNS: &str = "id, route_id, tenant_id, event_id, step_index, origin, payload, \
                       pre_transformed, attempt_count, max_retries, retryable, status, \
                       last_error, next_retry_at, created_at, updated_at";

/// Repository for dead-letter entries.
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
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, entry: &DlqEntry) -> Result<DlqEntryId> {
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
        entry: &DlqEntry,
    ) -> Result<DlqEntryId> {
        self.create_impl(&mut **tx, entry).await
    }

    async fn create_impl<'e, E>(&self, executor: E, entry: &DlqEntry) -> Result<DlqEntryId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO dlq_entries (
                id, route_id, tenant_id, event_id, step_index, origin, payload,
                pre_transformed, attempt_count, max_retries, retryable, status,
                last_error, next_retry_at, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16
            )
            RETURNING id
            ",
        )
        .bind(entry.id)
        .bind(entry.route_id)
        .bind(entry.tenant_id)
        .bind(entry.event_id)
        .bind(entry.step_index)
        .bind(entry.origin)
        .bind(&entry.payload)
        .bind(entry.pre_transformed)
        .bind(entry.attempt_count)
        .bind(entry.max_retries)
        .bind(entry.retryable)
        .bind(entry.status)
        .bind(&entry.last_error)
        .bind(entry.next_retry_at)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Claims up to `limit` due entries, oldest first, and marks them
    /// `retrying`.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so an overlapping claimer never receives
    /// the same entry.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DlqEntry>> {
        let query = format!(
            r"
            UPDATE dlq_entries
            SET status = 'retrying', updated_at = $1
            WHERE id IN (
                SELECT id FROM dlq_entries
                WHERE status = 'pending_retry' AND next_retry_at <= $1
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {COLUMNS}
            "
        );

        let mut entries = sqlx::query_as::<_, DlqEntry>(&query)
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&*self.pool)
            .await?;

        // RETURNING does not preserve the subquery order.
        entries.sort_by_key(|entry| entry.created_at);

        Ok(entries)
    }

    /// Returns entries stuck in `retrying` since before `cutoff` to
    /// `pending_retry`. Returns the number of entries recovered.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn recover_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE dlq_entries
            SET status = 'pending_retry', next_retry_at = updated_at
            WHERE status = 'retrying' AND updated_at < $1
            ",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Puts a claimed entry back to `pending_retry` after a failed cycle.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn reschedule(
        &self,
        id: DlqEntryId,
        attempt_count: i32,
        next_retry_at: DateTime<Utc>,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE dlq_entries
            SET status = 'pending_retry',
                attempt_count = $2,
                next_retry_at = $3,
                last_error = COALESCE($4, last_error),
                updated_at = $5
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(attempt_count)
        .bind(next_retry_at)
        .bind(last_error)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks an entry `abandoned`. Returns false when the entry does not
    /// exist or is already abandoned.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn abandon(
        &self,
        id: DlqEntryId,
        attempt_count: Option<i32>,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE dlq_entries
            SET status = 'abandoned',
                attempt_count = COALESCE($2, attempt_count),
                last_error = COALESCE($3, last_error),
                updated_at = $4
            WHERE id = $1 AND status <> 'abandoned'
            ",
        )
        .bind(id)
        .bind(attempt_count)
        .bind(last_error)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Resets an entry to `pending_retry`, due at `now`, with a fresh retry
    /// budget. Works for abandoned and non-retryable entries too.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn requeue(&self, id: DlqEntryId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE dlq_entries
            SET status = 'pending_retry',
                attempt_count = 0,
                retryable = TRUE,
                next_retry_at = $2,
                updated_at = $2
            WHERE id = $1 AND status <> 'retrying'
            ",
        )
        .bind(id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes an entry. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn delete(&self, id: DlqEntryId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dlq_entries WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finds an entry by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: DlqEntryId) -> Result<Option<DlqEntry>> {
        let query = format!("SELECT {COLUMNS} FROM dlq_entries WHERE id = $1");

        let entry = sqlx::query_as::<_, DlqEntry>(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(entry)
    }

    /// Lists entries matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>> {
        let query = format!(
            r"
            SELECT {COLUMNS}
            FROM dlq_entries
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::uuid IS NULL OR route_id = $2)
              AND ($3::text IS NULL OR status = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "
        );

        let entries = sqlx::query_as::<_, DlqEntry>(&query)
            .bind(filter.tenant_id)
            .bind(filter.route_id)
            .bind(filter.status)
            .bind(i64::from(filter.limit()))
            .fetch_all(&*self.pool)
            .await?;

        Ok(entries)
    }
}
