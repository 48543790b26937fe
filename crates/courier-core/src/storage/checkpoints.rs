//! Durable per-worker cursors.
//!
//! Advancing is a single upsert guarded by `GREATEST`, so a stale or retried
//! tick can never move a cursor backwards.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{error::Result, models::Checkpoint};

/// Repository for worker checkpoints.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Loads the checkpoint for `worker`, if one has been written.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn load(&self, worker: &str) -> Result<Option<Checkpoint>> {
        let checkpoint = sqlx::query_as::<_, Checkpoint>(
            r"
            SELECT worker, position, updated_at
            FROM checkpoints
            WHERE worker = $1
            ",
        )
        .bind(worker)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(checkpoint)
    }

    /// Moves the cursor for `worker` forward to `position`.
    ///
    /// Returns the stored position, which is larger than `position` when
    /// another writer already advanced further.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn advance(&self, worker: &str, position: i64, now: DateTime<Utc>) -> Result<i64> {
        let stored = sqlx::query_scalar(
            r"
            INSERT INTO checkpoints (worker, position, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (worker) DO UPDATE
            SET position = GREATEST(checkpoints.position, EXCLUDED.position),
                updated_at = EXCLUDED.updated_at
            RETURNING position
            ",
        )
        .bind(worker)
        .bind(position)
        .bind(now)
        .fetch_one(&*self.pool)
        .await?;

        Ok(stored)
    }
}
