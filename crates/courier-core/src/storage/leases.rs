//! Worker role leases.
//!
//! A lease row names the owner of a worker role until `expires_at`. Taking a
//! lease is one conditional upsert: it succeeds when the row is absent,
//! expired, or already held by the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::Result;

/// Repository for worker leases.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Acquires or renews the lease for `worker` until `expires_at`.
    ///
    /// Returns false when another owner holds an unexpired lease.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn try_acquire(
        &self,
        worker: &str,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            r"
            INSERT INTO worker_leases (worker, owner, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (worker) DO UPDATE
            SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
            WHERE worker_leases.owner = EXCLUDED.owner OR worker_leases.expires_at <= $4
            RETURNING owner
            ",
        )
        .bind(worker)
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(acquired.is_some())
    }

    /// Releases the lease if `owner` still holds it.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn release(&self, worker: &str, owner: &str) -> Result<()> {
        sqlx::query("DELETE FROM worker_leases WHERE worker = $1 AND owner = $2")
            .bind(worker)
            .bind(owner)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}
