//! Read access to the upstream event source.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{error::Result, models::SourceEvent};

/// Repository for source events.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns up to `limit` events strictly after `position`, ascending.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn fetch_after(&self, position: i64, limit: u32) -> Result<Vec<SourceEvent>> {
        let events = sqlx::query_as::<_, SourceEvent>(
            r"
            SELECT id, position, tenant_id, event_type, payload, created_at
            FROM source_events
            WHERE position > $1
            ORDER BY position ASC
            LIMIT $2
            ",
        )
        .bind(position)
        .bind(i64::from(limit))
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }
}
