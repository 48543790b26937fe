//! PostgreSQL repositories for delivery engine state.
//!
//! Each repository owns one table family and exposes the atomic operations
//! the workers need. Shared counters (checkpoints, rate-limit windows,
//! failure counters) are only ever changed with single-statement upserts,
//! never read-modify-write from application code.
//!
//! All SQL lives in this module.

use std::sync::Arc;

use sqlx::PgPool;

pub mod checkpoints;
pub mod dlq_entries;
pub mod job_runs;
pub mod leases;
pub mod outcomes;
pub mod rate_limits;
pub mod route_failures;
pub mod routes;
pub mod scheduled_deliveries;
pub mod source_events;

use crate::error::Result;

/// Converts a non-negative counter column into `u32`.
fn count_to_u32(count: i32) -> u32 {
    u32::try_from(count).unwrap_or_default()
}

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<PgPool>,

    /// Worker cursors.
    pub checkpoints: Arc<checkpoints::Repository>,

    /// Rate-limit windows.
    pub rate_limits: Arc<rate_limits::Repository>,

    /// Circuit breaker failure counters.
    pub route_failures: Arc<route_failures::Repository>,

    /// Dead-letter queue.
    pub dlq_entries: Arc<dlq_entries::Repository>,

    /// Scheduled deliveries.
    pub scheduled_deliveries: Arc<scheduled_deliveries::Repository>,

    /// Route configuration and tenant hierarchy.
    pub routes: Arc<routes::Repository>,

    /// Scheduled job state and execution records.
    pub job_runs: Arc<job_runs::Repository>,

    /// Upstream event source.
    pub source_events: Arc<source_events::Repository>,

    /// Delivery outcome log.
    pub outcomes: Arc<outcomes::Repository>,

    /// Worker leases.
    pub leases: Arc<leases::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            checkpoints: Arc::new(checkpoints::Repository::new(pool.clone())),
            rate_limits: Arc::new(rate_limits::Repository::new(pool.clone())),
            route_failures: Arc::new(route_failures::Repository::new(pool.clone())),
            dlq_entries: Arc::new(dlq_entries::Repository::new(pool.clone())),
            scheduled_deliveries: Arc::new(scheduled_deliveries::Repository::new(pool.clone())),
            routes: Arc::new(routes::Repository::new(pool.clone())),
            job_runs: Arc::new(job_runs::Repository::new(pool.clone())),
            source_events: Arc::new(source_events::Repository::new(pool.clone())),
            outcomes: Arc::new(outcomes::Repository::new(pool.clone())),
            leases: Arc::new(leases::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Applies the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&*self.pool).await?;
        Ok(())
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_without_connecting() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Storage::new(pool);

        assert!(Arc::ptr_eq(&storage.pool(), &storage.pool));
    }

    #[test]
    fn negative_counters_clamp_to_zero() {
        assert_eq!(count_to_u32(-3), 0);
        assert_eq!(count_to_u32(7), 7);
    }
}
