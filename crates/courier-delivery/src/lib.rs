//! Delivery-and-retry engine.
//!
//! Four polling workers feed one executor:
//!
//! 1. **Delivery** - reads upstream events after a durable cursor, resolves
//!    matching routes across the tenant hierarchy and delivers each once
//! 2. **Scheduler** - sends one-shot and recurring scheduled deliveries
//! 3. **Jobs** - runs cron and interval routes that fetch rows from a data
//!    source and deliver them as a batch
//! 4. **DLQ** - replays dead-lettered deliveries with compounding backoff
//!    until they succeed or are abandoned
//!
//! The executor consults the per-route rate limiter and circuit breaker,
//! calls the transform and auth collaborators, then retries transient HTTP
//! failures in-process before escalating to the dead-letter queue.
//!
//! # Example
//!
//! ```no_run
//! use courier_delivery::{DeliveryEngine, DeliveryError, EngineConfig};
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), DeliveryError> {
//! let mut engine = DeliveryEngine::new(pool, EngineConfig::default())?;
//! engine.start()?;
//!
//! // ... until shutdown is requested
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod admin;
pub mod circuit;
pub mod client;
pub mod collaborators;
pub mod data_source;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod executor;
pub mod health;
pub mod poller;
pub mod rate_limit;
pub mod retry;
pub mod schedule;
pub mod scope;
pub mod storage;
pub mod worker_pool;
pub mod workers;

#[cfg(test)]
mod fixtures;

pub use admin::{Operations, RateLimitStatus};
pub use engine::{DeliveryEngine, EngineConfig, WorkerKind};
pub use error::{DeliveryError, Result};
pub use executor::{DeliveryExecutor, DeliveryOutcome, Dispatch};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
