//! HTTP request handlers for the operator API.
//!
//! Handlers are grouped by resource:
//! - `health` - liveness, readiness, health and worker heartbeats
//! - `dlq` - dead-letter listing, replay, abandonment and deletion
//! - `routes` - rate-limit and circuit breaker inspection and resets
//!
//! Every failure is rendered as `{"error": {"code", "message"}}`.

pub mod dlq;
pub mod health;
pub mod routes;

pub use health::{health_check, liveness_check, readiness_check, worker_health};
