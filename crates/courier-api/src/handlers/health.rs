//! Health check handlers for service monitoring.
//!
//! Provides liveness, readiness, and health endpoints. Health folds the
//! database check together with worker heartbeats.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::Clock;
use courier_delivery::{health::WorkerHealth, Operations};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Individual component health checks
    pub checks: HealthChecks,
    /// Service version information
    pub version: String,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// A worker missed its heartbeats
    Degraded,
    /// Storage unreachable
    Unhealthy,
}

/// Individual component health check results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Database connectivity
    pub database: ComponentHealth,
    /// Worker heartbeats
    pub workers: Vec<WorkerHealth>,
}

/// Health status for individual components.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Optional error message if unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Response time in milliseconds
    pub response_time_ms: u64,
}

/// Component-level health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is experiencing issues
    Down,
}

/// Health service that encapsulates the clock so checks are testable.
pub struct HealthService {
    clock: Arc<dyn Clock>,
}

impl HealthService {
    /// Creates a new health service with the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Checks storage and worker heartbeats.
    pub async fn health_check(&self, operations: &Operations) -> HealthResponse {
        debug!("performing health check");

        let timestamp = self.clock.now_utc();
        let start_time = self.clock.now();
        let database = self.check_database_health(operations).await;
        let db_duration = self.clock.now().duration_since(start_time);
        let workers = operations.worker_health().await;

        let status = match database.status {
            ComponentStatus::Down => HealthStatus::Unhealthy,
            ComponentStatus::Up if workers.iter().any(|worker| !worker.alive) => {
                HealthStatus::Degraded
            },
            ComponentStatus::Up => HealthStatus::Healthy,
        };

        HealthResponse {
            status,
            timestamp,
            checks: HealthChecks {
                database: ComponentHealth {
                    status: database.status,
                    message: database.message,
                    response_time_ms: u64::try_from(db_duration.as_millis()).unwrap_or(u64::MAX),
                },
                workers,
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn check_database_health(&self, operations: &Operations) -> DatabaseHealth {
        match operations.storage_health().await {
            Ok(()) => DatabaseHealth { status: ComponentStatus::Up, message: None },
            Err(e) => {
                error!(error = %e, "database health check failed");
                DatabaseHealth {
                    status: ComponentStatus::Down,
                    message: Some(format!("database connection failed: {e}")),
                }
            },
        }
    }
}

struct DatabaseHealth {
    status: ComponentStatus,
    message: Option<String>,
}

/// Health check endpoint handler.
///
/// A missed worker heartbeat degrades health without failing the probe;
/// unreachable storage fails it.
#[instrument(name = "health_check", skip(app_state))]
pub async fn health_check(State(app_state): State<AppState>) -> Response {
    let response =
        HealthService::new(app_state.clock.clone()).health_check(&app_state.operations).await;

    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    debug!(status = ?response.status, "health check completed");
    (status_code, Json(response)).into_response()
}

/// Readiness probe: ready once storage answers.
#[instrument(name = "readiness_check", skip(app_state))]
pub async fn readiness_check(State(app_state): State<AppState>) -> Response {
    match app_state.operations.storage_health().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "message": e.to_string() })),
        )
            .into_response(),
    }
}

/// Liveness probe. Does not touch external dependencies.
#[instrument(name = "liveness_check", skip(app_state))]
pub async fn liveness_check(State(app_state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": app_state.clock.now_utc(),
        "service": "courier"
    });

    (StatusCode::OK, Json(response)).into_response()
}

/// Heartbeat state of every worker loop.
#[instrument(name = "worker_health", skip(app_state))]
pub async fn worker_health(State(app_state): State<AppState>) -> Json<Vec<WorkerHealth>> {
    Json(app_state.operations.worker_health().await)
}
