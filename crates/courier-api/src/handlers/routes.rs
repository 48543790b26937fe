//! Rate-limit and circuit breaker controls per route.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use courier_core::models::{RouteId, TenantId};
use courier_delivery::{circuit::CircuitStatus, RateLimitStatus};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

/// Tenant selector for rate-limit requests.
#[derive(Debug, Deserialize)]
pub struct TenantQuery {
    /// Tenant whose window is addressed.
    pub tenant_id: Uuid,
}

/// Result of a rate-limit reset.
#[derive(Debug, Serialize)]
pub struct RateLimitReset {
    /// Windows removed.
    pub windows_removed: u64,
}

/// Current rate-limit window of a route for a tenant.
#[instrument(name = "rate_limit_status", skip(app_state))]
pub async fn rate_limit_status(
    State(app_state): State<AppState>,
    Path(route_id): Path<Uuid>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<RateLimitStatus>> {
    app_state
        .operations
        .rate_limit_status(RouteId(route_id), TenantId(query.tenant_id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("route {route_id}")))
}

/// Clears the rate-limit windows of a route for a tenant.
#[instrument(name = "reset_rate_limit", skip(app_state))]
pub async fn reset_rate_limit(
    State(app_state): State<AppState>,
    Path(route_id): Path<Uuid>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Json<RateLimitReset>> {
    let windows_removed = app_state
        .operations
        .reset_rate_limit(RouteId(route_id), TenantId(query.tenant_id))
        .await?;
    Ok(Json(RateLimitReset { windows_removed }))
}

/// Circuit state of a route.
#[instrument(name = "circuit_status", skip(app_state))]
pub async fn circuit_status(
    State(app_state): State<AppState>,
    Path(route_id): Path<Uuid>,
) -> ApiResult<Json<CircuitStatus>> {
    Ok(Json(app_state.operations.circuit_status(RouteId(route_id)).await?))
}

/// Closes the circuit of a route and returns the new state.
#[instrument(name = "reset_circuit", skip(app_state))]
pub async fn reset_circuit(
    State(app_state): State<AppState>,
    Path(route_id): Path<Uuid>,
) -> ApiResult<Json<CircuitStatus>> {
    let route_id = RouteId(route_id);
    app_state.operations.reset_circuit(route_id).await?;
    Ok(Json(app_state.operations.circuit_status(route_id).await?))
}
