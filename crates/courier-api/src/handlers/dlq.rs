//! Dead-letter queue management for operators.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use courier_core::models::{DlqEntry, DlqEntryId, DlqFilter, DlqStatus, RouteId, TenantId};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    AppState,
};

/// Query parameters of `GET /dlq`.
#[derive(Debug, Default, Deserialize)]
pub struct DlqQuery {
    /// Restrict to a tenant.
    pub tenant_id: Option<Uuid>,
    /// Restrict to a route.
    pub route_id: Option<Uuid>,
    /// Restrict to a status.
    pub status: Option<DlqStatus>,
    /// Page size.
    pub limit: Option<u32>,
}

impl From<DlqQuery> for DlqFilter {
    fn from(query: DlqQuery) -> Self {
        Self {
            tenant_id: query.tenant_id.map(TenantId),
            route_id: query.route_id.map(RouteId),
            status: query.status,
            limit: query.limit.map(|limit| limit.min(1000)),
        }
    }
}

/// Lists dead-letter entries, newest first.
#[instrument(name = "list_dlq", skip(app_state))]
pub async fn list_entries(
    State(app_state): State<AppState>,
    Query(query): Query<DlqQuery>,
) -> ApiResult<Json<Vec<DlqEntry>>> {
    Ok(Json(app_state.operations.list_dlq(query.into()).await?))
}

/// Fetches one entry.
#[instrument(name = "get_dlq", skip(app_state))]
pub async fn get_entry(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DlqEntry>> {
    app_state
        .operations
        .get_dlq(DlqEntryId(id))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("dlq entry {id}")))
}

/// Requeues an entry for immediate replay with a fresh budget.
#[instrument(name = "retry_dlq", skip(app_state))]
pub async fn retry_entry(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let id = DlqEntryId(id);
    if app_state.operations.retry_dlq(id).await? {
        return Ok(StatusCode::ACCEPTED);
    }

    match app_state.operations.get_dlq(id).await? {
        Some(_) => Err(ApiError::Conflict(format!("dlq entry {id} is being replayed"))),
        None => Err(ApiError::NotFound(format!("dlq entry {id}"))),
    }
}

/// Marks an entry abandoned.
#[instrument(name = "abandon_dlq", skip(app_state))]
pub async fn abandon_entry(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let id = DlqEntryId(id);
    if app_state.operations.abandon_dlq(id).await? {
        return Ok(StatusCode::NO_CONTENT);
    }

    match app_state.operations.get_dlq(id).await? {
        Some(_) => Err(ApiError::Conflict(format!("dlq entry {id} is already abandoned"))),
        None => Err(ApiError::NotFound(format!("dlq entry {id}"))),
    }
}

/// Deletes an entry.
#[instrument(name = "delete_dlq", skip(app_state))]
pub async fn delete_entry(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if app_state.operations.delete_dlq(DlqEntryId(id)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("dlq entry {id}")))
    }
}
