//! Error responses of the operator API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_delivery::DeliveryError;
use serde::Serialize;
use tracing::error;

/// Error body returned by every failing handler.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message.
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable error description.
    pub message: String,
}

/// Failure of an operator request.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The addressed resource does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The request cannot be applied in the resource's current state.
    #[error("{0}")]
    Conflict(String),

    /// The engine failed to serve the request.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Self::Delivery(DeliveryError::DatabaseError { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable")
            },
            Self::Delivery(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = %self, code, "operator request failed");
        }

        let body = ErrorResponse { error: ErrorDetail { code, message: self.to_string() } };
        (status, Json(body)).into_response()
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
