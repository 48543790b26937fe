//! Error types for delivery operations.
//!
//! Every failure the executor can observe maps onto one variant here, and
//! each variant answers two questions for the retry machinery: may the same
//! request succeed later (`is_retryable`), and did the endpoint itself
//! misbehave (`counts_toward_circuit`).

use std::{fmt, time::Duration};

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while delivering, fetching or persisting.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Non-2xx response other than 429 and 5xx.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// HTTP response indicated server error (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Endpoint answered 429.
    #[error("rate limited by endpoint: retry after {retry_after_seconds:?}s")]
    RateLimited {
        /// Seconds from the Retry-After header, if present
        retry_after_seconds: Option<u64>,
    },

    /// Circuit breaker is open, delivery blocked.
    #[error("circuit breaker open for route {route_id}")]
    CircuitOpen {
        /// Route with the open circuit
        route_id: String,
    },

    /// Transform collaborator rejected the payload.
    #[error("transform rejected payload: {message}")]
    TransformError {
        /// Rejection reason
        message: String,
    },

    /// Auth collaborator could not build headers from the route config.
    #[error("auth configuration invalid: {message}")]
    AuthError {
        /// Failure reason
        message: String,
    },

    /// A collaborator was down or timed out; the item should be reprocessed
    /// later rather than recorded as failed.
    #[error("{collaborator} unavailable: {message}")]
    CollaboratorUnavailable {
        /// Collaborator name, e.g. `transform`
        collaborator: &'static str,
        /// Failure reason
        message: String,
    },

    /// Batch data source failed.
    #[error("data source fetch failed: {message}")]
    FetchError {
        /// Failure reason
        message: String,
    },

    /// Database operation failed during delivery.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid route or engine configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Worker shutdown requested.
    #[error("worker shutdown requested")]
    ShutdownRequested,

    /// Workers did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// Worker task panicked.
    #[error("worker {worker} panicked: {error}")]
    WorkerPanic {
        /// Worker name
        worker: String,
        /// Panic description
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error with optional retry guidance.
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(route_id: impl fmt::Display) -> Self {
        Self::CircuitOpen { route_id: route_id.to_string() }
    }

    /// Creates a transform rejection.
    pub fn transform(message: impl Into<String>) -> Self {
        Self::TransformError { message: message.into() }
    }

    /// Creates an auth configuration error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::AuthError { message: message.into() }
    }

    /// Creates a collaborator outage error.
    pub fn unavailable(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::CollaboratorUnavailable { collaborator, message: message.into() }
    }

    /// Creates a data source error.
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::FetchError { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Classifies a non-2xx HTTP status.
    ///
    /// 429 becomes `RateLimited`, 5xx becomes `ServerError`, everything else
    /// (408 included) becomes `ClientError`.
    pub fn from_status(status_code: u16, body: String, retry_after_seconds: Option<u64>) -> Self {
        match status_code {
            429 => Self::rate_limited(retry_after_seconds),
            500..=599 => Self::server_error(status_code, body),
            _ => Self::client_error(status_code, body),
        }
    }

    /// Determines if this error represents a temporary failure that should be
    /// retried.
    ///
    /// Network errors, timeouts, 408, 429, 5xx and collaborator outages are
    /// retryable. Other 4xx, transform rejections and configuration problems
    /// are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::CollaboratorUnavailable { .. }
            | Self::FetchError { .. }
            | Self::DatabaseError { .. } => true,

            Self::ClientError { status_code, .. } => *status_code == 408,

            Self::CircuitOpen { .. }
            | Self::TransformError { .. }
            | Self::AuthError { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownRequested
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Returns true when the failure was produced by the endpoint or the
    /// path to it. Only these failures feed the circuit breaker.
    pub fn counts_toward_circuit(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. }
                | Self::Timeout { .. }
                | Self::ClientError { .. }
                | Self::ServerError { .. }
                | Self::RateLimited { .. }
        )
    }

    /// Returns the suggested retry delay in seconds from a Retry-After
    /// header.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }

    /// Category for log fields.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }

    /// HTTP status carried by the error, if the endpoint responded.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidInput(message) => Self::configuration(message),
            other => Self::database(other.to_string()),
        }
    }
}

/// Category of delivery error for logs and outcome records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Rate limiting.
    RateLimit,
    /// Circuit breaker protection.
    Circuit,
    /// Transform or auth collaborator.
    Collaborator,
    /// Batch data source.
    Fetch,
    /// Database operations.
    Database,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::CircuitOpen { .. } => Self::Circuit,
            DeliveryError::TransformError { .. }
            | DeliveryError::AuthError { .. }
            | DeliveryError::CollaboratorUnavailable { .. } => Self::Collaborator,
            DeliveryError::FetchError { .. } => Self::Fetch,
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownRequested
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Circuit => write!(f, "circuit"),
            Self::Collaborator => write!(f, "collaborator"),
            Self::Fetch => write!(f, "fetch"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(DeliveryError::from_status(408, String::new(), None).is_retryable());
        assert!(DeliveryError::from_status(429, String::new(), Some(3)).is_retryable());
        assert!(DeliveryError::from_status(503, String::new(), None).is_retryable());

        assert!(!DeliveryError::from_status(400, String::new(), None).is_retryable());
        assert!(!DeliveryError::from_status(404, String::new(), None).is_retryable());
        assert!(!DeliveryError::from_status(301, String::new(), None).is_retryable());
    }

    #[test]
    fn terminal_collaborator_failures_are_not_retryable() {
        assert!(!DeliveryError::transform("script threw").is_retryable());
        assert!(!DeliveryError::auth("missing token").is_retryable());
        assert!(!DeliveryError::configuration("invalid URL").is_retryable());
        assert!(DeliveryError::unavailable("transform", "sandbox down").is_retryable());
    }

    #[test]
    fn only_endpoint_failures_feed_the_circuit() {
        assert!(DeliveryError::timeout(30).counts_toward_circuit());
        assert!(DeliveryError::client_error(404, "").counts_toward_circuit());
        assert!(!DeliveryError::transform("bad").counts_toward_circuit());
        assert!(!DeliveryError::database("down").counts_toward_circuit());
    }

    #[test]
    fn rate_limit_retry_after_extracted() {
        assert_eq!(DeliveryError::rate_limited(Some(120)).retry_after_seconds(), Some(120));
        assert_eq!(DeliveryError::rate_limited(None).retry_after_seconds(), None);
        assert_eq!(DeliveryError::timeout(30).retry_after_seconds(), None);
    }

    #[test]
    fn core_errors_map_by_kind() {
        let error = DeliveryError::from(CoreError::InvalidInput("bad cron".to_string()));
        assert!(matches!(error, DeliveryError::ConfigurationError { .. }));

        let error = DeliveryError::from(CoreError::Database("pool closed".to_string()));
        assert_eq!(ErrorCategory::from(&error), ErrorCategory::Database);
    }

    #[test]
    fn error_display_format() {
        assert_eq!(DeliveryError::timeout(30).to_string(), "request timeout after 30s");
        assert_eq!(
            DeliveryError::unavailable("transform", "sandbox down").to_string(),
            "transform unavailable: sandbox down"
        );
        assert_eq!(ErrorCategory::from(&DeliveryError::rate_limited(None)).to_string(), "rate_limit");
    }
}
