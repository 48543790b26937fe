//! HTTP client for route deliveries.
//!
//! Builds the outbound request from a route target, applies the per-route
//! timeout and classifies transport failures. Status classification of
//! non-2xx responses is left to [`DeliveryResponse::into_result`] so callers
//! can still inspect the raw response.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use courier_core::models::{EventId, HttpMethod, RouteId, TenantId};
use reqwest::{header::HeaderMap, Method, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;
const MAX_AUDIT_SIZE: usize = 1024;

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upper bound applied when a request carries no timeout of its own.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Courier-Delivery/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// Pooled HTTP client shared by every worker.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One outbound HTTP attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Route being delivered.
    pub route_id: RouteId,
    /// Tenant the delivery is for.
    pub tenant_id: TenantId,
    /// Upstream event, if any.
    pub event_id: Option<EventId>,
    /// Destination URL.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Target headers merged with auth headers.
    pub headers: HashMap<String, String>,
    /// Serialized payload.
    pub body: Bytes,
    /// Hard timeout for this attempt.
    pub timeout: Duration,
    /// Attempt number, starting at 1.
    pub attempt_number: u32,
}

/// Response from a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated for audit storage.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

impl DeliveryResponse {
    /// Turns a non-2xx response into the matching error.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` for 429, `ServerError` for 5xx and
    /// `ClientError` for every other non-2xx status.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success {
            return Ok(self);
        }
        let retry_after = extract_retry_after_seconds(&self.headers);
        Err(DeliveryError::from_status(self.status_code, self.body, retry_after))
    }
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Underlying reqwest client, shared with the HTTP data source.
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends one attempt.
    ///
    /// Any HTTP response, 2xx or not, is returned as `Ok`.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the request exceeded its timeout
    /// - `NetworkError` for connection and transport failures
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();
        let timeout = request.timeout.min(self.config.timeout);

        let span = info_span!(
            "route_delivery",
            route_id = %request.route_id,
            tenant_id = %request.tenant_id,
            event_id = ?request.event_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting delivery attempt");

            let mut http_request = self
                .client
                .request(to_method(request.method), &request.url)
                .timeout(timeout)
                .header("content-type", "application/json");

            if request.method != HttpMethod::Get {
                http_request = http_request.body(request.body.clone());
            }

            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }

            http_request = http_request
                .header("X-Courier-Route-Id", request.route_id.to_string())
                .header("X-Courier-Tenant-Id", request.tenant_id.to_string())
                .header("X-Courier-Attempt", request.attempt_number.to_string());
            if let Some(event_id) = request.event_id {
                http_request = http_request.header("X-Courier-Event-Id", event_id.to_string());
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = parse_response(response, start_time.elapsed()).await;

            match delivery_response.status_code {
                200..=299 => tracing::debug!(
                    status = delivery_response.status_code,
                    duration_ms = delivery_response.duration.as_millis(),
                    "endpoint accepted delivery"
                ),
                status => tracing::warn!(status, "endpoint returned non-success status"),
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

async fn parse_response(response: Response, duration: Duration) -> DeliveryResponse {
    let status_code = response.status().as_u16();
    let is_success = response.status().is_success();
    let headers = extract_headers(response.headers());

    let body = match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_RESPONSE_BODY_SIZE => {
            let suffix = "... (truncated)";
            let truncated = String::from_utf8_lossy(&bytes[..MAX_AUDIT_SIZE - suffix.len()]);
            format!("{truncated}{suffix}")
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::warn!("failed to read response body: {}", e);
            format!("[failed to read response body: {e}]")
        },
    };

    DeliveryResponse { status_code, headers, body, duration, is_success }
}

pub(crate) fn to_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(key, value)| value.to_str().ok().map(|v| (key.to_string(), v.to_string())))
        .collect()
}

/// Hop-by-hop and transport headers the client sets itself.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Extracts the Retry-After delay from response headers.
///
/// Supports both the seconds format and the HTTP-date format. An unparsable
/// header yields 60 seconds.
pub fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<u64> {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    let retry_after = headers.get("retry-after").or_else(|| headers.get("Retry-After"))?;

    if let Ok(seconds) = retry_after.trim().parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let remaining = date_time.with_timezone(&chrono::Utc) - chrono::Utc::now();
        return Some(remaining.to_std().map(|d| d.as_secs()).unwrap_or(0));
    }

    Some(DEFAULT_RETRY_AFTER)
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request(url: String) -> DeliveryRequest {
        let mut headers = HashMap::new();
        headers.insert("X-Target-Header".to_string(), "test-value".to_string());

        DeliveryRequest {
            route_id: RouteId::new(),
            tenant_id: TenantId::new(),
            event_id: Some(EventId::new()),
            url,
            method: HttpMethod::Post,
            headers,
            body: Bytes::from(r#"{"id":1}"#),
            timeout: Duration::from_secs(5),
            attempt_number: 1,
        }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::body_json(serde_json::json!({"id": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(request(format!("{}/hook", mock_server.uri()))).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert!(response.is_success);
        assert_eq!(response.body, "OK");
        assert!(response.into_result().is_ok());
    }

    #[tokio::test]
    async fn uses_target_method() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let mut put = request(mock_server.uri());
        put.method = HttpMethod::Put;

        assert!(client.deliver(put).await.unwrap().is_success);
    }

    #[tokio::test]
    async fn non_success_statuses_are_classified() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&mock_server)
            .await;
        Mock::given(matchers::path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;
        Mock::given(matchers::path("/busy"))
            .respond_with(ResponseTemplate::new(429).append_header("Retry-After", "120"))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let classify = |path: &'static str| {
            let client = client.clone();
            let url = format!("{}{path}", mock_server.uri());
            async move { client.deliver(request(url)).await.unwrap().into_result().unwrap_err() }
        };

        let missing = classify("/missing").await;
        assert!(matches!(missing, DeliveryError::ClientError { status_code: 404, .. }));
        assert!(!missing.is_retryable());

        let broken = classify("/broken").await;
        assert!(matches!(broken, DeliveryError::ServerError { status_code: 503, .. }));
        assert!(broken.is_retryable());

        let busy = classify("/busy").await;
        assert_eq!(busy.retry_after_seconds(), Some(120));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let mut slow = request(mock_server.uri());
        slow.timeout = Duration::from_millis(100);

        let error = client.deliver(slow).await.unwrap_err();
        assert!(matches!(error, DeliveryError::Timeout { .. }));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let client = DeliveryClient::with_defaults().unwrap();

        let error = client.deliver(request("http://127.0.0.1:1/hook".to_string())).await.unwrap_err();

        assert!(matches!(error, DeliveryError::NetworkError { .. }));
    }

    #[tokio::test]
    async fn routing_headers_added_and_target_headers_kept() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header_exists("X-Courier-Route-Id"))
            .and(matchers::header_exists("X-Courier-Tenant-Id"))
            .and(matchers::header_exists("X-Courier-Event-Id"))
            .and(matchers::header("X-Courier-Attempt", "1"))
            .and(matchers::header("X-Target-Header", "test-value"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        assert!(client.deliver(request(mock_server.uri())).await.unwrap().is_success);
    }

    #[test]
    fn retry_after_parsing() {
        let mut headers = HashMap::new();

        headers.insert("retry-after".to_string(), "120".to_string());
        assert_eq!(extract_retry_after_seconds(&headers), Some(120));

        headers.clear();
        assert_eq!(extract_retry_after_seconds(&headers), None);

        headers.insert("retry-after".to_string(), "invalid".to_string());
        assert_eq!(extract_retry_after_seconds(&headers), Some(60));
    }

    #[test]
    fn managed_headers_identified() {
        assert!(is_managed_header("Content-Length"));
        assert!(is_managed_header("HOST"));
        assert!(!is_managed_header("Authorization"));
        assert!(!is_managed_header("X-Custom-Header"));
    }
}
