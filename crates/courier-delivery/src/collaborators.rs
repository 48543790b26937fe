//! Transform and auth collaborators.
//!
//! Both are traits so that a scripted transform runtime or an external
//! credential service can be plugged in. The built-in implementations cover
//! every configuration variant that does not need an outside service.

use std::{collections::HashMap, fmt::Debug};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use courier_core::models::{AuthConfig, TransformConfig};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::DeliveryError;

/// Transform failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransformError {
    /// The payload or the transform itself is broken. Never retried.
    #[error("{0}")]
    Rejected(String),
    /// The transform runtime is down or timed out.
    #[error("{0}")]
    Unavailable(String),
}

impl From<TransformError> for DeliveryError {
    fn from(error: TransformError) -> Self {
        match error {
            TransformError::Rejected(message) => DeliveryError::transform(message),
            TransformError::Unavailable(message) => DeliveryError::unavailable("transform", message),
        }
    }
}

/// Auth header failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The route's auth configuration cannot produce headers.
    #[error("{0}")]
    Invalid(String),
    /// The credential service is down or timed out.
    #[error("{0}")]
    Unavailable(String),
}

impl From<AuthError> for DeliveryError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::Invalid(message) => DeliveryError::auth(message),
            AuthError::Unavailable(message) => DeliveryError::unavailable("auth", message),
        }
    }
}

/// Turns an event payload into the body sent to a target.
#[async_trait]
pub trait Transformer: Send + Sync + Debug {
    /// Applies `config` to `payload`.
    async fn transform(
        &self,
        payload: Value,
        config: &TransformConfig,
    ) -> std::result::Result<Value, TransformError>;
}

/// Builds request headers from a route's auth configuration.
#[async_trait]
pub trait AuthProvider: Send + Sync + Debug {
    /// Returns the headers to add to the outbound request.
    async fn headers(
        &self,
        config: &AuthConfig,
    ) -> std::result::Result<HashMap<String, String>, AuthError>;
}

/// Built-in transforms. Scripts need an external runtime and report
/// `Unavailable`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinTransformer;

#[async_trait]
impl Transformer for BuiltinTransformer {
    async fn transform(
        &self,
        payload: Value,
        config: &TransformConfig,
    ) -> std::result::Result<Value, TransformError> {
        match config {
            TransformConfig::Passthrough => Ok(payload),
            TransformConfig::Wrap { key } => {
                if key.is_empty() {
                    return Err(TransformError::Rejected("wrap key must not be empty".into()));
                }
                let mut wrapped = Map::new();
                wrapped.insert(key.clone(), payload);
                Ok(Value::Object(wrapped))
            },
            TransformConfig::Template { fields } => apply_template(&payload, fields),
            TransformConfig::Script { language, .. } => Err(TransformError::Unavailable(format!(
                "no runtime registered for {language} scripts"
            ))),
        }
    }
}

/// Builds an object whose fields are JSON pointers into `payload`.
///
/// A pointer that does not resolve yields `null`. A pointer that is not a
/// valid JSON pointer rejects the payload.
fn apply_template(
    payload: &Value,
    fields: &HashMap<String, String>,
) -> std::result::Result<Value, TransformError> {
    let mut output = Map::new();
    for (name, pointer) in fields {
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(TransformError::Rejected(format!(
                "field {name:?}: {pointer:?} is not a JSON pointer"
            )));
        }
        let value = payload.pointer(pointer).cloned().unwrap_or(Value::Null);
        output.insert(name.clone(), value);
    }
    Ok(Value::Object(output))
}

/// Derives headers directly from the stored configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigAuthProvider;

#[async_trait]
impl AuthProvider for ConfigAuthProvider {
    async fn headers(
        &self,
        config: &AuthConfig,
    ) -> std::result::Result<HashMap<String, String>, AuthError> {
        let mut headers = HashMap::new();
        match config {
            AuthConfig::None => {},
            AuthConfig::Bearer { token } => {
                if token.trim().is_empty() {
                    return Err(AuthError::Invalid("bearer token is empty".into()));
                }
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            },
            AuthConfig::Basic { username, password } => {
                if username.is_empty() {
                    return Err(AuthError::Invalid("basic auth username is empty".into()));
                }
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                headers.insert("Authorization".to_string(), format!("Basic {encoded}"));
            },
            AuthConfig::ApiKey { header, value } => {
                if http::HeaderName::from_bytes(header.as_bytes()).is_err() {
                    return Err(AuthError::Invalid(format!("invalid api key header {header:?}")));
                }
                headers.insert(header.clone(), value.clone());
            },
            AuthConfig::Headers { headers: configured } => {
                for (name, value) in configured {
                    if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                        return Err(AuthError::Invalid(format!("invalid header name {name:?}")));
                    }
                    headers.insert(name.clone(), value.clone());
                }
            },
        }
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn passthrough_and_wrap() {
        let payload = json!({"order": 7});

        let same = BuiltinTransformer
            .transform(payload.clone(), &TransformConfig::Passthrough)
            .await
            .unwrap();
        assert_eq!(same, payload);

        let wrapped = BuiltinTransformer
            .transform(payload, &TransformConfig::Wrap { key: "data".into() })
            .await
            .unwrap();
        assert_eq!(wrapped, json!({"data": {"order": 7}}));
    }

    #[tokio::test]
    async fn template_maps_pointers() {
        let fields = HashMap::from([
            ("total".to_string(), "/order/total".to_string()),
            ("missing".to_string(), "/order/nope".to_string()),
        ]);

        let output = BuiltinTransformer
            .transform(json!({"order": {"total": 12.5}}), &TransformConfig::Template { fields })
            .await
            .unwrap();

        assert_eq!(output, json!({"total": 12.5, "missing": null}));
    }

    #[tokio::test]
    async fn bad_pointer_is_rejected_and_script_unavailable() {
        let fields = HashMap::from([("total".to_string(), "order.total".to_string())]);
        let rejected = BuiltinTransformer
            .transform(json!({}), &TransformConfig::Template { fields })
            .await
            .unwrap_err();
        assert!(matches!(rejected, TransformError::Rejected(_)));
        assert!(!DeliveryError::from(rejected).is_retryable());

        let script = TransformConfig::Script { language: "js".into(), source: "x".into() };
        let unavailable = BuiltinTransformer.transform(json!({}), &script).await.unwrap_err();
        assert!(matches!(
            DeliveryError::from(unavailable),
            DeliveryError::CollaboratorUnavailable { collaborator: "transform", .. }
        ));
    }

    #[tokio::test]
    async fn auth_headers_from_config() {
        let bearer = ConfigAuthProvider
            .headers(&AuthConfig::Bearer { token: "abc".into() })
            .await
            .unwrap();
        assert_eq!(bearer["Authorization"], "Bearer abc");

        let basic = ConfigAuthProvider
            .headers(&AuthConfig::Basic { username: "user".into(), password: "pass".into() })
            .await
            .unwrap();
        assert_eq!(basic["Authorization"], "Basic dXNlcjpwYXNz");

        let key = ConfigAuthProvider
            .headers(&AuthConfig::ApiKey { header: "X-Api-Key".into(), value: "k".into() })
            .await
            .unwrap();
        assert_eq!(key["X-Api-Key"], "k");

        assert!(ConfigAuthProvider.headers(&AuthConfig::None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_auth_is_terminal() {
        let error = ConfigAuthProvider
            .headers(&AuthConfig::ApiKey { header: "bad header".into(), value: "k".into() })
            .await
            .unwrap_err();

        let delivery_error = DeliveryError::from(error);
        assert!(matches!(delivery_error, DeliveryError::AuthError { .. }));
        assert!(!delivery_error.is_retryable());
    }
}
