//! Route configuration as the configuration subsystem stores it.
//!
//! Routes arrive as JSON columns; these tests pin the wire shape of the
//! nested configuration so stored rows keep decoding.

use courier_core::models::{
    AuthConfig, DataSourceConfig, DeliveryOrigin, Direction, DlqStatus, HttpMethod,
    OutcomeStatus, Schedule, Target, TenantScope, TransformConfig,
};
use serde_json::json;

#[test]
fn target_defaults_to_post_passthrough() {
    let target: Target = serde_json::from_value(json!({"url": "https://hooks.example.com"})).unwrap();

    assert_eq!(target.method, HttpMethod::Post);
    assert!(target.headers.is_empty());
    assert_eq!(target.transform, TransformConfig::Passthrough);
}

#[test]
fn auth_config_is_tagged_by_type() {
    let auth: AuthConfig = serde_json::from_value(json!({
        "type": "api_key",
        "header": "X-Api-Key",
        "value": "secret"
    }))
    .unwrap();

    assert_eq!(
        auth,
        AuthConfig::ApiKey { header: "X-Api-Key".to_string(), value: "secret".to_string() }
    );
    assert_eq!(serde_json::from_value::<AuthConfig>(json!({"type": "none"})).unwrap(), AuthConfig::None);
}

#[test]
fn template_transform_keeps_pointer_map() {
    let transform: TransformConfig = serde_json::from_value(json!({
        "type": "template",
        "fields": {"amount": "/order/total", "customer": "/order/customer/id"}
    }))
    .unwrap();

    let TransformConfig::Template { fields } = transform else {
        panic!("expected template transform");
    };
    assert_eq!(fields.get("amount").map(String::as_str), Some("/order/total"));
    assert_eq!(fields.len(), 2);
}

#[test]
fn scope_fields_are_optional() {
    let scope: TenantScope = serde_json::from_value(json!({"include_children": true})).unwrap();

    assert!(scope.include_children);
    assert!(scope.included_tenants.is_empty());
    assert!(scope.excluded_tenants.is_empty());
}

#[test]
fn http_data_source_defaults_to_get() {
    let source: DataSourceConfig = serde_json::from_value(json!({
        "type": "http",
        "url": "http://reports.internal/daily?tenant={{tenant_id}}"
    }))
    .unwrap();

    let DataSourceConfig::Http { method, body, .. } = source else {
        panic!("expected http data source");
    };
    assert_eq!(method, HttpMethod::Get);
    assert!(body.is_none());
}

#[test]
fn interval_schedule_parses() {
    let schedule: Schedule =
        serde_json::from_value(json!({"type": "interval", "seconds": 900})).unwrap();
    assert_eq!(schedule, Schedule::Interval { seconds: 900 });
}

#[test]
fn storage_strings_match_serde_names() {
    assert_eq!(serde_json::to_value(DlqStatus::PendingRetry).unwrap(), json!("pending_retry"));
    assert_eq!(serde_json::to_value(OutcomeStatus::CircuitOpen).unwrap(), json!("circuit_open"));
    assert_eq!(serde_json::to_value(DeliveryOrigin::DlqReplay).unwrap(), json!("dlq_replay"));
    assert_eq!(serde_json::to_value(Direction::Scheduled).unwrap(), json!("scheduled"));

    assert_eq!(DlqStatus::PendingRetry.as_str(), "pending_retry");
    assert_eq!(OutcomeStatus::CircuitOpen.as_str(), "circuit_open");
    assert_eq!(DeliveryOrigin::DlqReplay.as_str(), "dlq_replay");
}

#[test]
fn skip_statuses_are_resource_exhaustion() {
    assert!(OutcomeStatus::RateLimited.is_skip());
    assert!(OutcomeStatus::CircuitOpen.is_skip());
    assert!(!OutcomeStatus::Failed.is_skip());
    assert!(!OutcomeStatus::Success.is_skip());
}
