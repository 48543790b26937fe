//! Property tests for backoff, rate-limit windows, dedup keys and tenant
//! scoping.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use courier_core::models::{
    AuthConfig, Direction, RetrySettings, Route, RouteId, Target, TenantId, TenantScope,
};
use courier_delivery::{
    dedup::DedupKey,
    rate_limit::window_start,
    retry::{apply_jitter, RetryPolicy},
    scope::{route_matches, TenantChain},
};
use proptest::prelude::*;
use serde_json::json;

fn route(tenant_id: TenantId, include_children: bool) -> Route {
    Route {
        id: RouteId::new(),
        tenant_id,
        name: "prop".into(),
        direction: Direction::Push,
        event_types: Vec::new(),
        scope: TenantScope { include_children, ..TenantScope::default() },
        target: Target::post("http://localhost"),
        auth: AuthConfig::None,
        retry: RetrySettings::default(),
        rate_limit: None,
        steps: Vec::new(),
        step_delay_ms: 0,
        schedule: None,
        data_source: None,
        active: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

proptest! {
    #[test]
    fn backoff_is_monotonic_and_capped(attempt in 1u32..64) {
        let policy = RetryPolicy::immediate(100);

        let current = policy.nominal_delay(attempt);
        let next = policy.nominal_delay(attempt + 1);

        prop_assert!(next >= current);
        prop_assert!(current <= Duration::from_secs(5));
        prop_assert!(current >= Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_factor(millis in 1u64..3_600_000, factor in 0.0f64..1.0) {
        let base = Duration::from_millis(millis);

        let jittered = apply_jitter(base, factor).as_secs_f64();
        let spread = base.as_secs_f64() * factor;

        prop_assert!(jittered >= base.as_secs_f64() - spread - 1e-6);
        prop_assert!(jittered <= base.as_secs_f64() + spread + 1e-6);
    }

    #[test]
    fn window_start_contains_now(seconds in 0i64..4_000_000_000, window in 1u32..86_400) {
        let now = Utc.timestamp_opt(seconds, 0).unwrap();

        let start = window_start(now, window);

        prop_assert!(start <= now);
        prop_assert!(now < start + chrono::Duration::seconds(i64::from(window)));
        prop_assert_eq!(start.timestamp() % i64::from(window), 0);
    }

    #[test]
    fn dedup_key_ignores_object_key_order(a in any::<i64>(), b in "[a-z]{0,12}") {
        let tenant = TenantId::new();
        let first = json!({"a": a, "b": b});
        let second: serde_json::Value =
            serde_json::from_str(&format!(r#"{{"b": {}, "a": {a}}}"#, serde_json::to_string(&b).unwrap()))
                .unwrap();

        prop_assert_eq!(
            DedupKey::new(tenant, "order.created", &first),
            DedupKey::new(tenant, "order.created", &second)
        );
    }

    #[test]
    fn descendants_match_only_with_include_children(depth in 1usize..6) {
        let ancestors: Vec<TenantId> = (0..depth).map(|_| TenantId::new()).collect();
        let chain = TenantChain::new(TenantId::new(), ancestors.clone());
        let owner = *ancestors.last().unwrap();

        prop_assert!(route_matches(&route(owner, true), &chain, "any", Direction::Push));
        prop_assert!(!route_matches(&route(owner, false), &chain, "any", Direction::Push));
        prop_assert!(!route_matches(&route(TenantId::new(), true), &chain, "any", Direction::Push));
    }
}
