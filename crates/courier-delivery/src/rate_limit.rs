//! Fixed-window rate limiting per route and tenant.
//!
//! The window containing `now` starts at `floor(now / size) * size`, so every
//! caller derives the same window without coordination. The storage
//! increment returns the post-increment count in one atomic step; a request
//! is allowed when that count is within the policy.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use courier_core::{
    models::{RateLimitPolicy, RouteId, TenantId},
    Clock,
};
use serde::Serialize;
use tracing::debug;

use crate::{error::Result, storage::DeliveryStorage};

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window after this one.
    pub remaining: u32,
    /// Requests counted in the current window, this one included.
    pub count: u32,
    /// Start of the next window.
    pub reset_at: DateTime<Utc>,
}

/// Start of the window containing `now` for a window of `window_seconds`.
///
/// A zero-length window is treated as one second.
pub fn window_start(now: DateTime<Utc>, window_seconds: u32) -> DateTime<Utc> {
    let size = i64::from(window_seconds.max(1));
    let start = now.timestamp().div_euclid(size) * size;
    Utc.timestamp_opt(start, 0).single().unwrap_or(now)
}

/// Per-route, per-tenant fixed-window limiter backed by shared storage.
#[derive(Clone)]
pub struct RateLimiter {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter over `storage`.
    pub fn new(storage: Arc<dyn DeliveryStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Counts one request and decides whether it may proceed.
    ///
    /// # Errors
    ///
    /// Returns error if the counter cannot be incremented.
    pub async fn check(
        &self,
        route_id: RouteId,
        tenant_id: TenantId,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitDecision> {
        let start = window_start(self.clock.now_utc(), policy.window_seconds);
        let count = self.storage.increment_rate_window(route_id, tenant_id, start).await?;
        let decision = decide(count, start, policy);

        if !decision.allowed {
            debug!(
                route_id = %route_id,
                tenant_id = %tenant_id,
                count,
                max_requests = policy.max_requests,
                reset_at = %decision.reset_at,
                "rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Reports the current window without counting a request.
    ///
    /// # Errors
    ///
    /// Returns error if the counter cannot be read.
    pub async fn status(
        &self,
        route_id: RouteId,
        tenant_id: TenantId,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitDecision> {
        let start = window_start(self.clock.now_utc(), policy.window_seconds);
        let count = self.storage.rate_window_count(route_id, tenant_id, start).await?;

        Ok(RateLimitDecision {
            allowed: count < policy.max_requests,
            remaining: policy.max_requests.saturating_sub(count),
            count,
            reset_at: reset_at(start, policy),
        })
    }

    /// Clears every window for the pair. Returns the windows removed.
    ///
    /// # Errors
    ///
    /// Returns error if the windows cannot be deleted.
    pub async fn reset(&self, route_id: RouteId, tenant_id: TenantId) -> Result<u64> {
        Ok(self.storage.reset_rate_windows(route_id, tenant_id).await?)
    }
}

fn reset_at(start: DateTime<Utc>, policy: &RateLimitPolicy) -> DateTime<Utc> {
    start + Duration::seconds(i64::from(policy.window_seconds.max(1)))
}

fn decide(count: u32, start: DateTime<Utc>, policy: &RateLimitPolicy) -> RateLimitDecision {
    RateLimitDecision {
        allowed: count <= policy.max_requests,
        remaining: policy.max_requests.saturating_sub(count),
        count,
        reset_at: reset_at(start, policy),
    }
}
