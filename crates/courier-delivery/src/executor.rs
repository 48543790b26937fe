//! Delivery executor shared by every worker.
//!
//! One call delivers one payload to one target of a route:
//!
//! 1. rate limiter: over the window, record `rate_limited` and stop
//! 2. circuit breaker: open, record `circuit_open` and stop
//! 3. transform, then auth headers
//! 4. HTTP send with immediate retries and backoff
//! 5. classify, update the failure counter, dead-letter, record the outcome
//!
//! Skips never reach the endpoint and never touch the failure counter.
//! Collaborator outages surface as `Err` so the calling worker holds its
//! cursor and retries the item later.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{
    events::{DeliveryContext, DeliveryEvent, EventHandler},
    models::{
        DeliveryOrigin, DlqEntry, DlqEntryId, DlqStatus, EventId, OutcomeRecord, OutcomeStatus,
        Route, Target, TenantId,
    },
    Clock,
};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    circuit::{CircuitBreaker, CircuitPermit},
    client::{DeliveryClient, DeliveryRequest},
    collaborators::{AuthProvider, Transformer},
    error::{DeliveryError, Result},
    rate_limit::RateLimiter,
    retry::{RetryContext, RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
};

/// Whether failures create dead-letter entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// First delivery; an exhausted failure is dead-lettered.
    Live,
    /// Dead-letter retry cycle; the caller owns the existing entry.
    Replay,
}

/// One payload bound for one route target.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Route delivered through.
    pub route: Route,
    /// Multi-step index; `None` for the primary target.
    pub step_index: Option<usize>,
    /// Tenant the delivery is for.
    pub tenant_id: TenantId,
    /// Payload before the target transform.
    pub payload: Value,
    /// Upstream event, if any.
    pub event_id: Option<EventId>,
    /// Producing worker.
    pub origin: DeliveryOrigin,
    /// Live or replay.
    pub mode: DispatchMode,
    /// Skip the target transform; the producer already applied one.
    pub pre_transformed: bool,
}

impl Dispatch {
    /// Live dispatch to the primary target.
    pub fn live(route: Route, tenant_id: TenantId, payload: Value, origin: DeliveryOrigin) -> Self {
        Self {
            route,
            step_index: None,
            tenant_id,
            payload,
            event_id: None,
            origin,
            mode: DispatchMode::Live,
            pre_transformed: false,
        }
    }

    /// Replays a dead-letter entry through `route`.
    pub fn replay(route: Route, entry: &DlqEntry) -> Self {
        Self {
            route,
            step_index: entry.step(),
            tenant_id: entry.tenant_id,
            payload: entry.payload.clone(),
            event_id: entry.event_id,
            origin: entry.origin,
            mode: DispatchMode::Replay,
            pre_transformed: entry.pre_transformed,
        }
    }

    /// Sets the upstream event.
    #[must_use]
    pub fn with_event(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    /// Targets a multi-step index.
    #[must_use]
    pub fn with_step(mut self, step_index: Option<usize>) -> Self {
        self.step_index = step_index;
        self
    }

    /// Marks the payload as already transformed.
    #[must_use]
    pub fn pre_transformed(mut self) -> Self {
        self.pre_transformed = true;
        self
    }
}

/// Result of one executor call.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// Endpoint accepted the delivery.
    Delivered {
        /// Attempts made.
        attempts: u32,
        /// Final HTTP status.
        status_code: u16,
    },
    /// Skipped: over the route's rate limit.
    RateLimited {
        /// Start of the next window.
        reset_at: DateTime<Utc>,
    },
    /// Skipped: route circuit open.
    CircuitOpen {
        /// Failure counter at the time of the skip.
        consecutive_failures: u32,
    },
    /// Delivery failed and its outcome is recorded.
    Failed {
        /// Final error.
        error: DeliveryError,
        /// Attempts made; zero when the transform or auth step failed.
        attempts: u32,
        /// Whether a later retry may succeed.
        retryable: bool,
        /// Entry created in live mode.
        dead_letter: Option<DlqEntryId>,
    },
}

impl DeliveryOutcome {
    /// Recorded status.
    pub fn status(&self) -> OutcomeStatus {
        match self {
            Self::Delivered { .. } => OutcomeStatus::Success,
            Self::RateLimited { .. } => OutcomeStatus::RateLimited,
            Self::CircuitOpen { .. } => OutcomeStatus::CircuitOpen,
            Self::Failed { .. } => OutcomeStatus::Failed,
        }
    }

    /// Returns true when the endpoint accepted the delivery.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    /// Returns true for rate-limit and circuit skips.
    pub fn is_skip(&self) -> bool {
        self.status().is_skip()
    }
}

struct Attempted {
    result: std::result::Result<u16, DeliveryError>,
    attempts: u32,
}

/// Delivers payloads to route targets.
#[derive(Clone)]
pub struct DeliveryExecutor {
    storage: Arc<dyn DeliveryStorage>,
    client: DeliveryClient,
    rate_limiter: RateLimiter,
    circuit: CircuitBreaker,
    transformer: Arc<dyn Transformer>,
    auth: Arc<dyn AuthProvider>,
    events: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    immediate_policy: RetryPolicy,
    dlq_policy: RetryPolicy,
}

impl std::fmt::Debug for DeliveryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryExecutor")
            .field("immediate_policy", &self.immediate_policy)
            .field("dlq_policy", &self.dlq_policy)
            .finish_non_exhaustive()
    }
}

/// Collaborators and policies for a [`DeliveryExecutor`].
#[derive(Clone)]
pub struct ExecutorParts {
    /// Shared storage.
    pub storage: Arc<dyn DeliveryStorage>,
    /// HTTP client.
    pub client: DeliveryClient,
    /// Rate limiter.
    pub rate_limiter: RateLimiter,
    /// Circuit breaker.
    pub circuit: CircuitBreaker,
    /// Transform collaborator.
    pub transformer: Arc<dyn Transformer>,
    /// Auth collaborator.
    pub auth: Arc<dyn AuthProvider>,
    /// Lifecycle signal bus.
    pub events: Arc<dyn EventHandler>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Backoff between immediate attempts. `max_attempts` is replaced by the
    /// route's `retry_count`.
    pub immediate_policy: RetryPolicy,
    /// Backoff between dead-letter cycles. `max_attempts` is replaced by the
    /// entry's `max_retries`.
    pub dlq_policy: RetryPolicy,
}

impl DeliveryExecutor {
    /// Creates an executor.
    pub fn new(parts: ExecutorParts) -> Self {
        Self {
            storage: parts.storage,
            client: parts.client,
            rate_limiter: parts.rate_limiter,
            circuit: parts.circuit,
            transformer: parts.transformer,
            auth: parts.auth,
            events: parts.events,
            clock: parts.clock,
            immediate_policy: parts.immediate_policy,
            dlq_policy: parts.dlq_policy,
        }
    }

    /// Replaces the transform collaborator.
    #[must_use]
    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Replaces the auth collaborator.
    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    /// Replaces the signal bus.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    /// Signal bus used by this executor.
    pub fn events(&self) -> &Arc<dyn EventHandler> {
        &self.events
    }

    /// Circuit breaker used by this executor.
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Rate limiter used by this executor.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Transform collaborator used by this executor.
    pub fn transformer(&self) -> &Arc<dyn Transformer> {
        &self.transformer
    }

    /// Dead-letter backoff policy.
    pub fn dlq_policy(&self) -> &RetryPolicy {
        &self.dlq_policy
    }

    /// Delivers `dispatch` and records its outcome.
    ///
    /// # Errors
    ///
    /// Returns error when storage is unreachable or a collaborator is
    /// unavailable. No outcome is recorded in that case and the caller
    /// should retry the item later.
    pub async fn execute(&self, dispatch: Dispatch) -> Result<DeliveryOutcome> {
        let started = self.clock.now();
        let route_id = dispatch.route.id;

        let target = dispatch.route.target_for(dispatch.step_index).cloned().ok_or_else(|| {
            DeliveryError::configuration(format!(
                "route {route_id} has no step {:?}",
                dispatch.step_index
            ))
        })?;

        if let Some(policy) = dispatch.route.rate_limit {
            let decision = self.rate_limiter.check(route_id, dispatch.tenant_id, &policy).await?;
            if !decision.allowed {
                let outcome = DeliveryOutcome::RateLimited { reset_at: decision.reset_at };
                self.finish(&dispatch, &target, outcome.clone(), 0, started).await?;
                return Ok(outcome);
            }
        }

        let permit = self.circuit.check(route_id).await?;
        if let CircuitPermit::Blocked { consecutive_failures } = permit {
            debug!(route_id = %route_id, consecutive_failures, "circuit open, skipping delivery");
            let outcome = DeliveryOutcome::CircuitOpen { consecutive_failures };
            self.finish(&dispatch, &target, outcome.clone(), 0, started).await?;
            return Ok(outcome);
        }

        let attempted = match self.prepare_and_send(&dispatch, &target).await {
            Ok(attempted) => attempted,
            Err(error) => {
                if permit == CircuitPermit::Probe {
                    self.circuit.release(route_id).await;
                }
                return Err(error);
            },
        };

        let outcome = match attempted.result {
            Ok(status_code) => {
                self.circuit.record_success(route_id).await?;
                DeliveryOutcome::Delivered { attempts: attempted.attempts, status_code }
            },
            Err(error) => {
                self.settle_failure(&dispatch, &target, error, attempted.attempts, permit).await?
            },
        };

        self.finish(&dispatch, &target, outcome.clone(), attempted.attempts, started).await?;
        Ok(outcome)
    }

    /// Delivers every target of the route in order.
    ///
    /// Single-target routes make one call. Multi-step routes wait
    /// `step_delay_ms` between steps, send each step the original payload and
    /// stop at the first step that does not succeed, whose outcome is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the first step error; earlier steps keep their recorded
    /// outcomes.
    pub async fn execute_route(&self, dispatch: Dispatch) -> Result<DeliveryOutcome> {
        let steps: Vec<Option<usize>> =
            dispatch.route.delivery_targets().into_iter().map(|(index, _)| index).collect();
        let step_delay = Duration::from_millis(dispatch.route.step_delay_ms);
        let mut last = None;

        for (position, step_index) in steps.into_iter().enumerate() {
            if position > 0 && !step_delay.is_zero() {
                self.clock.sleep(step_delay).await;
            }

            let outcome = self.execute(dispatch.clone().with_step(step_index)).await?;
            if !outcome.is_success() {
                if step_index.is_some() {
                    debug!(
                        route_id = %dispatch.route.id,
                        step = position,
                        status = %outcome.status(),
                        "step did not succeed, aborting remaining steps"
                    );
                }
                return Ok(outcome);
            }
            last = Some(outcome);
        }

        last.ok_or_else(|| DeliveryError::configuration("route has no delivery targets"))
    }

    /// Runs transform, auth and the attempt loop. Terminal collaborator
    /// failures become a failed attempt; outages become `Err`.
    async fn prepare_and_send(&self, dispatch: &Dispatch, target: &Target) -> Result<Attempted> {
        let payload = if dispatch.pre_transformed {
            dispatch.payload.clone()
        } else {
            match self.transformer.transform(dispatch.payload.clone(), &target.transform).await {
                Ok(payload) => payload,
                Err(error) => return terminal_or_outage(error.into()),
            }
        };

        let mut headers = target.headers.clone();
        match self.auth.headers(&dispatch.route.auth).await {
            Ok(auth_headers) => headers.extend(auth_headers),
            Err(error) => return terminal_or_outage(error.into()),
        }

        let body = serde_json::to_vec(&payload)
            .map(Bytes::from)
            .map_err(|e| DeliveryError::internal(format!("payload serialization failed: {e}")))?;

        Ok(self.send_with_retries(dispatch, target, headers, body).await)
    }

    async fn send_with_retries(
        &self,
        dispatch: &Dispatch,
        target: &Target,
        headers: std::collections::HashMap<String, String>,
        body: Bytes,
    ) -> Attempted {
        let retry = &dispatch.route.retry;
        let policy = self.immediate_policy.with_max_attempts(retry.retry_count.max(1));
        let timeout = Duration::from_secs(retry.timeout_seconds.max(1));
        let mut attempt_number = 0;

        loop {
            attempt_number += 1;
            let request = DeliveryRequest {
                route_id: dispatch.route.id,
                tenant_id: dispatch.tenant_id,
                event_id: dispatch.event_id,
                url: target.url.clone(),
                method: target.method,
                headers: headers.clone(),
                body: body.clone(),
                timeout,
                attempt_number,
            };

            let error = match self.client.deliver(request).await.and_then(|r| r.into_result()) {
                Ok(response) => {
                    return Attempted { result: Ok(response.status_code), attempts: attempt_number };
                },
                Err(error) => error,
            };

            let context =
                RetryContext::new(attempt_number, error.clone(), self.clock.now_utc(), policy.clone());
            match context.decide_retry() {
                RetryDecision::Retry { delay, .. } => {
                    debug!(
                        route_id = %dispatch.route.id,
                        attempt = attempt_number,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "attempt failed, retrying"
                    );
                    self.clock.sleep(delay).await;
                },
                RetryDecision::GiveUp { reason } => {
                    debug!(route_id = %dispatch.route.id, attempt = attempt_number, %reason, "giving up");
                    return Attempted { result: Err(error), attempts: attempt_number };
                },
            }
        }
    }

    async fn settle_failure(
        &self,
        dispatch: &Dispatch,
        target: &Target,
        error: DeliveryError,
        attempts: u32,
        permit: CircuitPermit,
    ) -> Result<DeliveryOutcome> {
        let route_id = dispatch.route.id;
        let now = self.clock.now_utc();

        if error.counts_toward_circuit() {
            let recorded = self.circuit.record_failure(route_id).await?;
            if recorded.tripped {
                self.events
                    .handle_event(DeliveryEvent::CircuitOpened {
                        route_id,
                        consecutive_failures: recorded.consecutive_failures,
                        opened_at: now,
                    })
                    .await;
            }
        } else if permit == CircuitPermit::Probe {
            self.circuit.release(route_id).await;
        }

        let retryable = error.is_retryable();
        let dead_letter = match dispatch.mode {
            DispatchMode::Replay => None,
            DispatchMode::Live => {
                let entry = self.dead_letter_entry(dispatch, &error, retryable, now)?;
                let entry_id = self.storage.create_dlq_entry(entry).await?;
                info!(
                    route_id = %route_id,
                    tenant_id = %dispatch.tenant_id,
                    dlq_entry_id = %entry_id,
                    retryable,
                    "delivery dead-lettered"
                );
                self.events
                    .handle_event(DeliveryEvent::DeadLettered {
                        context: self.context(dispatch, target, attempts),
                        entry_id,
                    })
                    .await;
                Some(entry_id)
            },
        };

        Ok(DeliveryOutcome::Failed { error, attempts, retryable, dead_letter })
    }

    fn dead_letter_entry(
        &self,
        dispatch: &Dispatch,
        error: &DeliveryError,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<DlqEntry> {
        let first_delay = chrono::Duration::from_std(self.dlq_policy.delay_for(1))
            .map_err(|e| DeliveryError::internal(format!("dead-letter delay out of range: {e}")))?;
        let max_retries = i32::try_from(dispatch.route.retry.dlq_max_retries).unwrap_or(i32::MAX);

        Ok(DlqEntry {
            id: DlqEntryId::new(),
            route_id: dispatch.route.id,
            tenant_id: dispatch.tenant_id,
            event_id: dispatch.event_id,
            step_index: dispatch.step_index.and_then(|i| i32::try_from(i).ok()),
            origin: dispatch.origin,
            payload: dispatch.payload.clone(),
            pre_transformed: dispatch.pre_transformed,
            attempt_count: 0,
            max_retries,
            retryable,
            status: if retryable { DlqStatus::PendingRetry } else { DlqStatus::Abandoned },
            last_error: Some(error.to_string()),
            next_retry_at: now + first_delay,
            created_at: now,
            updated_at: now,
        })
    }

    /// Appends the outcome record and publishes the matching signal.
    async fn finish(
        &self,
        dispatch: &Dispatch,
        target: &Target,
        outcome: DeliveryOutcome,
        attempts: u32,
        started: std::time::Instant,
    ) -> Result<()> {
        let status = outcome.status();
        let (http_status, error) = match &outcome {
            DeliveryOutcome::Delivered { status_code, .. } => (Some(*status_code), None),
            DeliveryOutcome::Failed { error, .. } => (error.status_code(), Some(error.to_string())),
            DeliveryOutcome::RateLimited { .. } | DeliveryOutcome::CircuitOpen { .. } => (None, None),
        };

        let record = OutcomeRecord {
            id: Uuid::new_v4(),
            route_id: dispatch.route.id,
            tenant_id: dispatch.tenant_id,
            event_id: dispatch.event_id,
            step_index: dispatch.step_index.and_then(|i| i32::try_from(i).ok()),
            origin: dispatch.origin,
            status,
            attempts,
            http_status,
            error,
            duration_ms: u64::try_from(self.clock.now().duration_since(started).as_millis())
                .unwrap_or(u64::MAX),
            recorded_at: self.clock.now_utc(),
        };
        self.storage.record_outcome(record).await?;

        let context = self.context(dispatch, target, attempts);
        let event = match outcome {
            DeliveryOutcome::Delivered { .. } => DeliveryEvent::Succeeded(context),
            DeliveryOutcome::RateLimited { .. } | DeliveryOutcome::CircuitOpen { .. } => {
                DeliveryEvent::Skipped { context, reason: status }
            },
            DeliveryOutcome::Failed { error, retryable, .. } => {
                warn!(
                    route_id = %dispatch.route.id,
                    tenant_id = %dispatch.tenant_id,
                    attempts,
                    category = %error.category(),
                    error = %error,
                    "delivery failed"
                );
                DeliveryEvent::Failed { context, error: error.to_string(), retryable }
            },
        };
        self.events.handle_event(event).await;
        Ok(())
    }

    fn context(&self, dispatch: &Dispatch, target: &Target, attempts: u32) -> DeliveryContext {
        DeliveryContext {
            route_id: dispatch.route.id,
            tenant_id: dispatch.tenant_id,
            event_id: dispatch.event_id,
            url: target.url.clone(),
            attempts,
            at: self.clock.now_utc(),
        }
    }
}

fn terminal_or_outage(error: DeliveryError) -> Result<Attempted> {
    match error {
        DeliveryError::CollaboratorUnavailable { .. } => Err(error),
        terminal => Ok(Attempted { result: Err(terminal), attempts: 0 }),
    }
}
