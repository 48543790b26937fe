//! Per-route circuit breaker over a persistent failure counter.
//!
//! ```text
//!      ┌──────────────┐   threshold consecutive   ┌──────────────┐
//!      │    CLOSED    │ ────── failures ────────▶ │     OPEN     │
//!      │ all allowed  │                           │ all skipped  │
//!      └──────────────┘ ◀── success / manual ──── └──────────────┘
//!             ▲                 reset                   │
//!             │                                         │ half_open_after
//!             │ probe succeeds                          ▼ (when enabled)
//!             │                                 ┌──────────────┐
//!             └──────────────────────────────── │  HALF-OPEN   │
//!                                               │  one probe   │
//!                                               └──────────────┘
//!                                                       │ probe fails
//!                                                       ▼
//!                                                  back to OPEN
//! ```
//!
//! The counter lives in shared storage and is only changed by atomic
//! increment or reset. Without `half_open_after` an open route stays open
//! until an operator resets it.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{models::RouteId, Clock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{error::Result, storage::DeliveryStorage};

/// Circuit breaker configuration for all routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Number of consecutive failures that opens the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before one probe request is allowed.
    /// `None` keeps open circuits open until reset.
    pub half_open_after: Option<Duration>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, half_open_after: None }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all requests allowed.
    Closed,
    /// Route disabled - requests skipped.
    Open,
    /// Probe window - one request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Answer to "may this route be called now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPermit {
    /// Circuit closed.
    Allowed,
    /// Circuit half-open and this caller holds the single probe.
    Probe,
    /// Circuit open.
    Blocked {
        /// Current failure count.
        consecutive_failures: u32,
    },
}

impl CircuitPermit {
    /// Returns true unless the circuit blocks the call.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Blocked { .. })
    }
}

/// Snapshot of a route's circuit for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    /// Derived state.
    pub state: CircuitState,
    /// Failures since the last success or reset.
    pub consecutive_failures: u32,
    /// Most recent failure.
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Result of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRecorded {
    /// Counter after the increment.
    pub consecutive_failures: u32,
    /// True when this failure crossed the threshold.
    pub tripped: bool,
}

/// Circuit breaker shared by every worker.
#[derive(Clone)]
pub struct CircuitBreaker {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
    config: CircuitConfig,
    probes: Arc<Mutex<HashSet<RouteId>>>,
}

impl CircuitBreaker {
    /// Creates a circuit breaker over `storage`.
    pub fn new(storage: Arc<dyn DeliveryStorage>, clock: Arc<dyn Clock>, config: CircuitConfig) -> Self {
        Self { storage, clock, config, probes: Arc::new(Mutex::new(HashSet::new())) }
    }

    /// Active configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Decides whether `route_id` may be called.
    ///
    /// A `Probe` permit must be settled with `record_success`,
    /// `record_failure` or `release`.
    ///
    /// # Errors
    ///
    /// Returns error if the failure counter cannot be read.
    pub async fn check(&self, route_id: RouteId) -> Result<CircuitPermit> {
        let counter = self.storage.failure_counter(route_id).await?;

        if counter.consecutive_failures < self.config.failure_threshold {
            return Ok(CircuitPermit::Allowed);
        }

        if self.probe_due(counter.last_failure_at) {
            let mut probes = self.probes.lock().await;
            if probes.insert(route_id) {
                debug!(route_id = %route_id, "circuit half-open, allowing probe");
                return Ok(CircuitPermit::Probe);
            }
        }

        Ok(CircuitPermit::Blocked { consecutive_failures: counter.consecutive_failures })
    }

    /// Resets the counter after a successful delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the counter cannot be reset.
    pub async fn record_success(&self, route_id: RouteId) -> Result<()> {
        self.storage.reset_failures(route_id).await?;
        self.probes.lock().await.remove(&route_id);
        Ok(())
    }

    /// Counts an endpoint failure.
    ///
    /// # Errors
    ///
    /// Returns error if the counter cannot be incremented.
    pub async fn record_failure(&self, route_id: RouteId) -> Result<FailureRecorded> {
        let consecutive_failures =
            self.storage.increment_failures(route_id, self.clock.now_utc()).await?;
        self.probes.lock().await.remove(&route_id);

        let tripped = consecutive_failures == self.config.failure_threshold;
        if tripped {
            warn!(
                route_id = %route_id,
                consecutive_failures,
                "circuit opened, route disabled until reset"
            );
        }

        Ok(FailureRecorded { consecutive_failures, tripped })
    }

    /// Gives back a probe permit without an endpoint outcome.
    pub async fn release(&self, route_id: RouteId) {
        self.probes.lock().await.remove(&route_id);
    }

    /// Reports the circuit of `route_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the counter cannot be read.
    pub async fn status(&self, route_id: RouteId) -> Result<CircuitStatus> {
        let counter = self.storage.failure_counter(route_id).await?;

        let state = if counter.consecutive_failures < self.config.failure_threshold {
            CircuitState::Closed
        } else if self.probe_due(counter.last_failure_at) {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        };

        Ok(CircuitStatus {
            state,
            consecutive_failures: counter.consecutive_failures,
            last_failure_at: counter.last_failure_at,
        })
    }

    /// Manually re-enables a route.
    ///
    /// # Errors
    ///
    /// Returns error if the counter cannot be reset.
    pub async fn reset(&self, route_id: RouteId) -> Result<()> {
        self.record_success(route_id).await
    }

    fn probe_due(&self, last_failure_at: Option<DateTime<Utc>>) -> bool {
        let Some(after) = self.config.half_open_after else {
            return false;
        };
        let Ok(after) = chrono::Duration::from_std(after) else {
            return false;
        };

        last_failure_at.is_none_or(|at| at + after <= self.clock.now_utc())
    }
}
