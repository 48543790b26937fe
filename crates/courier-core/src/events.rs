//! Lifecycle signals published by the delivery engine.
//!
//! The executor and workers publish [`DeliveryEvent`]s to an
//! [`EventHandler`]. Notification, audit and reporting services subscribe
//! without the engine knowing about them.
//!
//! ```text
//! ┌────────────────┐   DeliveryEvent   ┌────────────────────┐
//! │ Executor / DLQ │ ────────────────▶ │ MulticastHandler   │
//! │ workers        │                   └────────────────────┘
//! └────────────────┘                     │        │       │
//!                                        ▼        ▼       ▼
//!                                   alerting   audit   metrics
//! ```
//!
//! `Abandoned` is the alert signal: an entry left the automatic retry path
//! and needs a human.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DlqEntryId, EventId, OutcomeStatus, RouteId, TenantId};

/// Delivery lifecycle signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryEvent {
    /// Endpoint accepted a delivery.
    Succeeded(DeliveryContext),
    /// Delivery failed after its attempt budget.
    Failed {
        /// Delivery context.
        context: DeliveryContext,
        /// Failure description.
        error: String,
        /// Whether the failure may succeed on retry.
        retryable: bool,
    },
    /// Delivery skipped by rate limiting or an open circuit.
    Skipped {
        /// Delivery context.
        context: DeliveryContext,
        /// Skip reason.
        reason: OutcomeStatus,
    },
    /// Dead-letter entry created.
    DeadLettered {
        /// Delivery context.
        context: DeliveryContext,
        /// New entry.
        entry_id: DlqEntryId,
    },
    /// Dead-letter entry abandoned; manual action required.
    Abandoned {
        /// Entry.
        entry_id: DlqEntryId,
        /// Route of the entry.
        route_id: RouteId,
        /// Tenant of the entry.
        tenant_id: TenantId,
        /// Retry cycles completed.
        attempts: i32,
        /// Final failure.
        last_error: Option<String>,
        /// When the entry was abandoned.
        abandoned_at: DateTime<Utc>,
    },
    /// A route crossed its failure threshold.
    CircuitOpened {
        /// Route disabled.
        route_id: RouteId,
        /// Failure count at the time of tripping.
        consecutive_failures: u32,
        /// When the circuit opened.
        opened_at: DateTime<Utc>,
    },
}

impl DeliveryEvent {
    /// Route the signal concerns.
    pub fn route_id(&self) -> RouteId {
        match self {
            Self::Succeeded(context)
            | Self::Failed { context, .. }
            | Self::Skipped { context, .. }
            | Self::DeadLettered { context, .. } => context.route_id,
            Self::Abandoned { route_id, .. } | Self::CircuitOpened { route_id, .. } => *route_id,
        }
    }
}

/// Identity of a delivery shared by most signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryContext {
    /// Route delivered through.
    pub route_id: RouteId,
    /// Tenant delivered for.
    pub tenant_id: TenantId,
    /// Upstream event, if any.
    pub event_id: Option<EventId>,
    /// Target URL.
    pub url: String,
    /// HTTP attempts made.
    pub attempts: u32,
    /// When the signal was produced.
    pub at: DateTime<Utc>,
}

/// Subscriber to delivery signals.
///
/// Implementations must not block delivery processing; failures are logged
/// by the implementation and never propagated back.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Handler that forwards every event to all subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let deliveries = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move { handler.handle_event(event).await }
        });

        futures::future::join_all(deliveries).await;
    }
}

/// Handler that logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

#[async_trait::async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        match &event {
            DeliveryEvent::Abandoned { entry_id, route_id, tenant_id, attempts, last_error, .. } => {
                tracing::error!(
                    entry_id = %entry_id,
                    route_id = %route_id,
                    tenant_id = %tenant_id,
                    attempts,
                    last_error = last_error.as_deref().unwrap_or(""),
                    "dead-letter entry abandoned, manual action required"
                );
            },
            DeliveryEvent::CircuitOpened { route_id, consecutive_failures, .. } => {
                tracing::warn!(
                    route_id = %route_id,
                    consecutive_failures,
                    "route disabled by circuit breaker"
                );
            },
            other => {
                tracing::debug!(route_id = %other.route_id(), event = ?other, "delivery event");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingHandler {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: DeliveryEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn circuit_opened() -> DeliveryEvent {
        DeliveryEvent::CircuitOpened {
            route_id: RouteId::new(),
            consecutive_failures: 5,
            opened_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn multicast_reaches_every_subscriber() {
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());

        let mut multicast = MulticastEventHandler::new();
        multicast.add_subscriber(first.clone());
        multicast.add_subscriber(second.clone());
        assert_eq!(multicast.subscriber_count(), 2);

        multicast.handle_event(circuit_opened()).await;
        multicast.handle_event(circuit_opened()).await;

        assert_eq!(first.count.load(Ordering::SeqCst), 2);
        assert_eq!(second.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_multicast_and_no_op_accept_events() {
        MulticastEventHandler::new().handle_event(circuit_opened()).await;
        NoOpEventHandler::new().handle_event(circuit_opened()).await;
        TracingEventHandler.handle_event(circuit_opened()).await;
    }

    #[test]
    fn route_id_is_available_for_every_variant() {
        let route_id = RouteId::new();
        let event = DeliveryEvent::Abandoned {
            entry_id: DlqEntryId::new(),
            route_id,
            tenant_id: TenantId::new(),
            attempts: 3,
            last_error: None,
            abandoned_at: Utc::now(),
        };
        assert_eq!(event.route_id(), route_id);
    }
}
