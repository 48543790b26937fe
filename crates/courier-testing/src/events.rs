//! Recording event handler for asserting on delivery lifecycle signals.
//!
//! Waits are bounded by a timeout so a missing signal fails the test
//! instead of hanging CI.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_core::{DeliveryEvent, EventHandler};
use tokio::sync::{Notify, RwLock};

/// Handler that keeps every event it receives.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<RwLock<Vec<DeliveryEvent>>>,
    notify: Arc<Notify>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far, in arrival order.
    pub async fn snapshot(&self) -> Vec<DeliveryEvent> {
        self.events.read().await.clone()
    }

    /// Number of events matching `predicate`.
    pub async fn count(&self, predicate: impl Fn(&DeliveryEvent) -> bool) -> usize {
        self.events.read().await.iter().filter(|event| predicate(event)).count()
    }

    /// Number of `Abandoned` alerts.
    pub async fn abandoned(&self) -> usize {
        self.count(|event| matches!(event, DeliveryEvent::Abandoned { .. })).await
    }

    /// Number of `CircuitOpened` signals.
    pub async fn circuits_opened(&self) -> usize {
        self.count(|event| matches!(event, DeliveryEvent::CircuitOpened { .. })).await
    }

    /// Waits until at least `count` events arrived.
    ///
    /// # Panics
    ///
    /// Panics if `timeout` elapses first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.events.read().await.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        assert!(waited.is_ok(), "timed out waiting for {count} delivery events");
    }

    /// Drops every recorded event.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventHandler for EventLog {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.write().await.push(event);
        self.notify.notify_waiters();
    }
}
