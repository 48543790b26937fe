//! Short-lived duplicate suppression for upstream events.
//!
//! A key is `(tenant, event type, sha256(payload))`. The in-process cache
//! forgets keys after a fixed TTL; losing it on restart only widens the
//! duplicate window, which the at-least-once contract already allows.
//! Workers only see [`DedupStore`], so a shared cache can replace it.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use courier_core::{models::TenantId, Clock};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Default trailing window.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(300);

/// Identity of an event for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    tenant_id: TenantId,
    event_type: String,
    payload_digest: String,
}

impl DedupKey {
    /// Builds a key from the event identity.
    ///
    /// `serde_json::Value` serializes objects with sorted keys, so equal
    /// payloads hash equally regardless of their original key order.
    pub fn new(tenant_id: TenantId, event_type: &str, payload: &serde_json::Value) -> Self {
        let digest = Sha256::digest(payload.to_string().as_bytes());
        Self {
            tenant_id,
            event_type: event_type.to_string(),
            payload_digest: hex::encode(digest),
        }
    }

    /// Hex-encoded payload digest.
    pub fn payload_digest(&self) -> &str {
        &self.payload_digest
    }
}

/// Membership set with expiry.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Returns true if `key` was marked within the TTL.
    async fn seen(&self, key: &DedupKey) -> bool;

    /// Marks `key` as seen now.
    async fn mark(&self, key: &DedupKey);

    /// Marks `key` and returns true if it was not already present.
    async fn check_and_mark(&self, key: &DedupKey) -> bool;

    /// Removes `key`, so the next occurrence is processed.
    async fn forget(&self, key: &DedupKey);

    /// Drops expired keys. Returns how many were removed.
    async fn sweep(&self) -> usize;
}

/// In-process TTL cache.
#[derive(Debug, Clone)]
pub struct DedupCache {
    entries: Arc<Mutex<HashMap<DedupKey, Instant>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl DedupCache {
    /// Creates an empty cache.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), ttl, clock }
    }

    /// Number of keys held, expired ones included until swept.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns true if the cache holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    fn live(&self, first_seen: Instant, now: Instant) -> bool {
        now.saturating_duration_since(first_seen) < self.ttl
    }
}

#[async_trait]
impl DedupStore for DedupCache {
    async fn seen(&self, key: &DedupKey) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some(&first_seen) if self.live(first_seen, now) => true,
            Some(_) => {
                entries.remove(key);
                false
            },
            None => false,
        }
    }

    async fn mark(&self, key: &DedupKey) {
        let now = self.clock.now();
        self.entries.lock().await.insert(key.clone(), now);
    }

    async fn check_and_mark(&self, key: &DedupKey) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        if entries.get(key).is_some_and(|&first_seen| self.live(first_seen, now)) {
            return false;
        }

        entries.insert(key.clone(), now);
        true
    }

    async fn forget(&self, key: &DedupKey) {
        self.entries.lock().await.remove(key);
    }

    async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, first_seen| self.live(*first_seen, now));
        before - entries.len()
    }
}
