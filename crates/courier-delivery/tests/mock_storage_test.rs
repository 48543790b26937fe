//! Contract checks for the in-memory `DeliveryStorage`.
//!
//! Worker tests lean on these semantics, so they are pinned here against
//! the trait object rather than the concrete type.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use courier_core::models::{DlqFilter, DlqStatus, TenantId};
use courier_delivery::storage::{mock::MockDeliveryStorage, DeliveryStorage};
use courier_testing::{DlqEntryBuilder, RouteBuilder};
use serde_json::json;

const WORKER: &str = "delivery";

#[tokio::test]
async fn fetch_events_pages_strictly_after_position() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let tenant = TenantId::new();
    for n in 0..5 {
        storage.push_event(tenant, "order.created", json!({ "n": n }), Utc::now()).await;
    }
    let store: &dyn DeliveryStorage = &storage;

    let page = store.fetch_events(2, 2).await?;

    let positions: Vec<i64> = page.iter().map(|event| event.position).collect();
    assert_eq!(positions, vec![3, 4]);
    Ok(())
}

#[tokio::test]
async fn checkpoint_never_moves_backwards() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let store: &dyn DeliveryStorage = &storage;
    let now = Utc::now();

    assert_eq!(store.load_checkpoint(WORKER).await?, None);
    assert_eq!(store.advance_checkpoint(WORKER, 7, now).await?, 7);
    assert_eq!(store.advance_checkpoint(WORKER, 3, now).await?, 7);
    assert_eq!(store.load_checkpoint(WORKER).await?, Some(7));
    Ok(())
}

#[tokio::test]
async fn claim_takes_due_entries_oldest_first_and_marks_them_retrying() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let route = RouteBuilder::new(TenantId::new(), "https://example.com/hook").build();
    let now = Utc::now();
    let oldest = DlqEntryBuilder::new(&route, now - chrono::Duration::minutes(3)).build();
    let middle = DlqEntryBuilder::new(&route, now - chrono::Duration::minutes(2)).build();
    let newest = DlqEntryBuilder::new(&route, now - chrono::Duration::minutes(1)).build();
    let mut future = DlqEntryBuilder::new(&route, now - chrono::Duration::minutes(4)).build();
    future.next_retry_at = now + chrono::Duration::minutes(10);
    for entry in [&newest, &future, &oldest, &middle] {
        storage.add_dlq_entry(entry.clone()).await;
    }
    let store: &dyn DeliveryStorage = &storage;

    let claimed = store.claim_due_dlq(now, 2).await?;

    let ids: Vec<_> = claimed.iter().map(|entry| entry.id).collect();
    assert_eq!(ids, vec![oldest.id, middle.id]);
    assert!(claimed.iter().all(|entry| entry.status == DlqStatus::Retrying));

    let second = store.claim_due_dlq(now, 10).await?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, newest.id);
    Ok(())
}

#[tokio::test]
async fn stale_retrying_entries_are_recovered() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let route = RouteBuilder::new(TenantId::new(), "https://example.com/hook").build();
    let now = Utc::now();
    let stuck = DlqEntryBuilder::new(&route, now - chrono::Duration::minutes(30))
        .status(DlqStatus::Retrying)
        .build();
    let fresh = DlqEntryBuilder::new(&route, now).status(DlqStatus::Retrying).build();
    storage.add_dlq_entry(stuck.clone()).await;
    storage.add_dlq_entry(fresh.clone()).await;
    let store: &dyn DeliveryStorage = &storage;

    let recovered = store.recover_stale_dlq(now - chrono::Duration::minutes(10)).await?;

    assert_eq!(recovered, 1);
    assert_eq!(storage.dlq_entry(stuck.id).await.map(|e| e.status), Some(DlqStatus::PendingRetry));
    assert_eq!(storage.dlq_entry(fresh.id).await.map(|e| e.status), Some(DlqStatus::Retrying));
    Ok(())
}

#[tokio::test]
async fn requeue_resets_budget_but_skips_entries_in_flight() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let route = RouteBuilder::new(TenantId::new(), "https://example.com/hook").build();
    let now = Utc::now();
    let mut abandoned =
        DlqEntryBuilder::new(&route, now).attempts(5).status(DlqStatus::Abandoned).build();
    abandoned.retryable = false;
    let in_flight = DlqEntryBuilder::new(&route, now).status(DlqStatus::Retrying).build();
    storage.add_dlq_entry(abandoned.clone()).await;
    storage.add_dlq_entry(in_flight.clone()).await;
    let store: &dyn DeliveryStorage = &storage;

    assert!(store.requeue_dlq(abandoned.id, now).await?);
    assert!(!store.requeue_dlq(in_flight.id, now).await?);

    let requeued = storage.dlq_entry(abandoned.id).await.expect("entry kept");
    assert_eq!(requeued.status, DlqStatus::PendingRetry);
    assert_eq!(requeued.attempt_count, 0);
    assert!(requeued.retryable);
    Ok(())
}

#[tokio::test]
async fn abandon_is_reported_once() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let route = RouteBuilder::new(TenantId::new(), "https://example.com/hook").build();
    let entry = DlqEntryBuilder::new(&route, Utc::now()).build();
    storage.add_dlq_entry(entry.clone()).await;
    let store: &dyn DeliveryStorage = &storage;

    assert!(store.abandon_dlq(entry.id, Some(2), Some("gone".into()), Utc::now()).await?);
    assert!(!store.abandon_dlq(entry.id, None, None, Utc::now()).await?);

    let stored = storage.dlq_entry(entry.id).await.expect("entry kept");
    assert_eq!(stored.attempt_count, 2);
    assert_eq!(stored.last_error.as_deref(), Some("gone"));
    Ok(())
}

#[tokio::test]
async fn list_filters_by_tenant_and_status() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let tenant = TenantId::new();
    let mine = RouteBuilder::new(tenant, "https://example.com/a").build();
    let theirs = RouteBuilder::new(TenantId::new(), "https://example.com/b").build();
    let now = Utc::now();
    storage.add_dlq_entry(DlqEntryBuilder::new(&mine, now).build()).await;
    storage
        .add_dlq_entry(DlqEntryBuilder::new(&mine, now).status(DlqStatus::Abandoned).build())
        .await;
    storage.add_dlq_entry(DlqEntryBuilder::new(&theirs, now).build()).await;
    let store: &dyn DeliveryStorage = &storage;

    let pending = store
        .list_dlq(DlqFilter {
            tenant_id: Some(tenant),
            status: Some(DlqStatus::PendingRetry),
            ..DlqFilter::default()
        })
        .await?;

    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].tenant_id, tenant);
    Ok(())
}

#[tokio::test]
async fn leases_are_exclusive_until_expiry_or_release() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let store: &dyn DeliveryStorage = &storage;
    let now = Utc::now();
    let ttl = chrono::Duration::from_std(Duration::from_secs(300))?;

    assert!(store.try_acquire_lease(WORKER, "a".into(), now + ttl, now).await?);
    assert!(store.try_acquire_lease(WORKER, "a".into(), now + ttl, now).await?);
    assert!(!store.try_acquire_lease(WORKER, "b".into(), now + ttl, now).await?);

    let later = now + ttl;
    assert!(store.try_acquire_lease(WORKER, "b".into(), later + ttl, later).await?);
    assert_eq!(storage.lease_owner(WORKER).await.as_deref(), Some("b"));

    store.release_lease(WORKER, "a".into()).await?;
    assert_eq!(storage.lease_owner(WORKER).await.as_deref(), Some("b"));
    store.release_lease(WORKER, "b".into()).await?;
    assert_eq!(storage.lease_owner(WORKER).await, None);
    Ok(())
}

#[tokio::test]
async fn tenant_ancestors_walk_to_the_root() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let (root, parent, child) = (TenantId::new(), TenantId::new(), TenantId::new());
    storage.set_tenant_parent(child, parent).await;
    storage.set_tenant_parent(parent, root).await;
    let store: &dyn DeliveryStorage = &storage;

    assert_eq!(store.tenant_ancestors(child).await?, vec![child, parent, root]);
    assert_eq!(store.tenant_ancestors(root).await?, vec![root]);
    Ok(())
}

#[tokio::test]
async fn injected_errors_fire_once_unless_sticky() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let store: &dyn DeliveryStorage = &storage;

    storage.inject_error("health_check", "connection refused").await;
    assert!(store.health_check().await.is_err());
    assert!(store.health_check().await.is_ok());

    storage.fail_always("health_check", "connection refused").await;
    assert!(store.health_check().await.is_err());
    assert!(store.health_check().await.is_err());

    storage.clear_errors().await;
    assert!(store.health_check().await.is_ok());
    Ok(())
}
