//! Engine lifecycle with real worker loops.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use courier_core::{models::TenantId, Clock, TestClock};
use courier_delivery::{
    data_source::{SourceFetcher, DEFAULT_FETCH_TIMEOUT},
    storage::mock::MockDeliveryStorage,
    workers::DELIVERY_WORKER,
    DeliveryEngine, EngineConfig, WorkerKind,
};
use courier_testing::RouteBuilder;
use serde_json::json;
use tokio::time::timeout;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn fast_config() -> EngineConfig {
    EngineConfig {
        delivery_interval: Duration::from_millis(20),
        scheduler_interval: Duration::from_millis(20),
        job_interval: Duration::from_millis(20),
        dlq_interval: Duration::from_millis(20),
        lease: None,
        shutdown_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

fn engine(storage: &MockDeliveryStorage, clock: &TestClock) -> Result<DeliveryEngine> {
    let engine = DeliveryEngine::with_storage(
        Arc::new(storage.clone()),
        Arc::new(SourceFetcher::new(None, reqwest::Client::new(), DEFAULT_FETCH_TIMEOUT)),
        Arc::new(clock.clone()),
        fast_config(),
    )?;
    Ok(engine)
}

#[test]
fn default_config_matches_documented_intervals() {
    let config = EngineConfig::default();

    assert_eq!(config.delivery_interval, Duration::from_secs(5));
    assert_eq!(config.scheduler_interval, Duration::from_secs(60));
    assert_eq!(config.job_interval, Duration::from_secs(60));
    assert_eq!(config.dlq_interval, Duration::from_secs(60));
    assert_eq!(config.scheduler_batch_size, 10);
    assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    assert!(config.lease.is_some_and(|lease| lease.owner.starts_with("courier-")));
}

#[tokio::test]
async fn running_engine_delivers_events_in_the_background() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::body_partial_json(json!({ "order_id": 7 })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let storage = MockDeliveryStorage::new();
    let clock = TestClock::new();
    let tenant = TenantId::new();
    storage.add_route(RouteBuilder::new(tenant, server.uri()).build()).await;
    let event =
        storage.push_event(tenant, "order.created", json!({ "order_id": 7 }), clock.now_utc()).await;

    let mut engine = engine(&storage, &clock)?;
    engine.start()?;

    timeout(Duration::from_secs(5), async {
        while storage.checkpoint(DELIVERY_WORKER).await != Some(event.position) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    assert!(engine.is_running());
    engine.shutdown().await?;
    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn every_worker_reports_health_while_running() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let clock = TestClock::new();
    let mut engine = engine(&storage, &clock)?;
    engine.start()?;

    timeout(Duration::from_secs(5), async {
        while engine.operations().worker_health().await.len() < WorkerKind::ALL.len() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    let health = engine.operations().worker_health().await;
    assert!(health.iter().all(|worker| worker.alive));

    let operations = engine.operations();
    engine.shutdown().await?;
    assert!(operations.worker_health().await.iter().all(|worker| !worker.alive));
    Ok(())
}

#[tokio::test]
async fn manual_ticks_work_while_loops_run() -> Result<()> {
    let storage = MockDeliveryStorage::new();
    let clock = TestClock::new();
    let mut engine = engine(&storage, &clock)?;
    engine.start()?;

    for kind in WorkerKind::ALL {
        engine.run_once(kind).await?;
    }

    engine.shutdown().await?;
    Ok(())
}
