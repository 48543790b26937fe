//! Delivery engine: wires the four workers to shared primitives.
//!
//! ```text
//!                 ┌──────────────────┐
//!  upstream ────▶ │ delivery worker  │──┐
//!                 ├──────────────────┤  │   ┌──────────┐   ┌───────────┐
//!  scheduled ───▶ │ scheduler worker │──┼─▶ │ executor │──▶│ endpoints │
//!                 ├──────────────────┤  │   └──────────┘   └───────────┘
//!  cron/interval ▶│ job worker       │──┤        │
//!                 ├──────────────────┤  │        ▼
//!  dead letters ─▶│ dlq worker       │──┘   rate limits, circuits, DLQ
//!                 └──────────────────┘
//! ```
//!
//! Each worker runs in its own [`PollLoop`]. The loops share one storage
//! handle, one executor and one health registry.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use courier_core::{
    events::{EventHandler, TracingEventHandler},
    Clock, RealClock, Storage,
};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::{
    admin::Operations,
    circuit::{CircuitBreaker, CircuitConfig},
    client::{ClientConfig, DeliveryClient},
    collaborators::{AuthProvider, BuiltinTransformer, ConfigAuthProvider, Transformer},
    data_source::{BatchDataSource, SourceFetcher, DEFAULT_FETCH_TIMEOUT},
    dedup::{DedupCache, DedupStore, DEFAULT_DEDUP_TTL},
    error::{DeliveryError, Result},
    executor::{DeliveryExecutor, ExecutorParts},
    health::HealthRegistry,
    poller::{LeaseSettings, PollLoop, PollingWorker, TickRun},
    rate_limit::RateLimiter,
    retry::RetryPolicy,
    storage::{DeliveryStorage, PostgresDeliveryStorage},
    worker_pool::WorkerPool,
    workers::{
        DlqWorker, DlqWorkerConfig, EventDeliveryConfig, EventDeliveryWorker, JobWorker,
        SchedulerWorker,
    },
};

/// Worker roles run by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkerKind {
    /// Event-driven push delivery.
    Delivery,
    /// One-shot and recurring scheduled deliveries.
    Scheduler,
    /// Cron and interval batch jobs.
    Jobs,
    /// Dead-letter auto-retry.
    Dlq,
}

impl WorkerKind {
    /// Every worker role.
    pub const ALL: [WorkerKind; 4] = [Self::Delivery, Self::Scheduler, Self::Jobs, Self::Dlq];
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delivery worker poll interval.
    pub delivery_interval: Duration,
    /// Scheduler worker poll interval.
    pub scheduler_interval: Duration,
    /// Job worker poll interval.
    pub job_interval: Duration,
    /// DLQ worker poll interval.
    pub dlq_interval: Duration,
    /// Delivery worker batch settings.
    pub delivery: EventDeliveryConfig,
    /// Scheduled deliveries handled per tick.
    pub scheduler_batch_size: u32,
    /// DLQ worker settings.
    pub dlq: DlqWorkerConfig,
    /// Backoff between in-process attempts.
    pub immediate_policy: RetryPolicy,
    /// Backoff between dead-letter cycles.
    pub dlq_policy: RetryPolicy,
    /// Circuit breaker settings.
    pub circuit: CircuitConfig,
    /// How long a delivered event stays in the dedup cache.
    pub dedup_ttl: Duration,
    /// Upper bound on one data-source fetch.
    pub fetch_timeout: Duration,
    /// Outbound HTTP client settings.
    pub client: ClientConfig,
    /// Worker-role lease; `None` runs without leasing.
    pub lease: Option<LeaseSettings>,
    /// Maximum time to wait for in-flight ticks on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delivery_interval: Duration::from_secs(5),
            scheduler_interval: Duration::from_secs(60),
            job_interval: Duration::from_secs(60),
            dlq_interval: Duration::from_secs(60),
            delivery: EventDeliveryConfig::default(),
            scheduler_batch_size: 10,
            dlq: DlqWorkerConfig::default(),
            immediate_policy: RetryPolicy::immediate(3),
            dlq_policy: RetryPolicy::dead_letter(5),
            circuit: CircuitConfig::default(),
            dedup_ttl: DEFAULT_DEDUP_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            client: ClientConfig::default(),
            lease: Some(LeaseSettings {
                owner: format!("courier-{}", Uuid::new_v4()),
                ttl: Duration::from_secs(180),
            }),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    fn interval(&self, kind: WorkerKind) -> Duration {
        match kind {
            WorkerKind::Delivery => self.delivery_interval,
            WorkerKind::Scheduler => self.scheduler_interval,
            WorkerKind::Jobs => self.job_interval,
            WorkerKind::Dlq => self.dlq_interval,
        }
    }
}

/// Runs the delivery workers.
pub struct DeliveryEngine {
    config: EngineConfig,
    storage: Arc<dyn DeliveryStorage>,
    data_source: Arc<dyn BatchDataSource>,
    dedup: Arc<dyn DedupStore>,
    clock: Arc<dyn Clock>,
    executor: DeliveryExecutor,
    health: HealthRegistry,
    loops: BTreeMap<WorkerKind, PollLoop>,
    worker_pool: Option<WorkerPool>,
}

impl DeliveryEngine {
    /// Creates an engine backed by PostgreSQL.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(pool: PgPool, config: EngineConfig) -> Result<Self> {
        let storage: Arc<dyn DeliveryStorage> =
            Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(pool.clone()))));
        let http = DeliveryClient::new(config.client.clone())?;
        let data_source =
            Arc::new(SourceFetcher::new(Some(Arc::new(pool)), http.http().clone(), config.fetch_timeout));

        Self::with_storage(storage, data_source, Arc::new(RealClock::new()), config)
    }

    /// Creates an engine over any storage and data source.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn with_storage(
        storage: Arc<dyn DeliveryStorage>,
        data_source: Arc<dyn BatchDataSource>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self> {
        let executor = DeliveryExecutor::new(ExecutorParts {
            storage: storage.clone(),
            client: DeliveryClient::new(config.client.clone())?,
            rate_limiter: RateLimiter::new(storage.clone(), clock.clone()),
            circuit: CircuitBreaker::new(storage.clone(), clock.clone(), config.circuit.clone()),
            transformer: Arc::new(BuiltinTransformer),
            auth: Arc::new(ConfigAuthProvider),
            events: Arc::new(TracingEventHandler),
            clock: clock.clone(),
            immediate_policy: config.immediate_policy.clone(),
            dlq_policy: config.dlq_policy.clone(),
        });
        let dedup: Arc<dyn DedupStore> = Arc::new(DedupCache::new(config.dedup_ttl, clock.clone()));
        let health = HealthRegistry::new(clock.clone());

        let mut engine = Self {
            config,
            storage,
            data_source,
            dedup,
            clock,
            executor,
            health,
            loops: BTreeMap::new(),
            worker_pool: None,
        };
        engine.rebuild_loops();
        Ok(engine)
    }

    /// Replaces the transform and auth collaborators.
    #[must_use]
    pub fn with_collaborators(
        mut self,
        transformer: Arc<dyn Transformer>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        self.executor = self.executor.with_transformer(transformer).with_auth(auth);
        self.rebuild_loops();
        self
    }

    /// Replaces the lifecycle event handler.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.executor = self.executor.with_events(events);
        self.rebuild_loops();
        self
    }

    fn worker(&self, kind: WorkerKind) -> Arc<dyn PollingWorker> {
        let storage = self.storage.clone();
        let executor = self.executor.clone();
        let clock = self.clock.clone();

        match kind {
            WorkerKind::Delivery => Arc::new(EventDeliveryWorker::new(
                storage,
                executor,
                self.dedup.clone(),
                clock,
                self.config.delivery.clone(),
            )),
            WorkerKind::Scheduler => {
                Arc::new(SchedulerWorker::new(storage, executor, clock, self.config.scheduler_batch_size))
            },
            WorkerKind::Jobs => Arc::new(JobWorker::new(storage, executor, self.data_source.clone(), clock)),
            WorkerKind::Dlq => Arc::new(DlqWorker::new(storage, executor, clock, self.config.dlq.clone())),
        }
    }

    fn rebuild_loops(&mut self) {
        self.loops = WorkerKind::ALL
            .into_iter()
            .map(|kind| {
                let poll_loop = PollLoop::new(
                    self.worker(kind),
                    self.config.interval(kind),
                    self.storage.clone(),
                    self.clock.clone(),
                    self.health.clone(),
                    self.config.lease.clone(),
                );
                (kind, poll_loop)
            })
            .collect();
    }

    /// Spawns every worker loop.
    ///
    /// # Errors
    ///
    /// Returns error if the engine is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }

        let mut pool = WorkerPool::new(CancellationToken::new());
        for poll_loop in self.loops.values() {
            pool.spawn(poll_loop.clone());
        }
        info!(workers = ?pool.workers(), "delivery engine started");
        self.worker_pool = Some(pool);
        Ok(())
    }

    /// Stops every loop, letting in-flight ticks finish.
    ///
    /// # Errors
    ///
    /// Returns error if the loops outlive the shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        match self.worker_pool.take() {
            Some(pool) => pool.shutdown_graceful(self.config.shutdown_timeout).await,
            None => {
                info!("delivery engine was not started, shutdown completed immediately");
                Ok(())
            },
        }
    }

    /// Returns true while worker loops are running.
    pub fn is_running(&self) -> bool {
        self.worker_pool.as_ref().is_some_and(WorkerPool::has_active_workers)
    }

    /// Runs one tick of `kind` now, sharing the single-flight guard with the
    /// running loop.
    ///
    /// # Errors
    ///
    /// Returns error if the tick could not run.
    pub async fn run_once(&self, kind: WorkerKind) -> Result<TickRun> {
        match self.loops.get(&kind) {
            Some(poll_loop) => poll_loop.tick_once().await,
            None => Err(DeliveryError::internal(format!("no loop for {kind:?}"))),
        }
    }

    /// Operator surface over the engine's state.
    pub fn operations(&self) -> Operations {
        Operations::new(
            self.storage.clone(),
            self.executor.rate_limiter().clone(),
            self.executor.circuit().clone(),
            self.health.clone(),
            self.clock.clone(),
        )
    }

    /// Worker heartbeat registry.
    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    /// Shared executor.
    pub fn executor(&self) -> &DeliveryExecutor {
        &self.executor
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
