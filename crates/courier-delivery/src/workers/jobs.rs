//! Cron and interval batch jobs.
//!
//! A due scheduled route runs three stages: fetch rows from its data
//! source, transform the batch, deliver it. Multi-step routes transform
//! the batch once per step with that step's transform. Every run leaves an
//! execution record with one entry per stage. The run state moves forward
//! even when a stage fails, so a broken data source fails once per slot
//! instead of on every tick.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    models::{
        DeliveryOrigin, ExecutionId, JobExecution, JobStage, JobState, Route, Schedule,
        ScheduledJob, StageRecord, StageStatus,
    },
    Clock,
};
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    data_source::{BatchDataSource, TemplateVars},
    error::{DeliveryError, Result},
    executor::{DeliveryExecutor, DeliveryOutcome, Dispatch},
    poller::{PollingWorker, TickSummary},
    schedule::{job_timing, next_occurrence, JobTiming},
    storage::DeliveryStorage,
};

/// Lease key of the job worker.
pub const JOB_WORKER: &str = "jobs";

/// Runs scheduled routes.
pub struct JobWorker {
    storage: Arc<dyn DeliveryStorage>,
    executor: DeliveryExecutor,
    data_source: Arc<dyn BatchDataSource>,
    clock: Arc<dyn Clock>,
}

impl JobWorker {
    /// Creates the worker.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        executor: DeliveryExecutor,
        data_source: Arc<dyn BatchDataSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, executor, data_source, clock }
    }

    fn stage(&self, stage: JobStage, started: Instant, outcome: std::result::Result<(), String>) -> StageRecord {
        let duration_ms =
            u64::try_from(self.clock.now().duration_since(started).as_millis()).unwrap_or(u64::MAX);
        match outcome {
            Ok(()) => StageRecord { stage, status: StageStatus::Succeeded, message: None, duration_ms },
            Err(message) => {
                StageRecord { stage, status: StageStatus::Failed, message: Some(message), duration_ms }
            },
        }
    }

    async fn fetch(&self, route: &Route, vars: &TemplateVars) -> Result<Vec<Value>> {
        let config = route
            .data_source
            .as_ref()
            .ok_or_else(|| DeliveryError::configuration("scheduled route has no data source"))?;
        self.data_source.fetch(config, vars).await
    }

    /// Runs one job and records its execution.
    async fn run_job(&self, job: &ScheduledJob, schedule: &Schedule) -> Result<()> {
        let route = &job.route;
        let started_at = self.clock.now_utc();
        let vars = TemplateVars {
            tenant_id: route.tenant_id,
            route_id: route.id,
            now: started_at,
            last_run: job.state.last_run,
        };
        let mut stages = Vec::with_capacity(3);
        let mut rows_fetched = None;

        let fetch_started = self.clock.now();
        let rows = match self.fetch(route, &vars).await {
            Ok(rows) => {
                rows_fetched = Some(i32::try_from(rows.len()).unwrap_or(i32::MAX));
                stages.push(self.stage(JobStage::Fetch, fetch_started, Ok(())));
                Some(rows)
            },
            Err(error) => {
                warn!(error = %error, "job fetch failed");
                stages.push(self.stage(JobStage::Fetch, fetch_started, Err(error.to_string())));
                stages.push(StageRecord::skipped(JobStage::Transform, "fetch failed"));
                stages.push(StageRecord::skipped(JobStage::Deliver, "fetch failed"));
                None
            },
        };

        if let Some(rows) = rows {
            let transform_started = self.clock.now();
            let batch = json!({
                "route_id": route.id,
                "tenant_id": route.tenant_id,
                "run_at": started_at,
                "last_run": job.state.last_run,
                "row_count": rows.len(),
                "rows": rows,
            });

            match self.transform(route, batch).await {
                Ok(payloads) => {
                    stages.push(self.stage(JobStage::Transform, transform_started, Ok(())));
                    stages.push(self.deliver(route, payloads).await);
                },
                Err(error) => {
                    warn!(error = %error, "job transform failed");
                    stages.push(self.stage(JobStage::Transform, transform_started, Err(error.to_string())));
                    stages.push(StageRecord::skipped(JobStage::Deliver, "transform failed"));
                },
            }
        }

        let finished_at = self.clock.now_utc();
        let next_run = match schedule {
            Schedule::Cron { .. } => match next_occurrence(schedule, finished_at) {
                Ok(next_run) => Some(next_run),
                Err(error) => {
                    warn!(error = %error, "cannot compute next run");
                    None
                },
            },
            Schedule::Interval { .. } => None,
        };
        self.storage
            .save_job_state(route.id, JobState { last_run: Some(started_at), next_run }, finished_at)
            .await?;

        let execution = JobExecution {
            id: ExecutionId::new(),
            route_id: route.id,
            tenant_id: route.tenant_id,
            started_at,
            finished_at,
            rows_fetched,
            stages,
        };
        info!(succeeded = execution.succeeded(), rows_fetched, "job run finished");
        self.storage.record_job_execution(execution).await?;
        Ok(())
    }

    /// Transforms the batch once per delivery target, with that target's
    /// own transform.
    async fn transform(&self, route: &Route, batch: Value) -> Result<Vec<(Option<usize>, Value)>> {
        let mut payloads = Vec::new();
        for (step_index, target) in route.delivery_targets() {
            let payload = self.executor.transformer().transform(batch.clone(), &target.transform).await?;
            payloads.push((step_index, payload));
        }
        Ok(payloads)
    }

    /// Delivers each target's payload in step order, stopping at the first
    /// step that does not succeed.
    async fn deliver(&self, route: &Route, payloads: Vec<(Option<usize>, Value)>) -> StageRecord {
        let started = self.clock.now();
        let step_delay = Duration::from_millis(route.step_delay_ms);

        for (position, (step_index, payload)) in payloads.into_iter().enumerate() {
            if position > 0 && !step_delay.is_zero() {
                self.clock.sleep(step_delay).await;
            }

            let dispatch = Dispatch::live(route.clone(), route.tenant_id, payload, DeliveryOrigin::Job)
                .with_step(step_index)
                .pre_transformed();

            match self.executor.execute(dispatch).await {
                Ok(DeliveryOutcome::Delivered { .. }) => {},
                Ok(outcome @ (DeliveryOutcome::RateLimited { .. } | DeliveryOutcome::CircuitOpen { .. })) => {
                    let mut record = self.stage(JobStage::Deliver, started, Ok(()));
                    record.status = StageStatus::Skipped;
                    record.message = Some(outcome.status().to_string());
                    return record;
                },
                Ok(DeliveryOutcome::Failed { error, .. }) | Err(error) => {
                    return self.stage(JobStage::Deliver, started, Err(error.to_string()));
                },
            }
        }

        self.stage(JobStage::Deliver, started, Ok(()))
    }

    /// Stores the first cron fire time without running the job.
    async fn initialize(&self, job: &ScheduledJob, schedule: &Schedule, now: DateTime<Utc>) -> Result<()> {
        let next_run = next_occurrence(schedule, now)?;
        debug!(next_run = %next_run, "scheduling first run");
        self.storage
            .save_job_state(job.route.id, JobState { last_run: job.state.last_run, next_run: Some(next_run) }, now)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PollingWorker for JobWorker {
    fn name(&self) -> &'static str {
        JOB_WORKER
    }

    async fn tick(&self) -> Result<TickSummary> {
        let jobs = self.storage.find_scheduled_jobs().await?;
        let now = self.clock.now_utc();
        let mut summary = TickSummary::default();

        for job in &jobs {
            let Some(schedule) = &job.route.schedule else {
                warn!(route_id = %job.route.id, "scheduled route has no schedule");
                continue;
            };
            let span = info_span!(
                "job",
                worker = JOB_WORKER,
                route_id = %job.route.id,
                tenant_id = %job.route.tenant_id
            );

            let result = match job_timing(schedule, &job.state, now) {
                JobTiming::NotYet => continue,
                JobTiming::Initialize => self.initialize(job, schedule, now).instrument(span).await,
                JobTiming::Due => {
                    summary.fetched += 1;
                    self.run_job(job, schedule).instrument(span).await
                },
            };

            match result {
                Ok(()) => summary.processed += 1,
                Err(error) => {
                    warn!(route_id = %job.route.id, error = %error, "job could not complete");
                    summary.errored += 1;
                },
            }
        }

        Ok(summary)
    }
}
