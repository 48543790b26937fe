//! Scenario DSL for multi-tick delivery tests.
//!
//! A scenario is a list of steps run in order against a [`TestEnv`]:
//! ingest events, answer with a given failure, tick a worker, advance the
//! clock, assert. Invariant checks run after every step.

use std::{future::Future, pin::Pin, time::Duration};

use anyhow::{ensure, Context, Result};
use courier_delivery::WorkerKind;
use wiremock::ResponseTemplate;

use crate::{EventBuilder, TestEnv};

type CheckFn =
    Box<dyn for<'a> Fn(&'a TestEnv) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>>;

/// Endpoint behaviour injected into a scenario.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// Plain status code response.
    Status(u16),
    /// HTTP 429 with an optional `Retry-After` header.
    TooManyRequests {
        /// Seconds sent in `Retry-After`.
        retry_after: Option<u64>,
    },
    /// Success after a delay, to exercise per-attempt timeouts.
    Slow {
        /// Response delay.
        delay: Duration,
    },
}

impl FailureKind {
    fn template(&self) -> ResponseTemplate {
        match self {
            Self::Status(status) => ResponseTemplate::new(*status),
            Self::TooManyRequests { retry_after } => {
                let template = ResponseTemplate::new(429);
                match retry_after {
                    Some(seconds) => template.insert_header("Retry-After", seconds.to_string()),
                    None => template,
                }
            },
            Self::Slow { delay } => ResponseTemplate::new(200).set_delay(*delay),
        }
    }
}

enum Step {
    Ingest(EventBuilder),
    Respond(FailureKind),
    Run(WorkerKind),
    AdvanceTime(Duration),
    ExpectRequests(usize),
    ExpectDlqEntries(usize),
    Check(String, CheckFn),
}

/// Builder for step-by-step delivery scenarios.
pub struct ScenarioBuilder {
    name: String,
    steps: Vec<Step>,
    invariants: Vec<(String, CheckFn)>,
}

impl ScenarioBuilder {
    /// Creates an empty scenario.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), steps: Vec::new(), invariants: Vec::new() }
    }

    /// Appends an upstream event.
    #[must_use]
    pub fn ingest(mut self, event: EventBuilder) -> Self {
        self.steps.push(Step::Ingest(event));
        self
    }

    /// Makes the endpoint answer with `status` from now on.
    #[must_use]
    pub fn respond_with(self, status: u16) -> Self {
        self.inject(FailureKind::Status(status))
    }

    /// Makes the endpoint behave as `failure` from now on.
    #[must_use]
    pub fn inject(mut self, failure: FailureKind) -> Self {
        self.steps.push(Step::Respond(failure));
        self
    }

    /// Runs one tick of `kind`.
    #[must_use]
    pub fn run(mut self, kind: WorkerKind) -> Self {
        self.steps.push(Step::Run(kind));
        self
    }

    /// Runs one delivery worker tick.
    #[must_use]
    pub fn run_delivery_cycle(self) -> Self {
        self.run(WorkerKind::Delivery)
    }

    /// Advances the virtual clock.
    #[must_use]
    pub fn advance_time(mut self, duration: Duration) -> Self {
        self.steps.push(Step::AdvanceTime(duration));
        self
    }

    /// Expects the endpoint to have received `count` requests since the last
    /// response change.
    #[must_use]
    pub fn expect_requests(mut self, count: usize) -> Self {
        self.steps.push(Step::ExpectRequests(count));
        self
    }

    /// Expects `count` dead-letter entries in any status.
    #[must_use]
    pub fn expect_dlq_entries(mut self, count: usize) -> Self {
        self.steps.push(Step::ExpectDlqEntries(count));
        self
    }

    /// Adds an async assertion step.
    #[must_use]
    pub fn check<F>(mut self, description: impl Into<String>, check: F) -> Self
    where
        F: for<'a> Fn(&'a TestEnv) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>
            + 'static,
    {
        self.steps.push(Step::Check(description.into(), Box::new(check)));
        self
    }

    /// Adds a check that runs after every step.
    #[must_use]
    pub fn invariant<F>(mut self, description: impl Into<String>, check: F) -> Self
    where
        F: for<'a> Fn(&'a TestEnv) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>
            + 'static,
    {
        self.invariants.push((description.into(), Box::new(check)));
        self
    }

    /// No dead-letter entry runs more cycles than its budget.
    #[must_use]
    pub fn check_dlq_budget(self) -> Self {
        self.invariant("dlq entries stay within their budget", |env| {
            Box::pin(async move {
                for entry in env.storage.dlq_entries().await {
                    ensure!(
                        entry.attempt_count <= entry.max_retries,
                        "entry {} ran {} cycles with a budget of {}",
                        entry.id,
                        entry.attempt_count,
                        entry.max_retries
                    );
                }
                Ok(())
            })
        })
    }

    /// Executes the scenario.
    ///
    /// # Errors
    ///
    /// Returns the first failing step or invariant.
    pub async fn run_on(self, env: &TestEnv) -> Result<()> {
        tracing::info!(scenario = %self.name, steps = self.steps.len(), "running scenario");

        for (index, step) in self.steps.into_iter().enumerate() {
            let number = index + 1;
            match step {
                Step::Ingest(event) => {
                    env.ingest(event).await;
                },
                Step::Respond(failure) => env.respond_with_template(failure.template()).await,
                Step::Run(kind) => {
                    env.run(kind).await.with_context(|| format!("step {number}: {kind:?} tick"))?;
                },
                Step::AdvanceTime(duration) => env.advance_time(duration),
                Step::ExpectRequests(expected) => {
                    let actual = env.request_count().await;
                    ensure!(actual == expected, "step {number}: expected {expected} requests, got {actual}");
                },
                Step::ExpectDlqEntries(expected) => {
                    let actual = env.storage.dlq_entries().await.len();
                    ensure!(
                        actual == expected,
                        "step {number}: expected {expected} dlq entries, got {actual}"
                    );
                },
                Step::Check(description, check) => {
                    check(env).await.with_context(|| format!("step {number}: {description}"))?;
                },
            }

            for (description, invariant) in &self.invariants {
                invariant(env)
                    .await
                    .with_context(|| format!("invariant violated after step {number}: {description}"))?;
            }
        }

        Ok(())
    }
}
