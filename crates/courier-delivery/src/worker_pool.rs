//! Supervised worker tasks with graceful shutdown.
//!
//! Every worker role runs as one spawned [`PollLoop`]. Shutdown cancels the
//! shared token and waits for each loop to finish its current tick.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    poller::PollLoop,
};

/// Spawned worker loops sharing one cancellation token.
pub struct WorkerPool {
    cancellation_token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerPool {
    /// Creates an empty pool.
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self { cancellation_token, handles: Vec::new() }
    }

    /// Spawns `poll_loop` as a supervised task.
    pub fn spawn(&mut self, poll_loop: PollLoop) {
        let name = poll_loop.name();
        let token = self.cancellation_token.clone();
        let handle = tokio::spawn(poll_loop.run(token));
        self.handles.push((name, handle));
    }

    /// Names of spawned workers.
    pub fn workers(&self) -> Vec<&'static str> {
        self.handles.iter().map(|(name, _)| *name).collect()
    }

    /// Check if any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.handles.iter().any(|(_, handle)| !handle.is_finished())
    }

    /// Cancels every loop and waits for in-flight ticks to complete.
    ///
    /// # Errors
    ///
    /// Returns error if the loops do not stop within `timeout` or a worker
    /// task panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.handles);

        let joined = async {
            let mut panicked = None;
            for (worker, handle) in handles {
                if let Err(join_error) = handle.await {
                    error!(worker, error = %join_error, "worker task panicked during shutdown");
                    panicked.get_or_insert(DeliveryError::WorkerPanic {
                        worker: worker.to_string(),
                        error: join_error.to_string(),
                    });
                }
            }
            panicked
        };

        match tokio::time::timeout(timeout, joined).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.handles.iter().filter(|(_, handle)| !handle.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(active_workers = active, "worker pool dropped without shutdown, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use courier_core::TestClock;

    use super::*;
    use crate::{
        health::HealthRegistry,
        poller::{PollingWorker, TickSummary},
        storage::mock::MockDeliveryStorage,
    };

    #[derive(Default)]
    struct Ticker(AtomicUsize);

    #[async_trait]
    impl PollingWorker for Ticker {
        fn name(&self) -> &'static str {
            "ticker"
        }

        async fn tick(&self) -> Result<TickSummary> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(TickSummary::default())
        }
    }

    fn poll_loop(worker: Arc<Ticker>, health: &HealthRegistry) -> PollLoop {
        PollLoop::new(
            worker,
            Duration::from_millis(10),
            Arc::new(MockDeliveryStorage::new()),
            Arc::new(TestClock::new()),
            health.clone(),
            None,
        )
    }

    #[tokio::test]
    async fn spawned_loops_tick_until_shutdown() {
        let health = HealthRegistry::new(Arc::new(TestClock::new()));
        let worker = Arc::new(Ticker::default());
        let mut pool = WorkerPool::new(CancellationToken::new());
        pool.spawn(poll_loop(worker.clone(), &health));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.has_active_workers());
        assert_eq!(pool.workers(), vec!["ticker"]);

        pool.shutdown_graceful(Duration::from_secs(1)).await.unwrap();

        let ticks = worker.0.load(Ordering::SeqCst);
        assert!(ticks >= 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(worker.0.load(Ordering::SeqCst), ticks);
        assert!(health.snapshot().await.iter().all(|w| !w.alive));
    }

    #[tokio::test]
    async fn empty_pool_shuts_down_immediately() {
        let pool = WorkerPool::new(CancellationToken::new());

        assert!(pool.shutdown_graceful(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn dropping_pool_cancels_token() {
        let token = CancellationToken::new();
        let health = HealthRegistry::new(Arc::new(TestClock::new()));
        let mut pool = WorkerPool::new(token.clone());
        pool.spawn(poll_loop(Arc::new(Ticker::default()), &health));

        drop(pool);

        assert!(token.is_cancelled());
    }
}
