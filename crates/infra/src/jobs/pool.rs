//! Pool manager: runs N workers under one liveness marker.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use queuectl_core::{QueueConfig, QueueError, QueueResult};

use super::executor::CommandExecutor;
use super::store::JobStore;
use super::worker::{Worker, WorkerStats};
use crate::liveness::PidFile;

/// What a pool run did, aggregated over all workers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolSummary {
    pub workers: usize,
    pub stats: WorkerStats,
    /// Workers that ended by panicking.
    pub crashed_workers: usize,
    /// Whether the shutdown grace expired and running commands were killed.
    pub killed_in_flight: bool,
    #[serde(skip)]
    pub drain_time: Duration,
}

pub struct PoolManager {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn CommandExecutor>,
    config: QueueConfig,
}

impl PoolManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn CommandExecutor>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    /// Run `workers` workers until `stop` resolves, then drain.
    ///
    /// Refuses to start while `marker` exists. Workers finish their current
    /// job before exiting; if `shutdown_grace_secs` is configured and elapses
    /// first, in-flight commands are killed and recorded as failed attempts.
    #[instrument(skip(self, marker, stop), fields(marker = %marker.path().display()), err)]
    pub async fn run<F>(&self, workers: usize, marker: &PidFile, stop: F) -> QueueResult<PoolSummary>
    where
        F: Future<Output = ()>,
    {
        if workers == 0 {
            return Err(QueueError::validation("worker count must be at least 1"));
        }
        let guard = marker.acquire()?;

        let shutdown = CancellationToken::new();
        let kill = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for id in 1..=workers {
            let worker = Worker::new(
                id,
                Arc::clone(&self.store),
                Arc::clone(&self.executor),
                &self.config,
            );
            tasks.spawn(worker.run(shutdown.clone(), kill.clone()));
        }
        info!(workers, "worker pool started");

        stop.await;
        info!("stop requested, waiting for in-flight jobs");
        let drain_started = Instant::now();
        shutdown.cancel();

        let mut summary = PoolSummary {
            workers,
            ..PoolSummary::default()
        };

        match self.config.shutdown_grace() {
            Some(grace) => {
                let drained = tokio::time::timeout(grace, drain(&mut tasks, &mut summary)).await;
                if drained.is_err() {
                    warn!(grace = ?grace, "shutdown grace expired, killing in-flight commands");
                    summary.killed_in_flight = true;
                    kill.cancel();
                    drain(&mut tasks, &mut summary).await;
                }
            }
            None => drain(&mut tasks, &mut summary).await,
        }
        summary.drain_time = drain_started.elapsed();

        guard.release()?;
        info!(
            processed = summary.stats.jobs_processed,
            succeeded = summary.stats.jobs_succeeded,
            dead_lettered = summary.stats.jobs_dead_lettered,
            "worker pool stopped"
        );
        Ok(summary)
    }
}

async fn drain(tasks: &mut JoinSet<WorkerStats>, summary: &mut PoolSummary) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(stats) => summary.stats.merge(&stats),
            Err(e) => {
                summary.crashed_workers += 1;
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }
}
