//! Worker loop: claim, execute, record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use queuectl_core::{FailureOutcome, Job, QueueConfig, RetryPolicy};

use super::executor::CommandExecutor;
use super::store::JobStore;

/// Terminal-update attempts still made once shutdown has been requested.
pub const FINAL_UPDATE_ATTEMPTS: u32 = 5;

/// Longest slice of command output written to the log.
const LOGGED_OUTPUT_LIMIT: usize = 4096;

/// What happened to one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { delay: Duration },
    DeadLettered,
    /// The terminal update never reached the store; the job stays `Processing`.
    Unrecorded,
}

/// Per-worker counters, returned when the worker exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_unrecorded: u64,
    pub storage_errors: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: JobOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobOutcome::Completed => self.jobs_succeeded += 1,
            JobOutcome::Retrying { .. } => self.jobs_retried += 1,
            JobOutcome::DeadLettered => self.jobs_dead_lettered += 1,
            JobOutcome::Unrecorded => self.jobs_unrecorded += 1,
        }
    }

    pub fn merge(&mut self, other: &WorkerStats) {
        self.jobs_processed += other.jobs_processed;
        self.jobs_succeeded += other.jobs_succeeded;
        self.jobs_retried += other.jobs_retried;
        self.jobs_dead_lettered += other.jobs_dead_lettered;
        self.jobs_unrecorded += other.jobs_unrecorded;
        self.storage_errors += other.storage_errors;
    }
}

/// Executes one job at a time until told to stop.
pub struct Worker {
    id: usize,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn CommandExecutor>,
    policy: RetryPolicy,
    idle_interval: Duration,
}

impl Worker {
    pub fn new(
        id: usize,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn CommandExecutor>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            id,
            store,
            executor,
            policy: config.retry_policy(),
            idle_interval: config.idle_interval(),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// `shutdown` is only checked between jobs: a claimed job always runs to
    /// completion (or until `kill` fires) and has its outcome recorded first.
    pub async fn run(self, shutdown: CancellationToken, kill: CancellationToken) -> WorkerStats {
        info!(worker = self.id, "worker started");
        let mut stats = WorkerStats::default();

        while !shutdown.is_cancelled() {
            match self.store.claim().await {
                Ok(Some(job)) => {
                    let outcome = self.process_job(job, &shutdown, &kill).await;
                    stats.record(outcome);
                }
                Ok(None) => self.idle(&shutdown).await,
                Err(e) => {
                    stats.storage_errors += 1;
                    error!(worker = self.id, error = %e, "failed to claim job");
                    self.idle(&shutdown).await;
                }
            }
        }

        info!(worker = self.id, processed = stats.jobs_processed, "worker stopped");
        stats
    }

    /// Execute an already claimed job and record its outcome.
    pub async fn process_job(
        &self,
        mut job: Job,
        shutdown: &CancellationToken,
        kill: &CancellationToken,
    ) -> JobOutcome {
        info!(worker = self.id, job_id = %job.id, attempt = job.attempts, "processing job");

        let result = self.executor.execute(&job.command, kill).await;
        debug!(
            worker = self.id,
            job_id = %job.id,
            output = truncate(&result.output, LOGGED_OUTPUT_LIMIT),
            "command output"
        );

        let now = Utc::now();
        let outcome = match result.failure_reason() {
            None => match job.complete(now) {
                Ok(_) => {
                    info!(worker = self.id, job_id = %job.id, "job completed");
                    JobOutcome::Completed
                }
                Err(e) => {
                    warn!(worker = self.id, job_id = %job.id, error = %e, "cannot complete job");
                    return JobOutcome::Unrecorded;
                }
            },
            Some(reason) => match job.fail(&self.policy, now) {
                Ok(FailureOutcome::Retry { delay, .. }) => {
                    warn!(
                        worker = self.id,
                        job_id = %job.id,
                        attempt = job.attempts,
                        reason = %reason,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "job failed, will be retried"
                    );
                    JobOutcome::Retrying { delay }
                }
                Ok(FailureOutcome::Dead) => {
                    warn!(
                        worker = self.id,
                        job_id = %job.id,
                        attempts = job.attempts,
                        reason = %reason,
                        "job exhausted its retries, moved to dead letter queue"
                    );
                    JobOutcome::DeadLettered
                }
                Err(e) => {
                    warn!(worker = self.id, job_id = %job.id, error = %e, "cannot fail job");
                    return JobOutcome::Unrecorded;
                }
            },
        };

        if self.persist(&mut job, shutdown).await {
            outcome
        } else {
            JobOutcome::Unrecorded
        }
    }

    /// Write the terminal transition, retrying transient store errors.
    ///
    /// Keeps trying while the pool is running; after shutdown gives up after
    /// [`FINAL_UPDATE_ATTEMPTS`] and leaves the job visibly `Processing`.
    async fn persist(&self, job: &mut Job, shutdown: &CancellationToken) -> bool {
        let mut attempts_after_shutdown = 0u32;
        loop {
            let err = match self.store.update(job).await {
                Ok(()) => return true,
                Err(e) => e,
            };

            if !err.is_transient() {
                error!(worker = self.id, job_id = %job.id, error = %err, "job update rejected");
                return false;
            }

            if shutdown.is_cancelled() {
                attempts_after_shutdown += 1;
                if attempts_after_shutdown >= FINAL_UPDATE_ATTEMPTS {
                    error!(
                        worker = self.id,
                        job_id = %job.id,
                        state = %job.state,
                        error = %err,
                        "giving up on job update; job left in processing for operator intervention"
                    );
                    return false;
                }
            }

            warn!(worker = self.id, job_id = %job.id, error = %err, "job update failed, retrying");
            tokio::time::sleep(self.idle_interval).await;
        }
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.idle_interval) => {}
        }
    }
}

fn truncate(output: &str, limit: usize) -> &str {
    if output.len() <= limit {
        return output;
    }
    let mut end = limit;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    &output[..end]
}
