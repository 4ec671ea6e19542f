//! End-to-end job lifecycle against a real SQLite file and `sh -c`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use queuectl_core::{Job, JobId, JobSpec, JobState, QueueConfig, QueueError};
use queuectl_infra::PidFile;
use queuectl_infra::jobs::{
    CommandExecutor, JobOutcome, JobStore, PoolManager, ShellExecutor, SqliteJobStore, Worker,
};

struct Harness {
    dir: tempfile::TempDir,
    store: Arc<SqliteJobStore>,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteJobStore::open(&dir.path().join("jobs.db")).await.unwrap());
        Self { dir, store }
    }

    async fn enqueue(&self, id: &str, command: &str, max_retries: Option<u32>) -> JobId {
        let mut spec = JobSpec::new(command).with_id(id);
        if let Some(max) = max_retries {
            spec = spec.with_max_retries(max);
        }
        let job = spec.into_job(3, Utc::now()).unwrap();
        self.store.enqueue(&job).await.unwrap();
        job.id
    }

    fn worker(&self, executor: Arc<dyn CommandExecutor>) -> Worker {
        let config = QueueConfig {
            idle_interval_ms: 10,
            ..QueueConfig::default()
        };
        Worker::new(1, self.store.clone(), executor, &config)
    }

    /// Claim ignoring backoff, so retry paths run without waiting.
    async fn claim_ignoring_backoff(&self) -> Job {
        self.store
            .claim_due(Utc::now() + TimeDelta::days(365 * 20))
            .await
            .unwrap()
            .expect("an eligible job")
    }

    async fn run_once(&self, worker: &Worker) -> JobOutcome {
        let job = self.claim_ignoring_backoff().await;
        worker
            .process_job(job, &CancellationToken::new(), &CancellationToken::new())
            .await
    }

    fn marker(&self) -> PidFile {
        PidFile::new(self.dir.path().join("queuectl.pid"))
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(20);
    while !check().await {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn successful_command_completes_on_first_attempt() {
    let h = Harness::new().await;
    let id = h.enqueue("hello", "echo hello", None).await;
    let worker = h.worker(Arc::new(ShellExecutor::new()));

    assert_eq!(h.run_once(&worker).await, JobOutcome::Completed);

    let job = h.store.get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
    assert!(h.store.claim().await.unwrap().is_none());
}

#[tokio::test]
async fn failing_command_reaches_dlq_after_max_retries() {
    let h = Harness::new().await;
    let id = h.enqueue("bad", "exit 1", Some(2)).await;
    let worker = h.worker(Arc::new(ShellExecutor::new()));

    let first = h.run_once(&worker).await;
    assert!(matches!(first, JobOutcome::Retrying { delay } if delay == Duration::from_secs(2)));
    let pending = h.store.get(&id).await.unwrap();
    assert_eq!(pending.state, JobState::Pending);
    assert_eq!(pending.attempts, 1);
    assert!(pending.next_run_at > pending.updated_at);

    assert_eq!(h.run_once(&worker).await, JobOutcome::DeadLettered);
    let dead = h.store.get(&id).await.unwrap();
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.attempts, 2);

    let dlq = h.store.list_by_state(JobState::Dead).await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].id, id);
}

#[tokio::test]
async fn persisted_backoff_grows_until_dead_after_three_failures() {
    let h = Harness::new().await;
    let id = h.enqueue("thrice", "exit 1", Some(3)).await;
    let worker = h.worker(Arc::new(ShellExecutor::new()));

    let mut scheduled = Vec::new();
    let mut gaps = Vec::new();
    for attempt in 1..=2 {
        let outcome = h.run_once(&worker).await;
        assert!(matches!(outcome, JobOutcome::Retrying { .. }));

        let job = h.store.get(&id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, attempt);
        scheduled.push(job.next_run_at);
        gaps.push(job.next_run_at - job.updated_at);
    }

    assert!(scheduled[1] > scheduled[0]);
    assert!(gaps[1] > gaps[0], "second backoff {:?} not longer than first {:?}", gaps[1], gaps[0]);
    assert!(gaps[0] > TimeDelta::milliseconds(1500) && gaps[0] <= TimeDelta::seconds(2));
    assert!(gaps[1] > TimeDelta::milliseconds(3500) && gaps[1] <= TimeDelta::seconds(4));

    assert_eq!(h.run_once(&worker).await, JobOutcome::DeadLettered);
    let dead = h.store.get(&id).await.unwrap();
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.attempts, 3);
}

#[tokio::test]
async fn zero_max_retries_dies_on_first_failure() {
    let h = Harness::new().await;
    let id = h.enqueue("once", "false", Some(0)).await;
    let worker = h.worker(Arc::new(ShellExecutor::new()));

    assert_eq!(h.run_once(&worker).await, JobOutcome::DeadLettered);
    assert_eq!(h.store.get(&id).await.unwrap().attempts, 1);
}

#[tokio::test]
async fn dlq_retry_revives_job_with_fresh_attempts() {
    let h = Harness::new().await;
    let id = h.enqueue("revive", "exit 7", Some(1)).await;
    let worker = h.worker(Arc::new(ShellExecutor::new()));
    assert_eq!(h.run_once(&worker).await, JobOutcome::DeadLettered);

    let revived = h.store.retry_dead(&id).await.unwrap();
    assert_eq!(revived.state, JobState::Pending);
    assert_eq!(revived.attempts, 0);
    assert!(revived.next_run_at <= Utc::now());

    // Eligible immediately, without skipping backoff.
    let claimed = h.store.claim().await.unwrap().expect("revived job is due");
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.attempts, 1);
}

#[tokio::test]
async fn dlq_retry_of_non_dead_job_is_rejected() {
    let h = Harness::new().await;
    let id = h.enqueue("alive", "true", None).await;

    assert!(matches!(
        h.store.retry_dead(&id).await,
        Err(QueueError::Validation(_))
    ));
    let missing = JobId::parse("missing").unwrap();
    assert!(matches!(
        h.store.retry_dead(&missing).await,
        Err(QueueError::NotFound(_))
    ));
}

#[tokio::test]
async fn duplicate_id_is_refused_and_original_kept() {
    let h = Harness::new().await;
    let id = h.enqueue("dup", "echo first", None).await;

    let again = JobSpec::new("echo second")
        .with_id("dup")
        .into_job(3, Utc::now())
        .unwrap();
    assert!(matches!(
        h.store.enqueue(&again).await,
        Err(QueueError::DuplicateId(_))
    ));
    assert_eq!(h.store.get(&id).await.unwrap().command, "echo first");
}

#[tokio::test]
async fn command_timeout_counts_as_failure() {
    let h = Harness::new().await;
    let id = h.enqueue("slow", "sleep 30", Some(1)).await;
    let executor = ShellExecutor::new().with_timeout(Some(Duration::from_millis(200)));
    let worker = h.worker(Arc::new(executor));

    let started = Instant::now();
    assert_eq!(h.run_once(&worker).await, JobOutcome::DeadLettered);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(h.store.get(&id).await.unwrap().state, JobState::Dead);
}

#[tokio::test]
async fn jobs_survive_reopening_the_database() {
    let h = Harness::new().await;
    h.enqueue("durable", "true", Some(5)).await;
    h.store.close().await;

    let reopened = SqliteJobStore::open(&h.dir.path().join("jobs.db")).await.unwrap();
    let jobs = reopened.list_by_state(JobState::Pending).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].max_retries, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_runs_each_job_exactly_once_and_drains() {
    let h = Harness::new().await;
    let log = h.dir.path().join("ran.log");
    for i in 0..12 {
        let command = format!("echo job-{i} >> '{}'", log.display());
        h.enqueue(&format!("job-{i}"), &command, None).await;
    }

    let config = QueueConfig {
        idle_interval_ms: 20,
        ..QueueConfig::default()
    };
    let manager = PoolManager::new(h.store.clone(), Arc::new(ShellExecutor::new()), config);
    let marker = h.marker();

    let store = h.store.clone();
    let stop = async move {
        wait_until(|| {
            let store = store.clone();
            async move { store.counts_by_state().await.unwrap().completed == 12 }
        })
        .await;
    };
    let summary = manager.run(4, &marker, stop).await.unwrap();

    assert_eq!(summary.stats.jobs_succeeded, 12);
    assert!(!marker.is_present());

    let ran = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = ran.lines().collect();
    let unique: HashSet<&str> = lines.iter().copied().collect();
    assert_eq!(lines.len(), 12);
    assert_eq!(unique.len(), 12);

    let stats = h.store.counts_by_state().await.unwrap();
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.completed, 12);
}

#[tokio::test]
async fn pool_refuses_to_start_twice() {
    let h = Harness::new().await;
    let marker = h.marker();
    let _held = marker.acquire().unwrap();

    let manager = PoolManager::new(
        h.store.clone(),
        Arc::new(ShellExecutor::new()),
        QueueConfig::default(),
    );
    let result = manager.run(1, &marker, async {}).await;
    assert!(matches!(result, Err(QueueError::AlreadyRunning { .. })));
    assert!(marker.is_present());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_grace_kills_hung_command_and_records_failure() {
    let h = Harness::new().await;
    let id = h.enqueue("hung", "sleep 60", None).await;

    let config = QueueConfig {
        idle_interval_ms: 20,
        shutdown_grace_secs: Some(1),
        ..QueueConfig::default()
    };
    let manager = PoolManager::new(h.store.clone(), Arc::new(ShellExecutor::new()), config);
    let marker = h.marker();

    let store = h.store.clone();
    let stop = async move {
        wait_until(|| {
            let store = store.clone();
            async move { store.counts_by_state().await.unwrap().processing == 1 }
        })
        .await;
    };

    let started = Instant::now();
    let summary = manager.run(1, &marker, stop).await.unwrap();
    assert!(summary.killed_in_flight);
    assert!(started.elapsed() < Duration::from_secs(30));

    let job = h.store.get(&id).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(h.store.counts_by_state().await.unwrap().processing, 0);
}
