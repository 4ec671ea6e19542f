//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use queuectl_core::{Job, JobId, JobState, QueueError, QueueResult};

/// Job store abstraction.
///
/// The store is the only shared mutable resource in the queue. `claim_due`
/// is the one operation whose atomicity is load-bearing: two concurrent
/// callers must never receive the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `Pending` job, due at its `created_at` with no attempts.
    /// Fails with `DuplicateId` if the id is taken.
    async fn enqueue(&self, job: &Job) -> QueueResult<()>;

    /// Atomically claim the oldest job that is `Pending` and due at `now`.
    ///
    /// The returned job is already `Processing` with its attempt counted.
    /// Returns `None` when nothing is eligible.
    async fn claim_due(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>>;

    /// Claim against the wall clock.
    async fn claim(&self) -> QueueResult<Option<Job>> {
        self.claim_due(Utc::now()).await
    }

    /// Persist `state`, `attempts` and `next_run_at`, refreshing `updated_at`.
    async fn update(&self, job: &mut Job) -> QueueResult<()>;

    async fn get(&self, id: &JobId) -> QueueResult<Job>;

    /// Jobs in `state`, oldest first.
    async fn list_by_state(&self, state: JobState) -> QueueResult<Vec<Job>>;

    async fn counts_by_state(&self) -> QueueResult<JobStats>;

    /// Operator retry: move a `Dead` job back to `Pending` with zero attempts.
    async fn retry_dead(&self, id: &JobId) -> QueueResult<Job>;
}

/// Number of jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobStats {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn add(&mut self, state: JobState, count: u64) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Dead => &mut self.dead,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        JobState::ALL.into_iter().map(|s| self.get(s)).sum()
    }
}

#[derive(Debug)]
struct Slot {
    /// Insertion order, breaks `created_at` ties
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    jobs: HashMap<JobId, Slot>,
}

/// In-memory job store for tests and benches.
///
/// A single write lock makes every claim a serialized read-modify-write.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> QueueResult<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| QueueError::storage("in-memory job store lock poisoned"))
    }

    fn write(&self) -> QueueResult<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| QueueError::storage("in-memory job store lock poisoned"))
    }

    fn sorted(inner: &Inner, keep: impl Fn(&Job) -> bool) -> Vec<Job> {
        let mut slots: Vec<_> = inner.jobs.values().filter(|s| keep(&s.job)).collect();
        slots.sort_by_key(|s| (s.job.created_at, s.seq));
        slots.into_iter().map(|s| s.job.clone()).collect()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(QueueError::DuplicateId(job.id.clone()));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let mut job = job.clone();
        job.state = JobState::Pending;
        job.attempts = 0;
        job.next_run_at = job.created_at;
        inner.jobs.insert(job.id.clone(), Slot { seq, job });
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let mut inner = self.write()?;

        // Oldest eligible job, FIFO by creation then insertion.
        let next = inner
            .jobs
            .values()
            .filter(|s| s.job.is_eligible(now))
            .min_by_key(|s| (s.job.created_at, s.seq))
            .map(|s| s.job.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(slot) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        slot.job.claim(now)?;
        Ok(Some(slot.job.clone()))
    }

    async fn update(&self, job: &mut Job) -> QueueResult<()> {
        let mut inner = self.write()?;
        let slot = inner
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| QueueError::NotFound(job.id.clone()))?;

        job.updated_at = Utc::now();
        slot.job.state = job.state;
        slot.job.attempts = job.attempts;
        slot.job.next_run_at = job.next_run_at;
        slot.job.updated_at = job.updated_at;
        Ok(())
    }

    async fn get(&self, id: &JobId) -> QueueResult<Job> {
        let inner = self.read()?;
        inner
            .jobs
            .get(id)
            .map(|s| s.job.clone())
            .ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    async fn list_by_state(&self, state: JobState) -> QueueResult<Vec<Job>> {
        let inner = self.read()?;
        Ok(Self::sorted(&inner, |j| j.state == state))
    }

    async fn counts_by_state(&self) -> QueueResult<JobStats> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for slot in inner.jobs.values() {
            stats.add(slot.job.state, 1);
        }
        Ok(stats)
    }

    async fn retry_dead(&self, id: &JobId) -> QueueResult<Job> {
        let mut inner = self.write()?;
        let slot = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        slot.job.revive(Utc::now())?;
        Ok(slot.job.clone())
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        (**self).enqueue(job).await
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        (**self).claim_due(now).await
    }

    async fn update(&self, job: &mut Job) -> QueueResult<()> {
        (**self).update(job).await
    }

    async fn get(&self, id: &JobId) -> QueueResult<Job> {
        (**self).get(id).await
    }

    async fn list_by_state(&self, state: JobState) -> QueueResult<Vec<Job>> {
        (**self).list_by_state(state).await
    }

    async fn counts_by_state(&self) -> QueueResult<JobStats> {
        (**self).counts_by_state().await
    }

    async fn retry_dead(&self, id: &JobId) -> QueueResult<Job> {
        (**self).retry_dead(id).await
    }
}
