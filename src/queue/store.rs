/// Job store abstraction
///
/// The queue service talks to its durable backend only through [`JobStore`],
/// so the SQLite store and the in-memory store are interchangeable.

use crate::queue::error::{QueueError, QueueResult};
use crate::queue::types::{JobCounts, JobState, QueueJob, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Durable job backend
///
/// Implementations must enforce the job state machine: a job in a terminal
/// state is never moved again, and `complete`/`fail` on a job that is no
/// longer `active` leave it untouched and report its current state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotently create a queue
    async fn ensure_queue(&self, queue_name: &str) -> QueueResult<()>;

    /// Persist a new job; fails with `DuplicateSubmission` when its key is in flight
    async fn insert(&self, job: &QueueJob) -> QueueResult<()>;

    /// Claim the next eligible job of a queue, moving it to `active`
    async fn fetch_next(&self, queue_name: &str, now: DateTime<Utc>) -> QueueResult<Option<QueueJob>>;

    /// Mark an active job completed
    async fn complete(
        &self,
        queue_name: &str,
        job_id: &str,
        output: Option<Value>,
        now: DateTime<Utc>,
    ) -> QueueResult<JobState>;

    /// Record a failed attempt: `retry` while retries remain, `failed` afterwards
    async fn fail(
        &self,
        queue_name: &str,
        job_id: &str,
        error: &str,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<JobState>;

    /// Cancel a job; returns the resulting state, `None` if the job is unknown
    async fn cancel(&self, queue_name: &str, job_id: &str, now: DateTime<Utc>) -> QueueResult<Option<JobState>>;

    async fn get(&self, queue_name: &str, job_id: &str) -> QueueResult<Option<QueueJob>>;

    /// Expire queued jobs past their expiry and active jobs whose worker went silent
    ///
    /// Returns the jobs it expired so their owners can be told.
    async fn expire_overdue(&self, now: DateTime<Utc>, fallback_timeout_secs: u64) -> QueueResult<Vec<QueueJob>>;

    /// Delete terminal `failed` jobs
    async fn purge_failed(&self) -> QueueResult<u64>;

    async fn counts(&self) -> QueueResult<JobCounts>;
}

/// Move a job to `next`, keeping its history in step
pub(crate) fn apply_state(job: &mut QueueJob, next: JobState, now: DateTime<Utc>) {
    job.state = next;
    job.state_history.push(next);
    match next {
        JobState::Active => job.started_at = Some(now),
        s if s.is_terminal() => job.completed_at = Some(now),
        _ => {}
    }
}

/// True when a queued job has waited longer than its expiry window
pub(crate) fn queued_overdue(job: &QueueJob, now: DateTime<Utc>) -> bool {
    job.state.is_queued() && job.start_after + chrono::Duration::seconds(job.expire_in_secs as i64) < now
}

/// True when an active job has outlived its timeout plus the expiry grace
pub(crate) fn active_overdue(job: &QueueJob, now: DateTime<Utc>, fallback_timeout_secs: u64) -> bool {
    match (job.state, job.started_at) {
        (JobState::Active, Some(started)) => {
            let budget = job.timeout_secs.unwrap_or(fallback_timeout_secs) + job.expire_in_secs;
            started + chrono::Duration::seconds(budget as i64) < now
        }
        _ => false,
    }
}

/// In-memory job store
///
/// Used by tests and single-process deployments. `set_available(false)`
/// simulates a backend outage.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    queues: Mutex<HashSet<String>>,
    jobs: Mutex<HashMap<(String, String), QueueJob>>,
    offline: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    fn check_online(&self) -> QueueResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(QueueError::Backend("memory backend is offline".to_string()));
        }
        Ok(())
    }

    /// Number of queues created so far
    pub async fn queue_count(&self) -> usize {
        self.queues.lock().await.len()
    }

    /// Number of stored jobs in any state
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

fn key(queue_name: &str, job_id: &str) -> (String, String) {
    (queue_name.to_string(), job_id.to_string())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn ensure_queue(&self, queue_name: &str) -> QueueResult<()> {
        self.check_online()?;
        self.queues.lock().await.insert(queue_name.to_string());
        Ok(())
    }

    async fn insert(&self, job: &QueueJob) -> QueueResult<()> {
        self.check_online()?;
        let mut jobs = self.jobs.lock().await;

        if let Some(job_key) = &job.job_key {
            let in_flight = jobs.values().any(|existing| {
                existing.queue_name == job.queue_name
                    && existing.job_key.as_deref() == Some(job_key.as_str())
                    && !existing.state.is_terminal()
            });
            if in_flight {
                return Err(QueueError::DuplicateSubmission {
                    queue: job.queue_name.clone(),
                    key: job_key.clone(),
                });
            }
        }

        jobs.insert(key(&job.queue_name, &job.id), job.clone());
        Ok(())
    }

    async fn fetch_next(&self, queue_name: &str, now: DateTime<Utc>) -> QueueResult<Option<QueueJob>> {
        self.check_online()?;
        let mut jobs = self.jobs.lock().await;

        // Overdue jobs are left for the maintenance sweep to expire
        let next_key = jobs
            .values()
            .filter(|j| {
                j.queue_name == queue_name && j.state.is_queued() && j.start_after <= now && !queued_overdue(j, now)
            })
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|j| key(&j.queue_name, &j.id));

        Ok(next_key.and_then(|k| {
            jobs.get_mut(&k).map(|job| {
                apply_state(job, JobState::Active, now);
                job.clone()
            })
        }))
    }

    async fn complete(
        &self,
        queue_name: &str,
        job_id: &str,
        output: Option<Value>,
        now: DateTime<Utc>,
    ) -> QueueResult<JobState> {
        self.check_online()?;
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&key(queue_name, job_id))
            .ok_or_else(|| QueueError::Backend(format!("job {} not found", job_id)))?;

        if job.state.can_transition_to(JobState::Completed) {
            job.output = output;
            apply_state(job, JobState::Completed, now);
        }
        Ok(job.state)
    }

    async fn fail(
        &self,
        queue_name: &str,
        job_id: &str,
        error: &str,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<JobState> {
        self.check_online()?;
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&key(queue_name, job_id))
            .ok_or_else(|| QueueError::Backend(format!("job {} not found", job_id)))?;

        if job.state != JobState::Active {
            return Ok(job.state);
        }

        job.last_error = Some(error.to_string());
        if job.retry_count < policy.retry_limit {
            job.retry_count += 1;
            let delay = policy.delay_for(job.retry_count);
            job.start_after = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
            apply_state(job, JobState::Retry, now);
        } else {
            apply_state(job, JobState::Failed, now);
        }
        Ok(job.state)
    }

    async fn cancel(&self, queue_name: &str, job_id: &str, now: DateTime<Utc>) -> QueueResult<Option<JobState>> {
        self.check_online()?;
        let mut jobs = self.jobs.lock().await;
        Ok(jobs.get_mut(&key(queue_name, job_id)).map(|job| {
            if job.state.can_transition_to(JobState::Cancelled) {
                apply_state(job, JobState::Cancelled, now);
            }
            job.state
        }))
    }

    async fn get(&self, queue_name: &str, job_id: &str) -> QueueResult<Option<QueueJob>> {
        self.check_online()?;
        Ok(self.jobs.lock().await.get(&key(queue_name, job_id)).cloned())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>, fallback_timeout_secs: u64) -> QueueResult<Vec<QueueJob>> {
        self.check_online()?;
        let mut jobs = self.jobs.lock().await;
        let mut expired = Vec::new();
        for job in jobs.values_mut() {
            if queued_overdue(job, now) || active_overdue(job, now, fallback_timeout_secs) {
                apply_state(job, JobState::Expired, now);
                expired.push(job.clone());
            }
        }
        Ok(expired)
    }

    async fn purge_failed(&self) -> QueueResult<u64> {
        self.check_online()?;
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|_, job| job.state != JobState::Failed);
        Ok((before - jobs.len()) as u64)
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        self.check_online()?;
        let jobs = self.jobs.lock().await;
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }
}
