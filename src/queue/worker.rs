/// Worker pools
///
/// A pool is `team_size` independent slots polling one queue. Each slot runs
/// exactly one job to completion before fetching the next, so a queue never
/// has more than `team_size` jobs active from one pool and every handler
/// invocation maps to exactly one job outcome.

use crate::config::QueueConfig;
use crate::queue::store::JobStore;
use crate::queue::types::{CancellationFlag, JobContext, JobState, QueueJob, RetryPolicy};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

/// Flags of the jobs currently running, keyed by `(queue, job id)`
pub(crate) type CancellationMap = Arc<Mutex<HashMap<(String, String), CancellationFlag>>>;

/// Processes one dispatched job
///
/// `Ok` completes the job (the value is stored as its output); `Err` is a
/// failed attempt and the queue applies the retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueueJob, ctx: JobContext) -> anyhow::Result<Option<Value>>;

    /// The job reached `failed`, `expired` or `cancelled` without completing
    ///
    /// Fires after a final failed or timed-out attempt, a maintenance expiry,
    /// or a cancellation that found no running handler. May fire more than
    /// once for the same job.
    async fn on_abandoned(&self, _job: &QueueJob, _state: JobState, _reason: &str) {}
}

/// Adapter turning an async closure into a [`JobHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(QueueJob, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send,
{
    async fn handle(&self, job: &QueueJob, ctx: JobContext) -> anyhow::Result<Option<Value>> {
        (self.0)(job.clone(), ctx).await
    }
}

/// Box an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(QueueJob, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Options passed to `register_worker`; unset values use the service defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOptions {
    pub team_size: Option<usize>,
    /// Seconds a handler invocation may run
    pub timeout: Option<u64>,
    pub retry_limit: Option<u32>,
    /// Seconds between attempts
    pub retry_delay: Option<u64>,
}

/// Worker options after falling back to the service configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedOptions {
    pub team_size: usize,
    pub timeout: Duration,
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
}

impl ResolvedOptions {
    pub fn resolve(options: &WorkerOptions, config: &QueueConfig) -> Self {
        Self {
            team_size: options.team_size.unwrap_or(config.team_size).max(1),
            timeout: options.timeout.map(Duration::from_secs).unwrap_or_else(|| config.timeout()),
            retry_limit: options.retry_limit.unwrap_or(config.retry_limit),
            retry_delay: options
                .retry_delay
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.retry_delay()),
            poll_interval: config.poll_interval(),
        }
    }

    /// Job options win over worker options
    pub fn policy_for(&self, job: &QueueJob) -> RetryPolicy {
        RetryPolicy {
            retry_limit: job.retry_limit.unwrap_or(self.retry_limit),
            retry_delay: job.retry_delay_secs.map(Duration::from_secs).unwrap_or(self.retry_delay),
            backoff: job.retry_backoff,
        }
    }

    pub fn timeout_for(&self, job: &QueueJob) -> Duration {
        job.timeout_secs.map(Duration::from_secs).unwrap_or(self.timeout)
    }
}

/// Process-local counters for one worker slot
#[derive(Debug)]
pub struct WorkerStats {
    pub worker_id: String,
    pub queue_name: String,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Serializable copy of a slot's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub queue_name: String,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl WorkerStats {
    fn new(queue_name: &str, slot: usize) -> Self {
        Self {
            worker_id: format!("{}#{}", queue_name, slot),
            queue_name: queue_name.to_string(),
            active: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id.clone(),
            queue_name: self.queue_name.clone(),
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Shared plumbing every slot of a pool needs
#[derive(Clone)]
pub(crate) struct PoolResources {
    pub store: Arc<dyn JobStore>,
    pub wakeup: Arc<Notify>,
    pub cancellations: CancellationMap,
    pub shutdown: watch::Receiver<bool>,
}

/// A running pool attached to one queue
pub(crate) struct WorkerPool {
    pub queue_name: String,
    pub stats: Vec<Arc<WorkerStats>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        queue_name: &str,
        handler: Arc<dyn JobHandler>,
        options: ResolvedOptions,
        resources: PoolResources,
        first_slot: usize,
    ) -> Self {
        let mut stats = Vec::with_capacity(options.team_size);
        let mut handles = Vec::with_capacity(options.team_size);

        for slot in first_slot..first_slot + options.team_size {
            let worker = Worker {
                queue_name: queue_name.to_string(),
                handler: Arc::clone(&handler),
                options,
                store: Arc::clone(&resources.store),
                wakeup: Arc::clone(&resources.wakeup),
                cancellations: Arc::clone(&resources.cancellations),
                stats: Arc::new(WorkerStats::new(queue_name, slot)),
            };
            stats.push(Arc::clone(&worker.stats));
            handles.push(tokio::spawn(worker.run(resources.shutdown.clone())));
        }

        tracing::info!("👷 Started {} workers on queue {}", options.team_size, queue_name);
        Self {
            queue_name: queue_name.to_string(),
            stats,
            handles,
        }
    }

    /// Wait for every slot to finish its current job and exit
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("❌ Worker on queue {} panicked: {}", self.queue_name, e);
            }
        }
    }
}

struct Worker {
    queue_name: String,
    handler: Arc<dyn JobHandler>,
    options: ResolvedOptions,
    store: Arc<dyn JobStore>,
    wakeup: Arc<Notify>,
    cancellations: CancellationMap,
    stats: Arc<WorkerStats>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!("🔄 Worker {} polling", self.stats.worker_id);

        while !*shutdown.borrow() {
            match self.store.fetch_next(&self.queue_name, Utc::now()).await {
                Ok(Some(job)) => {
                    self.process(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("⚠️ Worker {} could not fetch jobs: {}", self.stats.worker_id, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                _ = self.wakeup.notified() => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::debug!("🛑 Worker {} stopped", self.stats.worker_id);
    }

    async fn process(&self, job: QueueJob) {
        let policy = self.options.policy_for(&job);
        let timeout = self.options.timeout_for(&job);
        let flag = CancellationFlag::new();
        let slot = (job.queue_name.clone(), job.id.clone());
        self.cancellations.lock().await.insert(slot.clone(), flag.clone());

        let ctx = JobContext {
            attempt: job.retry_count + 1,
            max_attempts: policy.retry_limit + 1,
            cancellation: flag,
        };

        tracing::info!(
            "▶️ Job {} ({}) attempt {}/{} on {}",
            job.id,
            job.job_name,
            ctx.attempt,
            ctx.max_attempts,
            self.stats.worker_id
        );

        self.stats.active.fetch_add(1, Ordering::SeqCst);
        let outcome = match tokio::time::timeout(timeout, self.handler.handle(&job, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("job timed out after {}s", timeout.as_secs())),
        };
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        self.cancellations.lock().await.remove(&slot);

        let now = Utc::now();
        match outcome {
            Ok(output) => match self.store.complete(&job.queue_name, &job.id, output, now).await {
                Ok(JobState::Completed) => {
                    self.stats.completed.fetch_add(1, Ordering::SeqCst);
                    tracing::info!("✅ Job {} completed", job.id);
                }
                Ok(state) => {
                    tracing::debug!("⏭️ Job {} finished but is already {}", job.id, state);
                    self.abandoned(&job, state, &format!("job {}", state)).await;
                }
                Err(e) => tracing::error!("❌ Failed to record completion of job {}: {}", job.id, e),
            },
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                let message = err.to_string();
                match self.store.fail(&job.queue_name, &job.id, &message, policy, now).await {
                    Ok(JobState::Retry) => tracing::warn!(
                        "🔁 Job {} failed (attempt {}), retrying: {}",
                        job.id,
                        job.retry_count + 1,
                        message
                    ),
                    Ok(JobState::Failed) => {
                        tracing::error!("❌ Job {} failed permanently: {}", job.id, message);
                        self.abandoned(&job, JobState::Failed, &message).await;
                    }
                    Ok(state) => {
                        tracing::debug!("⏭️ Job {} failed but is already {}", job.id, state);
                        self.abandoned(&job, state, &message).await;
                    }
                    Err(e) => tracing::error!("❌ Failed to record failure of job {}: {}", job.id, e),
                }
            }
        }
    }

    async fn abandoned(&self, job: &QueueJob, state: JobState, reason: &str) {
        if matches!(state, JobState::Failed | JobState::Expired | JobState::Cancelled) {
            self.handler.on_abandoned(job, state, reason).await;
        }
    }
}
