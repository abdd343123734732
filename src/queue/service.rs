/// Queue service
///
/// The public face of the queue subsystem: validated submission, worker
/// registration, cancellation, status lookups and health reporting on top of
/// any [`JobStore`]. Constructed once at process start and shared by `Arc`.

use crate::config::QueueConfig;
use crate::queue::error::{QueueError, QueueResult};
use crate::queue::store::JobStore;
use crate::queue::types::{JobHandle, JobState, JobSubmission, QueueJob};
use crate::queue::worker::{
    CancellationMap, JobHandler, PoolResources, ResolvedOptions, WorkerOptions, WorkerPool, WorkerSnapshot,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify, RwLock};

/// Overall health verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Error,
}

/// Health report of the queue subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: HealthLevel,
    pub message: String,
    pub active_jobs: u64,
    pub queued_jobs: u64,
    pub failed_jobs: u64,
    /// Worker slots running in this process
    pub workers: usize,
    /// Seconds since `start()`
    pub uptime: u64,
    pub last_health_check: DateTime<Utc>,
    pub worker_stats: Vec<WorkerSnapshot>,
}

/// Queue subsystem handle
pub struct QueueService {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    started: AtomicBool,
    started_at: RwLock<Option<DateTime<Utc>>>,
    shutdown: watch::Sender<bool>,
    pools: Mutex<Vec<WorkerPool>>,
    wakeups: Mutex<HashMap<String, Arc<Notify>>>,
    cancellations: CancellationMap,
    /// Last handler registered per queue, told about jobs that end without running
    handlers: Mutex<HashMap<String, Arc<dyn JobHandler>>>,
    last_health: RwLock<Option<HealthStatus>>,
}

impl QueueService {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            config,
            started: AtomicBool::new(false),
            started_at: RwLock::new(None),
            shutdown,
            pools: Mutex::new(Vec::new()),
            wakeups: Mutex::new(HashMap::new()),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            handlers: Mutex::new(HashMap::new()),
            last_health: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Open the service for submissions and worker registration
    pub async fn start(&self) -> QueueResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.send_replace(false);
        *self.started_at.write().await = Some(Utc::now());
        tracing::info!("🚀 Queue service started (default team size {})", self.config.team_size);
        Ok(())
    }

    /// Stop accepting work and wait for running jobs to finish
    pub async fn stop(&self) -> QueueResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("⏹️ Stopping queue service");
        self.shutdown.send_replace(true);

        let pools: Vec<WorkerPool> = self.pools.lock().await.drain(..).collect();
        for pool in pools {
            pool.join().await;
        }
        *self.started_at.write().await = None;

        tracing::info!("✅ Queue service stopped");
        Ok(())
    }

    fn ensure_started(&self) -> QueueResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(QueueError::NotInitialized)
        }
    }

    async fn wakeup_for(&self, queue_name: &str) -> Arc<Notify> {
        let mut wakeups = self.wakeups.lock().await;
        Arc::clone(
            wakeups
                .entry(queue_name.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    /// Validate and enqueue a job
    ///
    /// Validation runs before anything touches the backend. A job key that is
    /// already in flight fails with `DuplicateSubmission`.
    pub async fn submit_job(&self, submission: JobSubmission) -> QueueResult<JobHandle> {
        submission.validate()?;
        self.ensure_started()?;

        self.store.ensure_queue(&submission.queue_name).await?;

        let redacted = submission.payload.redacted();
        let job = QueueJob::from_submission(submission, self.config.expire_in_secs, Utc::now());
        self.store.insert(&job).await.inspect_err(|e| {
            if let QueueError::DuplicateSubmission { key, .. } = e {
                tracing::warn!("🚫 Rejected duplicate submission for key {} on {}", key, job.queue_name);
            }
        })?;

        tracing::info!("📥 Submitted job {} to queue {}", job.id, job.queue_name);
        tracing::debug!("📦 Job {} payload: {}", job.id, redacted);

        self.wakeup_for(&job.queue_name).await.notify_waiters();
        Ok(job.handle())
    }

    /// Attach a worker pool to a queue
    ///
    /// Registering twice on one queue adds a second pool next to the first.
    pub async fn register_worker(
        &self,
        queue_name: &str,
        handler: Arc<dyn JobHandler>,
        options: WorkerOptions,
    ) -> QueueResult<()> {
        if queue_name.trim().is_empty() {
            return Err(QueueError::Validation("queue name must not be empty".to_string()));
        }
        self.ensure_started()?;
        self.store.ensure_queue(queue_name).await?;

        let resolved = ResolvedOptions::resolve(&options, &self.config);
        let resources = PoolResources {
            store: Arc::clone(&self.store),
            wakeup: self.wakeup_for(queue_name).await,
            cancellations: Arc::clone(&self.cancellations),
            shutdown: self.shutdown.subscribe(),
        };

        self.handlers
            .lock()
            .await
            .insert(queue_name.to_string(), Arc::clone(&handler));

        let mut pools = self.pools.lock().await;
        let first_slot = pools
            .iter()
            .filter(|p| p.queue_name == queue_name)
            .map(|p| p.stats.len())
            .sum();
        pools.push(WorkerPool::spawn(queue_name, handler, resolved, resources, first_slot));
        Ok(())
    }

    /// Request cancellation; returns the job's resulting state, `None` if unknown
    ///
    /// A running handler is not interrupted: it sees the raised flag in its
    /// `JobContext`, and whatever it reports afterwards is ignored. A job with
    /// no running handler is reported to the queue's handler as abandoned.
    pub async fn cancel_job(&self, queue_name: &str, job_id: &str) -> QueueResult<Option<JobState>> {
        self.ensure_started()?;
        let state = self.store.cancel(queue_name, job_id, Utc::now()).await?;

        if state == Some(JobState::Cancelled) {
            let flag = self
                .cancellations
                .lock()
                .await
                .get(&(queue_name.to_string(), job_id.to_string()))
                .cloned();
            match flag {
                Some(flag) => flag.cancel(),
                None => {
                    if let Some(job) = self.store.get(queue_name, job_id).await? {
                        self.notify_abandoned(&job, "job cancelled before dispatch").await;
                    }
                }
            }
            tracing::info!("🛑 Cancelled job {} on queue {}", job_id, queue_name);
        }
        Ok(state)
    }

    async fn notify_abandoned(&self, job: &QueueJob, reason: &str) {
        let handler = self.handlers.lock().await.get(&job.queue_name).cloned();
        if let Some(handler) = handler {
            handler.on_abandoned(job, job.state, reason).await;
        }
    }

    /// Full job record, `None` when the job does not exist
    pub async fn get_job_status(&self, queue_name: &str, job_id: &str) -> QueueResult<Option<QueueJob>> {
        self.ensure_started()?;
        self.store.get(queue_name, job_id).await
    }

    /// Purge terminally failed jobs, returning how many were removed
    pub async fn clear_failed_jobs(&self) -> QueueResult<u64> {
        self.ensure_started()?;
        let removed = self.store.purge_failed().await?;
        tracing::info!("🧹 Cleared {} failed jobs", removed);
        Ok(removed)
    }

    /// Expire overdue jobs and refresh the cached health snapshot
    ///
    /// Returns how many jobs were expired; each one is reported to its
    /// queue's handler.
    pub async fn run_maintenance(&self) -> QueueResult<u64> {
        self.ensure_started()?;
        let expired = self.store.expire_overdue(Utc::now(), self.config.timeout_secs).await?;
        if !expired.is_empty() {
            tracing::warn!("⌛ Maintenance expired {} jobs", expired.len());
        }
        for job in &expired {
            self.notify_abandoned(job, "job expired before it could finish").await;
        }
        self.get_health_status().await;
        Ok(expired.len() as u64)
    }

    /// Health of the subsystem; never fails
    ///
    /// Job counts come from the backend, worker counters are process-local.
    pub async fn get_health_status(&self) -> HealthStatus {
        let now = Utc::now();
        let worker_stats: Vec<WorkerSnapshot> = self
            .pools
            .lock()
            .await
            .iter()
            .flat_map(|pool| pool.stats.iter().map(|s| s.snapshot()))
            .collect();
        let uptime = self
            .started_at
            .read()
            .await
            .map(|since| (now - since).num_seconds().max(0) as u64)
            .unwrap_or(0);

        let mut health = HealthStatus {
            status: HealthLevel::Error,
            message: String::new(),
            active_jobs: 0,
            queued_jobs: 0,
            failed_jobs: 0,
            workers: worker_stats.len(),
            uptime,
            last_health_check: now,
            worker_stats,
        };

        if !self.is_started() {
            health.message = "Queue service is not initialized".to_string();
            return health;
        }

        match self.store.counts().await {
            Ok(counts) => {
                health.active_jobs = counts.active;
                health.queued_jobs = counts.queued();
                health.failed_jobs = counts.failed;

                if counts.failed >= self.config.failed_warning_threshold {
                    health.status = HealthLevel::Warning;
                    health.message = format!("{} failed jobs awaiting attention", counts.failed);
                } else if counts.queued() >= self.config.queued_warning_threshold {
                    health.status = HealthLevel::Warning;
                    health.message = format!("{} jobs queued", counts.queued());
                } else {
                    health.status = HealthLevel::Healthy;
                    health.message = "Queue service is operating normally".to_string();
                }
            }
            Err(e) => {
                tracing::error!("❌ Queue backend health check failed: {}", e);
                health.message = format!("Queue backend unavailable: {}", e);
            }
        }

        *self.last_health.write().await = Some(health.clone());
        health
    }

    /// Snapshot taken by the last health check or maintenance run
    pub async fn cached_health(&self) -> Option<HealthStatus> {
        self.last_health.read().await.clone()
    }
}
