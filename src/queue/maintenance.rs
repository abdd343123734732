/// Background queue maintenance
///
/// Runs on a tokio-cron-scheduler schedule: expires jobs that waited too long
/// or whose worker went silent, and refreshes the cached health snapshot.

use crate::queue::service::QueueService;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

pub struct QueueMaintenance {
    scheduler: Arc<RwLock<JobScheduler>>,
    job_uuid: RwLock<Option<Uuid>>,
    queue: Arc<QueueService>,
    schedule: String,
}

impl QueueMaintenance {
    pub async fn new(queue: Arc<QueueService>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        let schedule = queue.config().maintenance_schedule.clone();

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid: RwLock::new(None),
            queue,
            schedule,
        })
    }

    /// Register the sweep and start the scheduler
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting queue maintenance ({})", self.schedule);

        let queue = Arc::clone(&self.queue);
        let job = Job::new_async(self.schedule.as_str(), move |_uuid, _l| {
            let queue = Arc::clone(&queue);
            Box::pin(async move {
                tracing::debug!("🔔 Queue maintenance tick");
                match queue.run_maintenance().await {
                    Ok(expired) => tracing::debug!("🧹 Maintenance finished, {} jobs expired", expired),
                    Err(e) => tracing::error!("❌ Queue maintenance failed: {}", e),
                }
            })
        })?;

        let uuid = {
            let scheduler = self.scheduler.write().await;
            let uuid = scheduler.add(job).await?;
            scheduler.start().await?;
            uuid
        };
        *self.job_uuid.write().await = Some(uuid);

        tracing::info!("✅ Queue maintenance scheduled");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping queue maintenance");

        if let Some(uuid) = self.job_uuid.write().await.take() {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&uuid).await {
                tracing::warn!("⚠️ Failed to remove maintenance job: {}", e);
            }
        }

        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::queue::store::{JobStore, MemoryJobStore};
    use crate::queue::types::{
        JobOptions, JobPayload, JobState, JobSubmission, WorkflowExecutionJob, WORKFLOW_EXECUTION_JOB,
        WORKFLOW_EXECUTION_QUEUE,
    };
    use std::time::Duration;

    #[tokio::test]
    async fn test_scheduled_sweep_expires_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let config = QueueConfig {
            expire_in_secs: 1,
            maintenance_schedule: "* * * * * *".to_string(),
            ..QueueConfig::default()
        };
        let queue = Arc::new(QueueService::new(store.clone(), config));
        queue.start().await.unwrap();

        let payload = JobPayload::WorkflowExecution(WorkflowExecutionJob {
            execution_id: "exec-1".to_string(),
            workflow_id: "wf-1".to_string(),
            user_id: "user-1".to_string(),
            parameters: serde_json::json!({}),
        });
        let handle = queue
            .submit_job(
                JobSubmission::new(WORKFLOW_EXECUTION_QUEUE, WORKFLOW_EXECUTION_JOB, payload)
                    .with_options(JobOptions::default()),
            )
            .await
            .unwrap();

        let maintenance = QueueMaintenance::new(Arc::clone(&queue)).await.unwrap();
        maintenance.start().await.unwrap();

        let mut state = JobState::Created;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            state = store.get(&handle.queue_name, &handle.job_id).await.unwrap().unwrap().state;
            if state == JobState::Expired {
                break;
            }
        }
        assert_eq!(state, JobState::Expired);
        assert!(queue.cached_health().await.is_some());

        maintenance.stop().await.unwrap();
        queue.stop().await.unwrap();
    }
}
