/// SQLite-backed job store
///
/// Every state change is a single conditional UPDATE guarded by the expected
/// current state, so concurrent workers sharing the database never claim the
/// same job twice or move a job out of a terminal state.

use crate::database::{from_millis, to_millis, Database};
use crate::queue::error::{QueueError, QueueResult};
use crate::queue::store::JobStore;
use crate::queue::types::{JobCounts, JobState, QueueJob, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

const JOB_COLUMNS: &str = "id, queue_name, job_name, payload, state, job_key, priority, retry_limit, \
     retry_delay_secs, retry_backoff, timeout_secs, expire_in_secs, retry_count, start_after, \
     created_at, started_at, completed_at, output, last_error, state_history";

/// Durable job store on the shared SQLite pool
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
        }
    }

    async fn current_state(&self, queue_name: &str, job_id: &str) -> QueueResult<Option<JobState>> {
        let row = sqlx::query("SELECT state FROM queue_jobs WHERE queue_name = ? AND id = ?")
            .bind(queue_name)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.get::<String, _>("state").parse()?)),
            None => Ok(None),
        }
    }
}

fn row_to_job(row: &SqliteRow) -> QueueResult<QueueJob> {
    let payload: String = row.try_get("payload")?;
    let state: String = row.try_get("state")?;
    let output: Option<String> = row.try_get("output")?;
    let history: String = row.try_get("state_history")?;

    Ok(QueueJob {
        id: row.try_get("id")?,
        queue_name: row.try_get("queue_name")?,
        job_name: row.try_get("job_name")?,
        payload: serde_json::from_str(&payload)?,
        state: state.parse()?,
        job_key: row.try_get("job_key")?,
        priority: row.try_get::<i64, _>("priority")? as i32,
        retry_limit: row.try_get::<Option<i64>, _>("retry_limit")?.map(|v| v as u32),
        retry_delay_secs: row.try_get::<Option<i64>, _>("retry_delay_secs")?.map(|v| v as u64),
        retry_backoff: row.try_get("retry_backoff")?,
        timeout_secs: row.try_get::<Option<i64>, _>("timeout_secs")?.map(|v| v as u64),
        expire_in_secs: row.try_get::<i64, _>("expire_in_secs")? as u64,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        start_after: from_millis(row.try_get("start_after")?),
        created_at: from_millis(row.try_get("created_at")?),
        started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_millis),
        completed_at: row.try_get::<Option<i64>, _>("completed_at")?.map(from_millis),
        output: output.map(|o| serde_json::from_str(&o)).transpose()?,
        last_error: row.try_get("last_error")?,
        state_history: serde_json::from_str(&history)?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn ensure_queue(&self, queue_name: &str) -> QueueResult<()> {
        sqlx::query("INSERT OR IGNORE INTO queues (name, created_at) VALUES (?, ?)")
            .bind(queue_name)
            .bind(to_millis(Utc::now()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert(&self, job: &QueueJob) -> QueueResult<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO queue_jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            JOB_COLUMNS
        ))
        .bind(&job.id)
        .bind(&job.queue_name)
        .bind(&job.job_name)
        .bind(serde_json::to_string(&job.payload)?)
        .bind(job.state.as_str())
        .bind(&job.job_key)
        .bind(job.priority as i64)
        .bind(job.retry_limit.map(|v| v as i64))
        .bind(job.retry_delay_secs.map(|v| v as i64))
        .bind(job.retry_backoff)
        .bind(job.timeout_secs.map(|v| v as i64))
        .bind(job.expire_in_secs as i64)
        .bind(job.retry_count as i64)
        .bind(to_millis(job.start_after))
        .bind(to_millis(job.created_at))
        .bind(job.started_at.map(to_millis))
        .bind(job.completed_at.map(to_millis))
        .bind(job.output.as_ref().map(|o| o.to_string()))
        .bind(&job.last_error)
        .bind(serde_json::to_string(&job.state_history)?)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(QueueError::DuplicateSubmission {
                queue: job.queue_name.clone(),
                key: job.job_key.clone().unwrap_or_default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_next(&self, queue_name: &str, now: DateTime<Utc>) -> QueueResult<Option<QueueJob>> {
        let now_ms = to_millis(now);

        let row = sqlx::query(&format!(
            r#"
            UPDATE queue_jobs
            SET state = 'active', started_at = ?, state_history = json_insert(state_history, '$[#]', 'active')
            WHERE id = (
                SELECT id FROM queue_jobs
                WHERE queue_name = ? AND state IN ('created', 'retry') AND start_after <= ?
                  AND start_after + expire_in_secs * 1000 >= ?
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            ) AND state IN ('created', 'retry')
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(now_ms)
        .bind(queue_name)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn complete(
        &self,
        queue_name: &str,
        job_id: &str,
        output: Option<Value>,
        now: DateTime<Utc>,
    ) -> QueueResult<JobState> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'completed', completed_at = ?, output = ?,
                state_history = json_insert(state_history, '$[#]', 'completed')
            WHERE queue_name = ? AND id = ? AND state = 'active'
            "#,
        )
        .bind(to_millis(now))
        .bind(output.map(|o| o.to_string()))
        .bind(queue_name)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        self.current_state(queue_name, job_id)
            .await?
            .ok_or_else(|| QueueError::Backend(format!("job {} not found", job_id)))
    }

    async fn fail(
        &self,
        queue_name: &str,
        job_id: &str,
        error: &str,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<JobState> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state, retry_count FROM queue_jobs WHERE queue_name = ? AND id = ?")
            .bind(queue_name)
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| QueueError::Backend(format!("job {} not found", job_id)))?;

        let state: JobState = row.get::<String, _>("state").parse()?;
        if state != JobState::Active {
            return Ok(state);
        }

        let retry_count = row.get::<i64, _>("retry_count") as u32;
        let next = if retry_count < policy.retry_limit {
            let retry = retry_count + 1;
            let start_after = now + chrono::Duration::milliseconds(policy.delay_for(retry).as_millis() as i64);
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET state = 'retry', retry_count = ?, start_after = ?, last_error = ?,
                    state_history = json_insert(state_history, '$[#]', 'retry')
                WHERE queue_name = ? AND id = ? AND state = 'active'
                "#,
            )
            .bind(retry as i64)
            .bind(to_millis(start_after))
            .bind(error)
            .bind(queue_name)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            JobState::Retry
        } else {
            sqlx::query(
                r#"
                UPDATE queue_jobs
                SET state = 'failed', completed_at = ?, last_error = ?,
                    state_history = json_insert(state_history, '$[#]', 'failed')
                WHERE queue_name = ? AND id = ? AND state = 'active'
                "#,
            )
            .bind(to_millis(now))
            .bind(error)
            .bind(queue_name)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            JobState::Failed
        };

        tx.commit().await?;
        Ok(next)
    }

    async fn cancel(&self, queue_name: &str, job_id: &str, now: DateTime<Utc>) -> QueueResult<Option<JobState>> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'cancelled', completed_at = ?,
                state_history = json_insert(state_history, '$[#]', 'cancelled')
            WHERE queue_name = ? AND id = ? AND state IN ('created', 'retry', 'active')
            "#,
        )
        .bind(to_millis(now))
        .bind(queue_name)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        self.current_state(queue_name, job_id).await
    }

    async fn get(&self, queue_name: &str, job_id: &str) -> QueueResult<Option<QueueJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM queue_jobs WHERE queue_name = ? AND id = ?",
            JOB_COLUMNS
        ))
        .bind(queue_name)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn expire_overdue(&self, now: DateTime<Utc>, fallback_timeout_secs: u64) -> QueueResult<Vec<QueueJob>> {
        let now_ms = to_millis(now);

        let rows = sqlx::query(&format!(
            r#"
            UPDATE queue_jobs
            SET state = 'expired', completed_at = ?, state_history = json_insert(state_history, '$[#]', 'expired')
            WHERE (state IN ('created', 'retry') AND start_after + expire_in_secs * 1000 < ?)
               OR (state = 'active' AND started_at + (COALESCE(timeout_secs, ?) + expire_in_secs) * 1000 < ?)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(now_ms)
        .bind(now_ms)
        .bind(fallback_timeout_secs as i64)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn purge_failed(&self) -> QueueResult<u64> {
        let result = sqlx::query("DELETE FROM queue_jobs WHERE state = 'failed'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM queue_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: JobState = row.get::<String, _>("state").parse()?;
            counts.add(state, row.get::<i64, _>("total") as u64);
        }
        Ok(counts)
    }
}
