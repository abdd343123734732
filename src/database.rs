/// SQLite database bootstrap
///
/// Opens the shared connection pool and creates every table the engine
/// persists to: workflow catalog, API connections, queue jobs, executions
/// and execution logs. Schema creation is idempotent.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Shared SQLite handle
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to `url`, creating the database file (and its directory) if missing
    pub async fn connect(url: &str) -> Result<Self> {
        if let Some(path) = url.strip_prefix("sqlite://") {
            if let Some(dir) = Path::new(path).parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .map_err(|e| anyhow::anyhow!("Failed to create database directory '{}': {}", dir.display(), e))?;
            }
        }

        tracing::info!("🗄️ Opening database: {}", url);
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let database = Self { pool };
        database.init_schema().await?;
        Ok(database)
    }

    /// Private in-memory database (single connection so every query sees the same data)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let database = Self { pool };
        database.init_schema().await?;
        Ok(database)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create all tables and indexes
    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS api_connections (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                definition JSON NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS queues (
                name TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS queue_jobs (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                job_name TEXT NOT NULL,
                payload JSON NOT NULL,
                state TEXT NOT NULL,
                job_key TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                retry_limit INTEGER,
                retry_delay_secs INTEGER,
                retry_backoff INTEGER NOT NULL DEFAULT 0,
                timeout_secs INTEGER,
                expire_in_secs INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                start_after INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                output JSON,
                last_error TEXT,
                state_history JSON NOT NULL DEFAULT '[]'
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_jobs_key
            ON queue_jobs(queue_name, job_key)
            WHERE job_key IS NOT NULL AND state IN ('created', 'retry', 'active')
            "#,
            "CREATE INDEX IF NOT EXISTS idx_queue_jobs_fetch ON queue_jobs(queue_name, state, priority, created_at)",
            r#"
            CREATE TABLE IF NOT EXISTS workflow_executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                result JSON,
                metadata JSON NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_logs (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                data JSON,
                timestamp INTEGER NOT NULL,
                seq INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_execution_logs_execution ON execution_logs(execution_id, seq)",
            "CREATE INDEX IF NOT EXISTS idx_executions_workflow ON workflow_executions(workflow_id)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

/// Timestamps are stored as epoch milliseconds so SQL can do arithmetic on them
pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}
