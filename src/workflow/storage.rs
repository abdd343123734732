/// SQLite persistence layer for the workflow catalog
///
/// Workflows and API connections are stored as JSON definitions with a few
/// indexed lookup columns next to them.

use crate::database::Database;
use crate::workflow::catalog::{ConnectionSource, WorkflowSource};
use crate::workflow::types::{ApiConnection, Workflow};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    pool: SqlitePool,
}

/// Basic workflow metadata for listing operations
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowMetadata {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl WorkflowStorage {
    pub fn new(database: &Database) -> Self {
        Self {
            pool: database.pool().clone(),
        }
    }

    /// Store a new workflow or update an existing one
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let definition_json = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, owner_id, name, status, definition, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                name = excluded.name,
                status = excluded.status,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.owner_id)
        .bind(&workflow.name)
        .bind(workflow.status.as_str())
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// List workflows of one owner, most recently updated first
    pub async fn list_workflows(&self, owner_id: &str) -> Result<Vec<WorkflowMetadata>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, name, status,
                   CAST(created_at AS TEXT) AS created_at, CAST(updated_at AS TEXT) AS updated_at
            FROM workflows WHERE owner_id = ? ORDER BY updated_at DESC, id
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| WorkflowMetadata {
                id: row.get("id"),
                owner_id: row.get("owner_id"),
                name: row.get("name"),
                status: row.get("status"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// Every workflow keyed by id, for registry initialization
    pub async fn load_all_workflows(&self) -> Result<HashMap<String, Workflow>> {
        let rows = sqlx::query("SELECT id, definition FROM workflows")
            .fetch_all(&self.pool)
            .await?;

        let mut workflows = HashMap::new();
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            workflows.insert(id, serde_json::from_str(&definition_json)?);
        }

        Ok(workflows)
    }

    pub async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn save_connection(&self, connection: &ApiConnection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_connections (id, user_id, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&connection.id)
        .bind(&connection.user_id)
        .bind(serde_json::to_string(connection)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_connection(&self, id: &str) -> Result<Option<ApiConnection>> {
        let row = sqlx::query("SELECT definition FROM api_connections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    pub async fn load_all_connections(&self) -> Result<HashMap<String, ApiConnection>> {
        let rows = sqlx::query("SELECT id, definition FROM api_connections")
            .fetch_all(&self.pool)
            .await?;

        let mut connections = HashMap::new();
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            connections.insert(id, serde_json::from_str(&definition_json)?);
        }

        Ok(connections)
    }
}

/// Direct reads, bypassing any registry snapshot
#[async_trait]
impl WorkflowSource for WorkflowStorage {
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        WorkflowStorage::get_workflow(self, id).await
    }
}

#[async_trait]
impl ConnectionSource for WorkflowStorage {
    async fn get_connection(&self, id: &str) -> Result<Option<ApiConnection>> {
        WorkflowStorage::get_connection(self, id).await
    }
}
