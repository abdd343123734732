/// Hot-reload workflow registry using ArcSwap
///
/// Lock-free reads of the workflow catalog. Every change goes to storage
/// first and then swaps the whole in-memory map, so executions that already
/// loaded a workflow keep their snapshot while new ones see the update.

use crate::workflow::catalog::{ConnectionSource, WorkflowSource};
use crate::workflow::storage::{WorkflowMetadata, WorkflowStorage};
use crate::workflow::types::{ApiConnection, StepType, Workflow};
use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug)]
pub struct WorkflowRegistry {
    /// Key: workflow_id
    workflows: ArcSwap<HashMap<String, Arc<Workflow>>>,
    /// Key: connection_id
    connections: ArcSwap<HashMap<String, ApiConnection>>,
    storage: WorkflowStorage,
}

impl WorkflowRegistry {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            connections: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    pub fn storage(&self) -> &WorkflowStorage {
        &self.storage
    }

    /// Populate the registry from storage at startup
    ///
    /// Definitions that no longer validate are skipped with a warning rather
    /// than blocking startup.
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.load_all_workflows().await?;
        let mut workflows = HashMap::new();
        for (id, workflow) in stored {
            match validate_definition(&workflow) {
                Ok(()) => {
                    workflows.insert(id, Arc::new(workflow));
                }
                Err(e) => tracing::warn!("⚠️ Skipping invalid stored workflow {}: {}", id, e),
            }
        }
        self.workflows.store(Arc::new(workflows));
        self.connections.store(Arc::new(self.storage.load_all_connections().await?));

        tracing::info!(
            "📊 Initialized workflow registry with {} workflows and {} connections",
            self.workflows.load().len(),
            self.connections.load().len()
        );
        Ok(())
    }

    /// Validate, persist and hot-swap a workflow definition
    pub async fn upsert_workflow(&self, workflow: Workflow) -> Result<()> {
        validate_definition(&workflow)?;
        self.storage.save_workflow(&workflow).await?;

        let id = workflow.id.clone();
        let mut next = (**self.workflows.load()).clone();
        next.insert(id.clone(), Arc::new(workflow));
        self.workflows.store(Arc::new(next));

        tracing::info!("🔥 Hot-reloaded workflow: {}", id);
        Ok(())
    }

    /// Re-read one workflow from storage (removing it if it is gone)
    pub async fn reload_workflow(&self, workflow_id: &str) -> Result<()> {
        let mut next = (**self.workflows.load()).clone();
        match self.storage.get_workflow(workflow_id).await? {
            Some(workflow) => {
                validate_definition(&workflow)?;
                next.insert(workflow_id.to_string(), Arc::new(workflow));
            }
            None => {
                next.remove(workflow_id);
            }
        }
        self.workflows.store(Arc::new(next));
        Ok(())
    }

    /// Delete from storage and registry; false if it did not exist
    pub async fn remove_workflow(&self, workflow_id: &str) -> Result<bool> {
        let deleted = self.storage.delete_workflow(workflow_id).await?;

        let current = self.workflows.load();
        if current.contains_key(workflow_id) {
            let mut next = (**current).clone();
            next.remove(workflow_id);
            self.workflows.store(Arc::new(next));
            tracing::info!("🗑️ Removed workflow from registry: {}", workflow_id);
        }
        Ok(deleted)
    }

    pub async fn upsert_connection(&self, connection: ApiConnection) -> Result<()> {
        if connection.base_url.trim().is_empty() {
            return Err(anyhow::anyhow!("Connection {} is missing a base URL", connection.id));
        }
        self.storage.save_connection(&connection).await?;

        let id = connection.id.clone();
        let mut next = (**self.connections.load()).clone();
        next.insert(id.clone(), connection);
        self.connections.store(Arc::new(next));

        tracing::info!("🔌 Registered API connection: {}", id);
        Ok(())
    }

    /// Lock-free read
    pub fn get(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows.load().get(workflow_id).cloned()
    }

    pub async fn list_workflows(&self, owner_id: &str) -> Result<Vec<WorkflowMetadata>> {
        self.storage.list_workflows(owner_id).await
    }
}

#[async_trait]
impl WorkflowSource for WorkflowRegistry {
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(self.get(id).map(|w| (*w).clone()))
    }
}

#[async_trait]
impl ConnectionSource for WorkflowRegistry {
    async fn get_connection(&self, id: &str) -> Result<Option<ApiConnection>> {
        Ok(self.connections.load().get(id).cloned())
    }
}

/// Structural checks on a workflow definition
///
/// Step order conflicts are rejected by the executor at run time.
pub fn validate_definition(workflow: &Workflow) -> Result<()> {
    if workflow.id.trim().is_empty() {
        return Err(anyhow::anyhow!("Workflow id must not be empty"));
    }
    if workflow.owner_id.trim().is_empty() {
        return Err(anyhow::anyhow!("Workflow {} has no owner", workflow.id));
    }

    let mut seen = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(step.id.as_str()) {
            return Err(anyhow::anyhow!("Duplicate step id '{}' in workflow {}", step.id, workflow.id));
        }
        if step.workflow_id != workflow.id {
            return Err(anyhow::anyhow!(
                "Step '{}' belongs to workflow {}, not {}",
                step.id,
                step.workflow_id,
                workflow.id
            ));
        }
        match step.step_type {
            StepType::ApiCall if step.connection_id.is_none() => {
                return Err(anyhow::anyhow!("api_call step '{}' is missing a connectionId", step.id));
            }
            StepType::Webhook
                if step.connection_id.is_none() && step.parameters.get("url").and_then(|u| u.as_str()).is_none() =>
            {
                return Err(anyhow::anyhow!("webhook step '{}' needs parameters.url or a connectionId", step.id));
            }
            StepType::Condition if step.parameters.get("expression").and_then(|e| e.as_str()).is_none() => {
                return Err(anyhow::anyhow!("condition step '{}' is missing parameters.expression", step.id));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::workflow::types::{AuthType, HttpMethod, WorkflowStatus, WorkflowStep};
    use serde_json::json;

    fn step(id: &str, step_type: StepType) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            workflow_id: "wf-1".to_string(),
            step_order: 1,
            is_active: true,
            step_type,
            connection_id: None,
            endpoint: None,
            method: HttpMethod::Get,
            parameters: json!({}),
            data_mapping: None,
            conditions: None,
        }
    }

    fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
        Workflow {
            id: "wf-1".to_string(),
            owner_id: "user-1".to_string(),
            name: "Test".to_string(),
            status: WorkflowStatus::Active,
            steps,
        }
    }

    async fn registry() -> WorkflowRegistry {
        let db = Database::in_memory().await.unwrap();
        WorkflowRegistry::new(WorkflowStorage::new(&db))
    }

    #[test]
    fn test_validate_definition() {
        assert!(validate_definition(&workflow(vec![step("s1", StepType::DataTransform)])).is_ok());
        assert!(validate_definition(&workflow(vec![step("s1", StepType::ApiCall)])).is_err());
        assert!(validate_definition(&workflow(vec![step("s1", StepType::Webhook)])).is_err());
        assert!(validate_definition(&workflow(vec![step("s1", StepType::Condition)])).is_err());
        assert!(validate_definition(&workflow(vec![
            step("s1", StepType::DataTransform),
            step("s1", StepType::DataTransform)
        ]))
        .is_err());
    }

    #[tokio::test]
    async fn test_hot_reload_and_sources() {
        let registry = registry().await;
        registry.upsert_workflow(workflow(vec![step("s1", StepType::DataTransform)])).await.unwrap();

        let snapshot = registry.get("wf-1").unwrap();
        let mut changed = workflow(vec![]);
        changed.status = WorkflowStatus::Inactive;
        registry.upsert_workflow(changed).await.unwrap();

        // Earlier snapshot is untouched by the swap
        assert_eq!(snapshot.status, WorkflowStatus::Active);
        let current = registry.get_workflow("wf-1").await.unwrap().unwrap();
        assert_eq!(current.status, WorkflowStatus::Inactive);

        registry
            .upsert_connection(ApiConnection {
                id: "c1".to_string(),
                user_id: "user-1".to_string(),
                name: String::new(),
                base_url: "http://localhost".to_string(),
                auth_type: AuthType::None,
                auth_config: json!({}),
                secret_ref: None,
            })
            .await
            .unwrap();
        assert!(registry.get_connection("c1").await.unwrap().is_some());

        let reloaded = WorkflowRegistry::new(registry.storage().clone());
        reloaded.init_from_storage().await.unwrap();
        assert!(reloaded.get("wf-1").is_some());
        assert!(reloaded.get_connection("c1").await.unwrap().is_some());

        assert!(registry.remove_workflow("wf-1").await.unwrap());
        assert!(registry.get("wf-1").is_none());
        registry.reload_workflow("wf-1").await.unwrap();
        assert!(registry.get("wf-1").is_none());
    }
}
