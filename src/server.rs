/// Server setup and initialization
///
/// Wires together all components: database, workflow registry, queue
/// subsystem, execution state, executor and HTTP routes. Components are
/// built once here and handed to whatever needs them.

use crate::{
    api::{create_execution_routes, create_queue_routes, create_workflow_routes, AppState},
    config::Config,
    database::Database,
    execution::{ExecutionStateManager, SqliteExecutionStore},
    queue::{QueueMaintenance, QueueService, SqliteJobStore, WorkerOptions},
    runtime::{ExecutionService, StepExecutor, WorkflowExecutor},
    workflow::{
        catalog::{ConnectionResolver, EnvSecretsVault, SecretsVault},
        registry::WorkflowRegistry,
        storage::WorkflowStorage,
    },
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Every long-lived component of a running engine
#[derive(Clone)]
pub struct Services {
    pub database: Database,
    pub registry: Arc<WorkflowRegistry>,
    pub queue: Arc<QueueService>,
    pub maintenance: Arc<QueueMaintenance>,
    pub executions: Arc<ExecutionService>,
}

impl Services {
    /// Build and start all components on an open database
    pub async fn start(config: &Config, database: Database, vault: Arc<dyn SecretsVault>) -> Result<Self> {
        // Initialize workflow registry and load existing workflows
        tracing::info!("📊 Initializing workflow registry");
        let registry = Arc::new(WorkflowRegistry::new(WorkflowStorage::new(&database)));
        registry
            .init_from_storage()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load workflows from storage: {}", e))?;

        tracing::info!("📬 Starting queue subsystem");
        let queue = Arc::new(QueueService::new(
            Arc::new(SqliteJobStore::new(&database)),
            config.queue.clone(),
        ));
        queue.start().await?;

        let maintenance = Arc::new(QueueMaintenance::new(Arc::clone(&queue)).await?);
        maintenance.start().await?;

        tracing::info!("⚙️ Initializing workflow executor");
        let state = Arc::new(ExecutionStateManager::new(Arc::new(SqliteExecutionStore::new(&database))));
        let resolver = ConnectionResolver::new(registry.clone(), vault);
        let steps = StepExecutor::new(
            resolver,
            config.executor.http_timeout(),
            config.executor.webhook_timeout(),
        )?;
        let executor = Arc::new(WorkflowExecutor::new(steps, state));

        let executions = Arc::new(
            ExecutionService::new(registry.clone(), executor, config.executor.mode).with_queue(Arc::clone(&queue)),
        );
        // Registered in both modes so jobs queued by an earlier process still drain
        executions.register_worker(WorkerOptions::default()).await?;

        tracing::info!("✅ Services started (execution mode {:?})", config.executor.mode);
        Ok(Self {
            database,
            registry,
            queue,
            maintenance,
            executions,
        })
    }

    /// HTTP router over these services
    pub fn router(&self) -> Router {
        let state = AppState {
            registry: Arc::clone(&self.registry),
            executions: Arc::clone(&self.executions),
            queue: Arc::clone(&self.queue),
        };

        Router::new()
            // Health check endpoint
            .route("/healthz", get(health_check))
            .merge(create_workflow_routes())
            .merge(create_execution_routes())
            .merge(create_queue_routes())
            .with_state(state)
    }

    /// Stop maintenance, then drain the worker pools
    pub async fn shutdown(&self) -> Result<()> {
        self.maintenance.stop().await?;
        self.queue.stop().await?;
        Ok(())
    }
}

/// Create the main Axum application with all routes
///
/// Opens the configured database and resolves credentials from environment
/// variables.
pub async fn create_app(config: &Config) -> Result<(Router, Services)> {
    let database = Database::connect(&config.database.url).await?;
    let vault = Arc::new(EnvSecretsVault::new(config.executor.secret_prefix.clone()));
    let services = Services::start(config, database, vault).await?;

    tracing::info!("📡 Creating HTTP router with all endpoints");
    Ok((services.router(), services))
}

/// Start the HTTP server with the given configuration
///
/// Serves until Ctrl-C, then lets running jobs finish before returning.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting apiflow server...");

    let (app, services) = create_app(&config).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.shutdown().await?;
    tracing::info!("👋 Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
    }
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
