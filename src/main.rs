/// apiflow: queue-backed execution engine for multi-step API automations
///
/// Main entry point for the apiflow server. Loads configuration from the
/// environment and starts the HTTP server with the queue workers behind it.

use apiflow::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Workflow and connection management at /api/workflows/*, /api/connections/*
/// - Execution at /api/workflows/{id}/execute and /api/executions/*
/// - Queue operations at /api/queue/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3004 and a local SQLite file)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
