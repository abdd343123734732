/// Workflow Management Layer
///
/// Workflow catalog: type definitions, SQLite persistence, the ArcSwap
/// hot-reload registry, and the read-side seams the executor depends on
/// (workflow/connection sources, secrets vaults).

pub mod catalog;
pub mod registry;
pub mod storage;
pub mod types;

pub use catalog::{
    ConnectionError, ConnectionResolver, ConnectionSource, EnvSecretsVault, SecretsVault, StaticSecretsVault,
    WorkflowSource,
};
pub use registry::WorkflowRegistry;
pub use storage::WorkflowStorage;
pub use types::{ApiConnection, AuthType, HttpMethod, Secret, StepType, Workflow, WorkflowStatus, WorkflowStep};
