/// Read-side seams for workflows, connections and secrets
///
/// The executor only sees these traits. The registry implements the sources
/// for the server; vaults resolve a connection's `secret_ref`.

use crate::workflow::types::{ApiConnection, ResolvedConnection, Secret, Workflow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn get_workflow(&self, id: &str) -> anyhow::Result<Option<Workflow>>;
}

#[async_trait]
pub trait ConnectionSource: Send + Sync {
    async fn get_connection(&self, id: &str) -> anyhow::Result<Option<ApiConnection>>;
}

/// Resolves credential references to secret material
#[async_trait]
pub trait SecretsVault: Send + Sync {
    async fn resolve(&self, reference: &str) -> anyhow::Result<Option<Secret>>;
}

/// Secrets read from `<prefix><REFERENCE>` environment variables
///
/// The reference is upper-cased and every non-alphanumeric character becomes
/// `_`, so `stripe/live` with prefix `APIFLOW_SECRET_` reads
/// `APIFLOW_SECRET_STRIPE_LIVE`.
#[derive(Debug, Clone)]
pub struct EnvSecretsVault {
    prefix: String,
}

impl EnvSecretsVault {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn variable_for(&self, reference: &str) -> String {
        let suffix: String = reference
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

#[async_trait]
impl SecretsVault for EnvSecretsVault {
    async fn resolve(&self, reference: &str) -> anyhow::Result<Option<Secret>> {
        Ok(std::env::var(self.variable_for(reference)).ok().map(Secret::new))
    }
}

/// Fixed in-memory secrets
#[derive(Debug, Clone, Default)]
pub struct StaticSecretsVault {
    secrets: HashMap<String, Secret>,
}

impl StaticSecretsVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, reference: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(reference.into(), Secret::new(value));
        self
    }
}

#[async_trait]
impl SecretsVault for StaticSecretsVault {
    async fn resolve(&self, reference: &str) -> anyhow::Result<Option<Secret>> {
        Ok(self.secrets.get(reference).cloned())
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("API connection {0} not found")]
    NotFound(String),

    /// Reported as not found to the caller; kept distinct for logs
    #[error("API connection {id} does not belong to user {user_id}")]
    NotOwned { id: String, user_id: String },

    #[error("credential '{0}' could not be resolved")]
    MissingSecret(String),

    /// Lookup itself failed; worth retrying
    #[error("connection lookup failed: {0}")]
    Source(#[source] anyhow::Error),
}

/// Resolves a step's connection and credential for one caller
#[derive(Clone)]
pub struct ConnectionResolver {
    connections: Arc<dyn ConnectionSource>,
    vault: Arc<dyn SecretsVault>,
}

impl ConnectionResolver {
    pub fn new(connections: Arc<dyn ConnectionSource>, vault: Arc<dyn SecretsVault>) -> Self {
        Self { connections, vault }
    }

    pub async fn resolve(&self, connection_id: &str, user_id: &str) -> Result<ResolvedConnection, ConnectionError> {
        let connection = self
            .connections
            .get_connection(connection_id)
            .await
            .map_err(ConnectionError::Source)?
            .ok_or_else(|| ConnectionError::NotFound(connection_id.to_string()))?;

        if connection.user_id != user_id {
            return Err(ConnectionError::NotOwned {
                id: connection_id.to_string(),
                user_id: user_id.to_string(),
            });
        }

        let secret = match &connection.secret_ref {
            Some(reference) => Some(
                self.vault
                    .resolve(reference)
                    .await
                    .map_err(ConnectionError::Source)?
                    .ok_or_else(|| ConnectionError::MissingSecret(reference.clone()))?,
            ),
            None => None,
        };

        tracing::debug!("🔐 Resolved connection {} for user {}", connection_id, user_id);
        Ok(ResolvedConnection { connection, secret })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::AuthType;
    use serde_json::json;

    struct OneConnection(ApiConnection);

    #[async_trait]
    impl ConnectionSource for OneConnection {
        async fn get_connection(&self, id: &str) -> anyhow::Result<Option<ApiConnection>> {
            Ok((self.0.id == id).then(|| self.0.clone()))
        }
    }

    fn connection(secret_ref: Option<&str>) -> ApiConnection {
        ApiConnection {
            id: "c1".to_string(),
            user_id: "user-1".to_string(),
            name: "CRM".to_string(),
            base_url: "https://crm.example.com".to_string(),
            auth_type: AuthType::Bearer,
            auth_config: json!({}),
            secret_ref: secret_ref.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_resolve_with_secret() {
        let vault = StaticSecretsVault::new().with_secret("crm", "tok-1");
        let resolver = ConnectionResolver::new(Arc::new(OneConnection(connection(Some("crm")))), Arc::new(vault));

        let resolved = resolver.resolve("c1", "user-1").await.unwrap();
        assert_eq!(resolved.secret.unwrap().expose(), "tok-1");
    }

    #[tokio::test]
    async fn test_resolve_failures() {
        let resolver = ConnectionResolver::new(
            Arc::new(OneConnection(connection(Some("missing")))),
            Arc::new(StaticSecretsVault::new()),
        );

        assert!(matches!(resolver.resolve("c2", "user-1").await, Err(ConnectionError::NotFound(_))));
        assert!(matches!(resolver.resolve("c1", "user-2").await, Err(ConnectionError::NotOwned { .. })));
        assert!(matches!(resolver.resolve("c1", "user-1").await, Err(ConnectionError::MissingSecret(_))));
    }

    #[tokio::test]
    async fn test_env_vault_variable_names() {
        let vault = EnvSecretsVault::new("APIFLOW_TEST_SECRET_");
        assert_eq!(vault.variable_for("stripe/live-key"), "APIFLOW_TEST_SECRET_STRIPE_LIVE_KEY");

        std::env::set_var("APIFLOW_TEST_SECRET_CATALOG_VAULT", "v");
        let secret = vault.resolve("catalog.vault").await.unwrap();
        assert_eq!(secret.map(|s| s.expose().to_string()), Some("v".to_string()));
        assert!(vault.resolve("absent").await.unwrap().is_none());
    }
}
