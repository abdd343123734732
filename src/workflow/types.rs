/// Core workflow type definitions
///
/// Workflows, their ordered steps and the API connections steps call into.
/// Stored as JSON definitions in SQLite and read-only to the executor.

use crate::queue::redact::REDACTED;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A named, ordered set of steps owned by one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-sync-crm")
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub owner_id: String,
    pub name: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Active,
    Inactive,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Active => "ACTIVE",
            WorkflowStatus::Inactive => "INACTIVE",
            WorkflowStatus::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work within a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub workflow_id: String,
    /// Execution sequence within the workflow
    pub step_order: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// API connection used by api_call (and optionally webhook) steps
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Path relative to the connection base URL, may contain `{name}` templates
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub method: HttpMethod,
    /// Static parameters merged under the mapped values
    #[serde(default = "empty_object")]
    pub parameters: Value,
    /// Values pulled from prior outputs (`$`-prefixed strings are JSONPath)
    #[serde(default)]
    pub data_mapping: Option<Value>,
    /// Lua boolean expression gating the step
    #[serde(default)]
    pub conditions: Option<String>,
}

fn default_active() -> bool {
    true
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Available step types
///
/// - ApiCall: HTTP request against a registered API connection
/// - DataTransform: reshape prior outputs without an external call
/// - Condition: record a boolean used by later steps' `conditions`
/// - Webhook: deliver a payload to an external endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ApiCall,
    DataTransform,
    Condition,
    Webhook,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::ApiCall => "api_call",
            StepType::DataTransform => "data_transform",
            StepType::Condition => "condition",
            StepType::Webhook => "webhook",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }

    /// Parameters travel in the query string rather than a JSON body
    pub fn uses_query(self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Delete)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    ApiKey,
    Bearer,
    Basic,
    Oauth2,
}

/// A registered external API
///
/// `auth_config` holds non-secret settings (`headerName`, `username`);
/// credential material is only ever referenced through `secret_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConnection {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default = "empty_object")]
    pub auth_config: Value,
    #[serde(default)]
    pub secret_ref: Option<String>,
}

/// Credential material that never prints
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// A connection with its credential resolved for one call
#[derive(Debug, Clone)]
pub struct ResolvedConnection {
    pub connection: ApiConnection,
    pub secret: Option<Secret>,
}
