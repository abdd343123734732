/// Step execution handlers for the four step types
///
/// - ApiCall: authenticated HTTP request against a registered connection
/// - DataTransform: mapping plus optional Lua script, no external call
/// - Condition: Lua boolean recorded for later steps
/// - Webhook: JSON POST to an external endpoint
///
/// Failures come back as `StepError`, classified transient or terminal so
/// the queue only retries what may succeed later.

use crate::runtime::context::{fill_path, merge_inputs, resolve_mapping, scalar_string, ExecutionScope};
use crate::runtime::error::StepError;
use crate::runtime::expression::{evaluate_condition, run_transform};
use crate::workflow::catalog::ConnectionResolver;
use crate::workflow::types::{AuthType, ResolvedConnection, StepType, WorkflowStep};
use anyhow::Result;
use serde_json::{json, Value};
use std::time::Duration;

/// Output of one successful step
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub data: Value,
    /// Set by condition steps
    pub condition: Option<bool>,
}

impl StepOutput {
    fn data(data: Value) -> Self {
        Self { data, condition: None }
    }
}

/// Who a step runs for
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub execution_id: &'a str,
    pub user_id: &'a str,
}

impl StepContext<'_> {
    fn idempotency_key(&self, step: &WorkflowStep) -> String {
        format!("{}:{}", self.execution_id, step.id)
    }
}

pub struct StepExecutor {
    client: reqwest::Client,
    connections: ConnectionResolver,
    http_timeout: Duration,
    webhook_timeout: Duration,
}

impl StepExecutor {
    pub fn new(connections: ConnectionResolver, http_timeout: Duration, webhook_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("apiflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            connections,
            http_timeout,
            webhook_timeout,
        })
    }

    /// Execute a single step against the current scope
    pub async fn execute(
        &self,
        ctx: StepContext<'_>,
        step: &WorkflowStep,
        scope: &ExecutionScope,
    ) -> Result<StepOutput, StepError> {
        tracing::debug!("🚀 Executing {} step {}", step.step_type.as_str(), step.id);
        let document = scope.document();
        let mapped = step.data_mapping.as_ref().map(|m| resolve_mapping(m, &document));

        match step.step_type {
            StepType::ApiCall => self.execute_api_call(ctx, step, mapped).await,
            StepType::DataTransform => execute_data_transform(step, mapped, &document),
            StepType::Condition => execute_condition(step, &document),
            StepType::Webhook => self.execute_webhook(ctx, step, mapped).await,
        }
    }

    async fn execute_api_call(
        &self,
        ctx: StepContext<'_>,
        step: &WorkflowStep,
        mapped: Option<Value>,
    ) -> Result<StepOutput, StepError> {
        let connection_id = step
            .connection_id
            .as_deref()
            .ok_or_else(|| StepError::Terminal(format!("api_call step {} has no connection", step.id)))?;
        let resolved = self.connections.resolve(connection_id, ctx.user_id).await?;

        let mut params = merge_inputs(&step.parameters, mapped);
        let headers = params.remove("headers");
        let path = fill_path(step.endpoint.as_deref().unwrap_or(""), &mut params)?;
        let url = join_url(&resolved.connection.base_url, &path);

        tracing::debug!("🌍 HTTP Request: {:?} {}", step.method, url);
        let mut request = self
            .client
            .request(step.method.to_reqwest(), &url)
            .timeout(self.http_timeout)
            .header("Idempotency-Key", ctx.idempotency_key(step));
        request = apply_headers(request, headers.as_ref());
        request = apply_auth(request, &resolved)?;

        request = if step.method.uses_query() {
            let query: Vec<(String, String)> = params.iter().map(|(k, v)| (k.clone(), scalar_string(v))).collect();
            request.query(&query)
        } else {
            request.json(&Value::Object(params))
        };

        send(request, &url).await.map(StepOutput::data)
    }

    async fn execute_webhook(
        &self,
        ctx: StepContext<'_>,
        step: &WorkflowStep,
        mapped: Option<Value>,
    ) -> Result<StepOutput, StepError> {
        let payload = match mapped {
            Some(value) => value,
            None => step.parameters.get("payload").cloned().unwrap_or_else(|| json!({})),
        };
        let timeout = step
            .parameters
            .get("timeoutSeconds")
            .and_then(|t| t.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(self.webhook_timeout);

        let (url, resolved) = match step.parameters.get("url").and_then(|u| u.as_str()) {
            Some(url) => (url.to_string(), None),
            None => {
                let connection_id = step.connection_id.as_deref().ok_or_else(|| {
                    StepError::Terminal(format!("webhook step {} has neither a url nor a connection", step.id))
                })?;
                let resolved = self.connections.resolve(connection_id, ctx.user_id).await?;
                let url = join_url(&resolved.connection.base_url, step.endpoint.as_deref().unwrap_or(""));
                (url, Some(resolved))
            }
        };

        tracing::debug!("📣 Delivering webhook for step {} to {}", step.id, url);
        let mut request = self
            .client
            .post(&url)
            .timeout(timeout)
            .header("Idempotency-Key", ctx.idempotency_key(step));
        request = apply_headers(request, step.parameters.get("headers"));
        if let Some(resolved) = &resolved {
            request = apply_auth(request, resolved)?;
        }

        send(request.json(&payload), &url).await.map(StepOutput::data)
    }
}

fn execute_data_transform(step: &WorkflowStep, mapped: Option<Value>, document: &Value) -> Result<StepOutput, StepError> {
    let input = mapped.unwrap_or_else(|| json!({}));
    let output = match step.parameters.get("script").and_then(|s| s.as_str()) {
        Some(script) => run_transform(script, &input, document)?,
        None => input,
    };
    Ok(StepOutput::data(output))
}

fn execute_condition(step: &WorkflowStep, document: &Value) -> Result<StepOutput, StepError> {
    let expression = step
        .parameters
        .get("expression")
        .and_then(|e| e.as_str())
        .ok_or_else(|| StepError::Terminal(format!("condition step {} has no expression", step.id)))?;
    let outcome = evaluate_condition(expression, document)?;

    Ok(StepOutput {
        data: json!({ "result": outcome }),
        condition: Some(outcome),
    })
}

fn join_url(base_url: &str, path: &str) -> String {
    match (base_url.ends_with('/'), path.starts_with('/')) {
        _ if path.is_empty() => base_url.to_string(),
        (true, true) => format!("{}{}", base_url, &path[1..]),
        (false, false) => format!("{}/{}", base_url, path),
        _ => format!("{}{}", base_url, path),
    }
}

fn apply_headers(mut request: reqwest::RequestBuilder, headers: Option<&Value>) -> reqwest::RequestBuilder {
    if let Some(headers) = headers.and_then(|h| h.as_object()) {
        for (key, value) in headers {
            if let Some(header_value) = value.as_str() {
                request = request.header(key.as_str(), header_value);
            }
        }
    }
    request
}

fn apply_auth(request: reqwest::RequestBuilder, resolved: &ResolvedConnection) -> Result<reqwest::RequestBuilder, StepError> {
    let connection = &resolved.connection;
    if connection.auth_type == AuthType::None {
        return Ok(request);
    }

    let secret = resolved.secret.as_ref().ok_or_else(|| {
        StepError::Terminal(format!("API connection {} has no credential configured", connection.id))
    })?;

    Ok(match connection.auth_type {
        AuthType::None => request,
        AuthType::ApiKey => {
            let header = connection
                .auth_config
                .get("headerName")
                .and_then(|h| h.as_str())
                .unwrap_or("X-API-Key");
            request.header(header, secret.expose())
        }
        AuthType::Bearer | AuthType::Oauth2 => request.bearer_auth(secret.expose()),
        AuthType::Basic => {
            let username = connection
                .auth_config
                .get("username")
                .and_then(|u| u.as_str())
                .unwrap_or_default();
            request.basic_auth(username, Some(secret.expose()))
        }
    })
}

/// Send and classify: 2xx succeeds, 5xx/408/429 and transport errors are
/// transient, everything else terminal
async fn send(request: reqwest::RequestBuilder, url: &str) -> Result<Value, StepError> {
    let response = request
        .send()
        .await
        .map_err(|e| StepError::Transient(format!("request to {} failed: {}", url, e.without_url())))?;

    let status = response.status();
    tracing::debug!("📡 Response status: {}", status);

    let text = response
        .text()
        .await
        .map_err(|e| StepError::Transient(format!("failed to read response from {}: {}", url, e.without_url())))?;

    if status.is_success() {
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        return Ok(json!({ "status": status.as_u16(), "data": data }));
    }

    let message = format!("{} responded with {}", url, status);
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        Err(StepError::Transient(message))
    } else {
        Err(StepError::Terminal(message))
    }
}
