/// Execution scope and data mapping
///
/// The scope is the document every mapping and condition is evaluated
/// against: `{ params, steps: {<stepId>: output}, conditions: {<stepId>: bool},
/// previous }`. It is checkpointed after each step so a retried job resumes
/// where the last attempt stopped.

use crate::queue::redact::redact_value;
use crate::runtime::error::StepError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionScope {
    pub params: Value,
    pub steps: BTreeMap<String, Value>,
    pub conditions: BTreeMap<String, bool>,
    /// Output of the most recently completed step
    pub previous: Value,
}

impl ExecutionScope {
    pub fn new(params: Value) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    pub fn document(&self) -> Value {
        json!({
            "params": self.params,
            "steps": self.steps,
            "conditions": self.conditions,
            "previous": self.previous,
        })
    }

    pub fn record_output(&mut self, step_id: &str, output: Value) {
        self.steps.insert(step_id.to_string(), output.clone());
        self.previous = output;
    }

    pub fn record_condition(&mut self, step_id: &str, outcome: bool) {
        self.conditions.insert(step_id.to_string(), outcome);
    }
}

/// Progress saved on a RUNNING execution between steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub scope: ExecutionScope,
    pub completed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
}

impl Checkpoint {
    /// Stored form, scrubbed like every other persisted payload
    ///
    /// Parameters come back from the job on resume. Step outputs do not, so a
    /// resumed run reads masked values for sensitive-named output fields.
    pub fn to_progress(&self) -> Value {
        let mut progress = json!({ "checkpoint": self });
        let scope = &mut progress["checkpoint"]["scope"];
        scope["params"] = redact_value(&self.scope.params);
        scope["steps"] = redact_value(&json!(self.scope.steps));
        scope["previous"] = redact_value(&self.scope.previous);
        progress
    }

    /// Read a checkpoint back from an execution's progress value
    pub fn from_progress(progress: Option<&Value>) -> Option<Self> {
        progress
            .and_then(|p| p.get("checkpoint"))
            .and_then(|c| serde_json::from_value(c.clone()).ok())
    }

    pub fn is_done(&self, step_id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_id)
    }

    pub fn was_skipped(&self, step_id: &str) -> bool {
        self.skipped_steps.iter().any(|s| s == step_id)
    }
}

/// Resolve a mapping against the scope document
///
/// Strings starting with `$` are JSONPath expressions; a single match yields
/// the value itself, several matches an array, no match `null`. Everything
/// else is a literal, with objects and arrays resolved recursively.
pub fn resolve_mapping(mapping: &Value, document: &Value) -> Value {
    match mapping {
        Value::String(path) if path.starts_with('$') => select_path(document, path),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), resolve_mapping(value, document)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|item| resolve_mapping(item, document)).collect()),
        literal => literal.clone(),
    }
}

fn select_path(document: &Value, path: &str) -> Value {
    match jsonpath_lib::select(document, path) {
        Ok(matches) => match matches.as_slice() {
            [] => {
                tracing::warn!("⚠️ Mapping expression '{}' matched nothing", path);
                Value::Null
            }
            [single] => (*single).clone(),
            many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
        },
        Err(e) => {
            tracing::warn!("⚠️ Invalid mapping expression '{}': {:?}", path, e);
            Value::Null
        }
    }
}

/// Static parameters with mapped values layered on top
pub fn merge_inputs(parameters: &Value, mapped: Option<Value>) -> Map<String, Value> {
    let mut merged = parameters.as_object().cloned().unwrap_or_default();
    if let Some(Value::Object(values)) = mapped {
        merged.extend(values);
    }
    merged
}

/// Fill `{name}` placeholders from `params`, consuming the values used
pub fn fill_path(template: &str, params: &mut Map<String, Value>) -> Result<String, StepError> {
    let mut path = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let close = rest[open..]
            .find('}')
            .map(|i| open + i)
            .ok_or_else(|| StepError::Terminal(format!("unterminated placeholder in path '{}'", template)))?;
        let name = &rest[open + 1..close];
        let value = params
            .remove(name)
            .ok_or_else(|| StepError::Terminal(format!("missing path parameter '{}'", name)))?;

        path.push_str(&rest[..open]);
        path.push_str(&scalar_string(&value));
        rest = &rest[close + 1..];
    }
    path.push_str(rest);
    Ok(path)
}

/// Query-string form of a JSON value
pub fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::redact::REDACTED;

    fn scope() -> ExecutionScope {
        let mut scope = ExecutionScope::new(json!({ "userId": 42, "tags": ["a", "b"] }));
        scope.record_output("fetch", json!({ "status": 200, "data": { "name": "Ada", "items": [{ "id": 1 }, { "id": 2 }] } }));
        scope.record_condition("check", true);
        scope
    }

    #[test]
    fn test_resolve_mapping() {
        let doc = scope().document();
        let mapping = json!({
            "id": "$.params.userId",
            "name": "$.steps.fetch.data.name",
            "ids": "$.steps.fetch.data.items[*].id",
            "last": "$.previous.status",
            "ok": "$.conditions.check",
            "missing": "$.steps.nope",
            "literal": "plain",
            "nested": { "first": "$.params.tags[0]" }
        });

        let resolved = resolve_mapping(&mapping, &doc);
        assert_eq!(resolved["id"], 42);
        assert_eq!(resolved["name"], "Ada");
        assert_eq!(resolved["ids"], json!([1, 2]));
        assert_eq!(resolved["last"], 200);
        assert_eq!(resolved["ok"], true);
        assert_eq!(resolved["missing"], Value::Null);
        assert_eq!(resolved["literal"], "plain");
        assert_eq!(resolved["nested"]["first"], "a");
    }

    #[test]
    fn test_merge_inputs_mapped_wins() {
        let merged = merge_inputs(&json!({ "a": 1, "b": 2 }), Some(json!({ "b": 3 })));
        assert_eq!(Value::Object(merged), json!({ "a": 1, "b": 3 }));
    }

    #[test]
    fn test_fill_path() {
        let mut params = json!({ "id": 7, "org": "acme", "limit": 5 }).as_object().cloned().unwrap();
        let path = fill_path("/orgs/{org}/users/{id}", &mut params).unwrap();
        assert_eq!(path, "/orgs/acme/users/7");
        assert_eq!(Value::Object(params), json!({ "limit": 5 }));

        let mut empty = Map::new();
        assert!(matches!(fill_path("/users/{id}", &mut empty), Err(StepError::Terminal(_))));
        assert!(fill_path("/users/{id", &mut empty).is_err());
    }

    #[test]
    fn test_checkpoint_roundtrip_through_progress() {
        let checkpoint = Checkpoint {
            scope: scope(),
            completed_steps: vec!["fetch".to_string()],
            skipped_steps: vec![],
        };
        let restored = Checkpoint::from_progress(Some(&checkpoint.to_progress())).unwrap();
        assert_eq!(restored, checkpoint);
        assert!(restored.is_done("fetch"));
        assert!(Checkpoint::from_progress(Some(&json!({ "success": true }))).is_none());
    }

    #[test]
    fn test_progress_masks_credentials_in_outputs() {
        let mut scope = ExecutionScope::new(json!({ "apiKey": "k-123", "userId": 7 }));
        scope.record_output("login", json!({ "status": 200, "data": { "accessToken": "t-456", "user": "ada" } }));
        let checkpoint = Checkpoint {
            scope,
            completed_steps: vec!["login".to_string()],
            skipped_steps: vec![],
        };

        let progress = checkpoint.to_progress();
        let stored = progress.to_string();
        assert!(!stored.contains("k-123"));
        assert!(!stored.contains("t-456"));

        let restored = Checkpoint::from_progress(Some(&progress)).unwrap();
        assert_eq!(restored.scope.params["userId"], 7);
        assert_eq!(restored.scope.steps["login"]["data"]["accessToken"], REDACTED);
        assert_eq!(restored.scope.steps["login"]["data"]["user"], "ada");
        assert_eq!(restored.scope.previous["data"]["accessToken"], REDACTED);
        assert!(restored.is_done("login"));
    }
}
