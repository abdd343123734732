/// Sensitive-field redaction for anything that reaches a log line.
///
/// Every payload schema implements [`Redact`] and decides field by field what
/// survives; free-form maps (user parameters, step outputs) go through the
/// name-fragment rule in [`redact_value`].

use serde_json::Value;

/// Replacement written in place of a sensitive value
pub const REDACTED: &str = "[REDACTED]";

/// Field-name fragments that mark a free-form value as sensitive
const SENSITIVE_FRAGMENTS: &[&str] = &["password", "token", "secret", "key", "credential"];

/// A payload schema that knows how to render itself for a log line.
pub trait Redact {
    /// Copy of the value that is safe to log
    fn redacted(&self) -> Value;
}

/// True when a free-form field name looks like it carries credential material
pub fn is_sensitive_name(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    SENSITIVE_FRAGMENTS.iter().any(|fragment| lowered.contains(fragment))
}

/// Recursively scrub a free-form JSON value
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(name, inner)| {
                    if is_sensitive_name(name) {
                        (name.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (name.clone(), redact_value(inner))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_names() {
        assert!(is_sensitive_name("password"));
        assert!(is_sensitive_name("X-API-Key"));
        assert!(is_sensitive_name("refreshToken"));
        assert!(is_sensitive_name("client_secret"));
        assert!(!is_sensitive_name("userId"));
        assert!(!is_sensitive_name("email"));
    }

    #[test]
    fn test_redact_nested() {
        let input = json!({
            "user": { "name": "ada", "password": "hunter2" },
            "items": [{ "apiKey": "k-1", "qty": 3 }],
            "count": 2
        });

        let output = redact_value(&input);
        assert_eq!(output["user"]["name"], "ada");
        assert_eq!(output["user"]["password"], REDACTED);
        assert_eq!(output["items"][0]["apiKey"], REDACTED);
        assert_eq!(output["items"][0]["qty"], 3);
        assert_eq!(output["count"], 2);
    }
}
