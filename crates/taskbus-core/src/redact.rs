//! Redaction of sensitive fields before payloads reach the log.

use serde_json::Value;

/// Placeholder written in place of a sensitive value.
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "credential",
    "private_key",
];

/// Whether a field name looks like it carries a secret.
pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

/// Return a copy of `value` with every sensitive field replaced by [`REDACTED`].
/// Walks nested objects and arrays.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if is_sensitive_key(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact(v)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacts_nested_fields() {
        let input = json!({
            "user": "alice",
            "apiKey": "sk-123",
            "nested": {"db_password": "hunter2", "host": "localhost"},
            "list": [{"Authorization": "Bearer x"}, 42]
        });
        let out = redact(&input);
        assert_eq!(out["user"], "alice");
        assert_eq!(out["apiKey"], REDACTED);
        assert_eq!(out["nested"]["db_password"], REDACTED);
        assert_eq!(out["nested"]["host"], "localhost");
        assert_eq!(out["list"][0]["Authorization"], REDACTED);
        assert_eq!(out["list"][1], 42);
    }

    #[test]
    fn test_scalars_untouched() {
        assert_eq!(redact(&json!("token")), json!("token"));
        assert_eq!(redact(&json!(null)), json!(null));
    }
}
