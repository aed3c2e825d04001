//! Redaction helpers for logs and config dumps

use serde_json::Value;

/// Keys whose values must never appear in logs or resource dumps
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &["password", "token", "secret", "key", "auth", "api_key"];

/// Redact a token for logging: first 8 characters plus an ellipsis
pub fn redact_token(token: &str) -> String {
    if token.len() <= 8 {
        "…".to_string()
    } else {
        format!("{}…", &token[..8])
    }
}

/// Recursively redact sensitive keys in a JSON value
///
/// Matching is case-insensitive substring matching on the key name.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, val) in map {
                let lower = key.to_lowercase();
                if SENSITIVE_KEY_FRAGMENTS.iter().any(|frag| lower.contains(frag)) {
                    redacted.insert(key.clone(), Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key.clone(), redact_value(val));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redact_token_short() {
        assert_eq!(redact_token("abc"), "…");
    }

    #[test]
    fn test_redact_token_long() {
        assert_eq!(redact_token("abcdefghijklmnop"), "abcdefgh…");
    }

    #[test]
    fn test_redact_value_nested() {
        let input = json!({
            "server": {"host": "localhost", "api_key": "hunter2"},
            "providers": [{"client_secret": "s3cr3t", "name": "upstream"}],
            "log_level": "debug"
        });
        let redacted = redact_value(&input);
        assert_eq!(redacted["server"]["api_key"], "[REDACTED]");
        assert_eq!(redacted["providers"][0]["client_secret"], "[REDACTED]");
        assert_eq!(redacted["server"]["host"], "localhost");
        assert_eq!(redacted["log_level"], "debug");
    }

    #[test]
    fn test_case_insensitive_matching() {
        let input = json!({"Authorization": "Bearer abc", "X-Api-Key": "k"});
        let redacted = redact_value(&input);
        assert_eq!(redacted["Authorization"], "[REDACTED]");
        assert_eq!(redacted["X-Api-Key"], "[REDACTED]");
    }
}
