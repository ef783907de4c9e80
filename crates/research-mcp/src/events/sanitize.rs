//! Redaction of sensitive fields before events reach storage.

/// Field names that never land on disk in clear form.
const SENSITIVE_FIELDS: &[&str] = &["password", "token", "apiKey", "credentials"];

/// Replacement marker.
const REDACTED: &str = "[REDACTED]";

/// Redact known sensitive fields recursively. Idempotent.
#[must_use]
pub fn sanitize(message: &serde_json::Value) -> serde_json::Value {
    match message {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                if SENSITIVE_FIELDS.contains(&key.as_str()) {
                    out.insert(key.clone(), serde_json::Value::String(REDACTED.to_owned()));
                } else {
                    out.insert(key.clone(), sanitize(value));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sanitize).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacts_known_fields() {
        let message = json!({
            "method": "tools/call",
            "params": {"apiKey": "sk-123", "query": "acme", "nested": {"password": "hunter2"}}
        });
        let clean = sanitize(&message);
        assert_eq!(clean["params"]["apiKey"], REDACTED);
        assert_eq!(clean["params"]["nested"]["password"], REDACTED);
        assert_eq!(clean["params"]["query"], "acme");
    }

    #[test]
    fn test_idempotent() {
        let message = json!({"token": "abc", "data": [{"credentials": {"user": "u"}}]});
        let once = sanitize(&message);
        let twice = sanitize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_arrays_traversed() {
        let message = json!([{"token": "abc"}, {"safe": 1}]);
        let clean = sanitize(&message);
        assert_eq!(clean[0]["token"], REDACTED);
        assert_eq!(clean[1]["safe"], 1);
    }
}
