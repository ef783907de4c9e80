//! Lightweight structural validation against tool schemas.
//!
//! Inputs are fully validated by serde when tools deserialize their typed
//! input structs; this module covers the checks serde cannot express at the
//! dispatch boundary: argument shape, unknown tools' absent schemas, and
//! declared-output conformance.

/// Check that `args` is a JSON object. Field-level validation happens in the
/// tools' serde parse.
pub fn require_object(args: &serde_json::Value) -> Result<(), String> {
    if args.is_object() {
        Ok(())
    } else {
        Err(format!("arguments must be an object, got {}", type_name(args)))
    }
}

/// Shallow validation of structured output against a declared schema:
/// type must match and required top-level properties must be present.
pub fn validate_output(schema: &serde_json::Value, value: &serde_json::Value) -> Result<(), String> {
    if schema.get("type").and_then(|t| t.as_str()) == Some("object") && !value.is_object() {
        return Err(format!("expected object output, got {}", type_name(value)));
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if value.get(name).is_none() {
                return Err(format!("missing required output field '{name}'"));
            }
        }
    }

    Ok(())
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_require_object() {
        assert!(require_object(&json!({})).is_ok());
        assert!(require_object(&json!({"q": 1})).is_ok());
        assert!(require_object(&json!([1, 2])).is_err());
        assert!(require_object(&json!("str")).is_err());
    }

    #[test]
    fn test_output_required_fields() {
        let schema = json!({"type": "object", "required": ["sources", "stats"]});
        assert!(validate_output(&schema, &json!({"sources": [], "stats": {}})).is_ok());

        let err = validate_output(&schema, &json!({"sources": []})).unwrap_err();
        assert!(err.contains("stats"));
    }

    #[test]
    fn test_output_type_mismatch() {
        let schema = json!({"type": "object"});
        assert!(validate_output(&schema, &json!([])).is_err());
    }
}
