//! Deterministic cache key derivation.
//!
//! Keys are a SHA-256 over the canonical JSON form of the argument object:
//! object keys sorted recursively, serde's stable number encoding. Two
//! argument objects that differ only in key order hash identically.

use sha2::{Digest, Sha256};

/// Rebuild a JSON value with all object keys in sorted order.
#[must_use]
pub fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Derive the hex key hash for `(namespace, args)`.
#[must_use]
pub fn key_hash(namespace: &str, args: &serde_json::Value) -> String {
    let canonical = canonicalize(args);
    let encoded = serde_json::to_string(&canonical).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b"|");
    hasher.update(encoded.as_bytes());
    format!("{:x}", hasher.finalize())
}
