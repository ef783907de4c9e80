//! Property tests for the round-trip and idempotence laws.

use proptest::prelude::*;

use research_mcp::cache::key::{canonicalize, key_hash};
use research_mcp::events::crypto::EventCipher;
use research_mcp::events::sanitize::sanitize;
use research_mcp::events::stream_id_of;
use research_mcp::text::{paragraph_hash, truncate_at_sentence};

const KEY: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

fn json_scalar() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        "[a-zA-Z0-9 ]{0,20}".prop_map(serde_json::Value::from),
        Just(serde_json::Value::Null),
    ]
}

proptest! {
    /// Key order never changes the hash.
    #[test]
    fn cache_key_is_order_independent(
        pairs in proptest::collection::hash_map("[a-z]{1,8}", json_scalar(), 1..8)
    ) {
        let forward: serde_json::Map<String, serde_json::Value> =
            pairs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut reversed_keys: Vec<&String> = pairs.keys().collect();
        reversed_keys.sort();
        reversed_keys.reverse();
        let reversed: serde_json::Map<String, serde_json::Value> =
            reversed_keys.into_iter().map(|k| (k.clone(), pairs[k].clone())).collect();

        prop_assert_eq!(
            key_hash("ns", &serde_json::Value::Object(forward)),
            key_hash("ns", &serde_json::Value::Object(reversed))
        );
    }

    /// Canonicalization is a fixpoint.
    #[test]
    fn canonicalize_is_idempotent(
        pairs in proptest::collection::hash_map("[a-z]{1,8}", json_scalar(), 0..8)
    ) {
        let value = serde_json::Value::Object(pairs.into_iter().collect());
        let once = canonicalize(&value);
        prop_assert_eq!(canonicalize(&once), once.clone());
    }

    /// sanitize(sanitize(m)) == sanitize(m).
    #[test]
    fn sanitize_is_idempotent(
        keys in proptest::collection::vec(
            prop_oneof![Just("token".to_owned()), Just("password".to_owned()), "[a-z]{1,8}"],
            0..8
        ),
        values in proptest::collection::vec(json_scalar(), 8)
    ) {
        let object: serde_json::Map<String, serde_json::Value> =
            keys.into_iter().zip(values).collect();
        let message = serde_json::Value::Object(object);

        let once = sanitize(&message);
        prop_assert_eq!(sanitize(&once), once.clone());
    }

    /// Truncation never exceeds the budget and never splits a char.
    #[test]
    fn truncation_respects_budget(text in ".{0,500}", max in 10usize..200) {
        let (out, truncated) = truncate_at_sentence(&text, max);
        prop_assert!(out.len() <= max);
        if !truncated {
            prop_assert_eq!(out.as_str(), text.as_str());
        }
        // Valid UTF-8 by construction; length check is on bytes.
        prop_assert!(out.is_char_boundary(out.len()));
    }

    /// Authenticated encryption round-trips exactly.
    #[test]
    fn encrypt_decrypt_roundtrip(text in ".{0,200}", n in any::<i64>()) {
        let cipher = EventCipher::from_hex(KEY).unwrap();
        let message = serde_json::json!({"jsonrpc": "2.0", "result": {"text": text, "n": n}});

        let envelope = cipher.encrypt(&message).unwrap();
        prop_assert_eq!(cipher.decrypt(&envelope).unwrap(), message);
    }

    /// The stream id embedded in an event id always parses back out.
    #[test]
    fn event_id_encodes_stream(stream in "[a-z0-9-]{1,32}", millis in 0i64..=i64::MAX, r in any::<u32>()) {
        let event_id = format!("{stream}_{millis}_{r:08x}");
        prop_assert_eq!(stream_id_of(&event_id), Some(stream.as_str()));
    }

    /// Paragraph hashing ignores case and whitespace.
    #[test]
    fn paragraph_hash_normalizes(text in "[a-zA-Z ]{1,80}") {
        let shouted = text.to_uppercase();
        let squeezed: String = text.split_whitespace().collect::<Vec<_>>().join("  ");
        prop_assert_eq!(paragraph_hash(&text), paragraph_hash(&shouted));
        prop_assert_eq!(paragraph_hash(&text), paragraph_hash(&squeezed));
    }
}
