//! Canonical serialization and SHA-256 fingerprinting
//!
//! Every fingerprint in a manifest is produced here so hashing rules stay
//! uniform: stable key ordering for maps, canonical decimal numbers,
//! lowercase booleans, UTF-8 with LF only. Array order is preserved because
//! declared order is part of the canonical contract for step configs.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Render a JSON value into its canonical string form.
///
/// Two logically-equal values render identically regardless of map insertion
/// order; any one-byte difference in content changes the output.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).expect("string escapes"),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), canonical_json(v));
            }
            let rendered: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| {
                    format!("{}:{}", serde_json::to_string(&k).expect("key escapes"), v)
                })
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}

/// SHA-256 hex digest over the canonical bytes of a JSON value.
pub fn digest(value: &Value) -> String {
    digest_str(&canonical_json(value))
}

/// SHA-256 hex digest over raw UTF-8 bytes.
pub fn digest_str(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let out = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in out {
        use std::fmt::Write;
        write!(hex, "{:02x}", byte).expect("hex write");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_is_stable() {
        let a = serde_json::from_str::<Value>(r#"{"b":1,"a":2}"#).unwrap();
        let b = serde_json::from_str::<Value>(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_nested_objects_sorted() {
        let v = json!({"z": {"y": true, "x": false}, "a": [3, 1, 2]});
        assert_eq!(canonical_json(&v), r#"{"a":[3,1,2],"z":{"x":false,"y":true}}"#);
    }

    #[test]
    fn test_array_order_preserved() {
        // Declared order is meaningful for configs; canonicalization must not sort it
        let v = json!(["b", "a", "c"]);
        assert_eq!(canonical_json(&v), r#"["b","a","c"]"#);
    }

    #[test]
    fn test_equal_values_hash_identically() {
        let a = serde_json::from_str::<Value>(r#"{"k":1,"j":[true,null]}"#).unwrap();
        let b = serde_json::from_str::<Value>(r#"{"j":[true,null],"k":1}"#).unwrap();
        assert_eq!(digest(&a), digest(&b));
    }

    #[test]
    fn test_single_byte_difference_changes_digest() {
        let a = json!({"message": "hello"});
        let b = json!({"message": "hellp"});
        assert_ne!(digest(&a), digest(&b));
    }

    #[test]
    fn test_digest_is_sha256_hex() {
        // Known vector: sha256("") = e3b0c442...
        assert_eq!(
            digest_str(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest_str("abc").len(), 64);
    }
}
