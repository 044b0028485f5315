//! Secret key-set resolution
//!
//! Computes, once per compile, the closed set of field names that must never
//! appear with literal values in any persisted artifact. Sources: component
//! secret-path declarations, connection-reference fields bound from the
//! environment, and a keyword fallback for components that declare nothing.

use crate::core::registry::ComponentSpec;
use crate::core::spec::ConnectionRef;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Keyword fallback, applied only to components with no declared secret paths
const FALLBACK_KEYWORDS: &[&str] = &[
    "password",
    "passphrase",
    "token",
    "secret",
    "key",
    "credential",
    "api_key",
];

/// Immutable set of forbidden field names for one compile
#[derive(Debug, Clone, Default)]
pub struct SecretKeySet {
    keys: BTreeSet<String>,
}

impl SecretKeySet {
    /// Resolve the key set from the components a pipeline references plus its
    /// connection registry view.
    pub fn resolve<'a, I>(components: I, connections: &BTreeMap<String, ConnectionRef>) -> Self
    where
        I: IntoIterator<Item = &'a ComponentSpec>,
    {
        let mut keys = BTreeSet::new();

        for component in components {
            if component.secret_paths.is_empty() {
                for kw in FALLBACK_KEYWORDS {
                    keys.insert((*kw).to_string());
                }
            } else {
                for path in &component.secret_paths {
                    if let Some(leaf) = leaf_name(path) {
                        keys.insert(leaf.to_string());
                    }
                }
            }
        }

        for conn in connections.values() {
            for (field, value) in &conn.fields {
                if is_env_reference_str(value) {
                    keys.insert(field.clone());
                }
            }
        }

        Self { keys }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.keys.iter()
    }

    /// Names only, never values; safe to persist in the manifest
    pub fn to_vec(&self) -> Vec<String> {
        self.keys.iter().cloned().collect()
    }

    pub fn from_names<I: IntoIterator<Item = String>>(names: I) -> Self {
        Self {
            keys: names.into_iter().collect(),
        }
    }
}

/// Last segment of a JSON-pointer path
fn leaf_name(pointer: &str) -> Option<&str> {
    pointer.rsplit('/').next().filter(|s| !s.is_empty())
}

/// A value of the form `${env:VAR}` is an environment reference, resolved
/// only at run time and therefore legal to persist.
pub fn is_env_reference(value: &Value) -> bool {
    matches!(value, Value::String(s) if is_env_reference_str(s))
}

fn is_env_reference_str(s: &str) -> bool {
    s.starts_with("${env:") && s.ends_with('}')
}

/// Name of the environment variable an env reference resolves to
pub fn env_reference_var(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) if is_env_reference_str(s) => {
            Some(&s["${env:".len()..s.len() - 1])
        }
        _ => None,
    }
}
