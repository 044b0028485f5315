//! Parameter resolution and `${params.*}` substitution

use crate::compiler::error::CompileError;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Environment variable prefix for parameter overrides
pub const ENV_PARAM_PREFIX: &str = "OML_PARAM_";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{params\.([A-Za-z0-9_.-]+)\}").expect("placeholder regex"))
}

/// Fully-resolved parameter values, ordered by name
#[derive(Debug, Clone, Default)]
pub struct ResolvedParams {
    values: BTreeMap<String, Value>,
}

impl ResolvedParams {
    /// Merge parameter sources by fixed precedence: CLI > environment >
    /// active profile > declared default. Declared parameters with no value
    /// from any layer stay unset and fail later at substitution time.
    pub fn resolve(
        declared_defaults: &BTreeMap<String, Option<Value>>,
        profile_overrides: Option<&BTreeMap<String, Value>>,
        env_vars: &BTreeMap<String, String>,
        cli_overrides: &BTreeMap<String, Value>,
    ) -> Self {
        let mut values = BTreeMap::new();

        for (name, default) in declared_defaults {
            if let Some(v) = default {
                values.insert(name.clone(), v.clone());
            }
        }

        if let Some(profile) = profile_overrides {
            for (name, v) in profile {
                values.insert(name.clone(), v.clone());
            }
        }

        for (key, raw) in env_vars {
            if let Some(name) = key.strip_prefix(ENV_PARAM_PREFIX) {
                values.insert(name.to_lowercase(), parse_scalar(raw));
            }
        }

        for (name, v) in cli_overrides {
            values.insert(name.clone(), v.clone());
        }

        Self { values }
    }

    /// Build directly from known values (used by tests and the expansion pass)
    pub fn from_values(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Canonicalizable view of the resolved values, for the params fingerprint
    pub fn as_value(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }

    /// Substitute `${params.name}` placeholders recursively through maps,
    /// lists, and strings. A string consisting of exactly one placeholder is
    /// replaced by the typed parameter value; embedded placeholders render
    /// scalars into the surrounding string. Any unresolved placeholder is a
    /// fatal compile error, never left in the output.
    pub fn substitute(&self, value: &Value, pointer: &str) -> Result<Value, CompileError> {
        match value {
            Value::String(s) => self.substitute_str(s, pointer),
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(self.substitute(item, &format!("{}/{}", pointer, i))?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.substitute(v, &format!("{}/{}", pointer, k))?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn substitute_str(&self, s: &str, pointer: &str) -> Result<Value, CompileError> {
        let re = placeholder_re();

        // Whole-string placeholder keeps the parameter's type
        if let Some(caps) = re.captures(s) {
            let full = caps.get(0).expect("match").as_str();
            if full == s {
                let name = &caps[1];
                return self
                    .values
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CompileError::UnresolvedParam {
                        name: name.to_string(),
                        pointer: pointer.to_string(),
                    });
            }
        }

        let mut unresolved = None;
        let replaced = re.replace_all(s, |caps: &regex::Captures<'_>| {
            let name = caps[1].to_string();
            match self.values.get(&name) {
                Some(v) => render_scalar(v),
                None => {
                    unresolved.get_or_insert(name);
                    String::new()
                }
            }
        });

        if let Some(name) = unresolved {
            return Err(CompileError::UnresolvedParam {
                name,
                pointer: pointer.to_string(),
            });
        }

        Ok(Value::String(replaced.into_owned()))
    }
}

/// Parse an override string into the richest JSON scalar it reads as
pub fn parse_scalar(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::Null)) => v,
        _ => Value::String(raw.to_string()),
    }
}

fn render_scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        // Embedding a collection in a string renders its canonical form
        other => crate::compiler::fingerprint::canonical_json(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn declared(pairs: &[(&str, Option<Value>)]) -> BTreeMap<String, Option<Value>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_precedence_cli_wins() {
        let defaults = declared(&[("batch_size", Some(json!(8)))]);
        let profile: BTreeMap<String, Value> =
            [("batch_size".to_string(), json!(16))].into_iter().collect();
        let env: BTreeMap<String, String> =
            [("OML_PARAM_BATCH_SIZE".to_string(), "32".to_string())]
                .into_iter()
                .collect();
        let cli: BTreeMap<String, Value> =
            [("batch_size".to_string(), json!(64))].into_iter().collect();

        let params = ResolvedParams::resolve(&defaults, Some(&profile), &env, &cli);
        assert_eq!(params.get("batch_size"), Some(&json!(64)));
    }

    #[test]
    fn test_precedence_env_over_profile() {
        let defaults = declared(&[("region", Some(json!("default")))]);
        let profile: BTreeMap<String, Value> =
            [("region".to_string(), json!("profile"))].into_iter().collect();
        let env: BTreeMap<String, String> =
            [("OML_PARAM_REGION".to_string(), "env".to_string())]
                .into_iter()
                .collect();

        let params = ResolvedParams::resolve(&defaults, Some(&profile), &env, &BTreeMap::new());
        assert_eq!(params.get("region"), Some(&json!("env")));
    }

    #[test]
    fn test_profile_over_default() {
        let defaults = declared(&[("mode", Some(json!("dev")))]);
        let profile: BTreeMap<String, Value> =
            [("mode".to_string(), json!("prod"))].into_iter().collect();

        let params =
            ResolvedParams::resolve(&defaults, Some(&profile), &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(params.get("mode"), Some(&json!("prod")));
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let params = ResolvedParams::from_values(
            [("count".to_string(), json!(5))].into_iter().collect(),
        );
        let out = params.substitute(&json!("${params.count}"), "/config").unwrap();
        assert_eq!(out, json!(5));
    }

    #[test]
    fn test_embedded_placeholder_renders_scalar() {
        let params = ResolvedParams::from_values(
            [("name".to_string(), json!("world"))].into_iter().collect(),
        );
        let out = params
            .substitute(&json!("hello ${params.name}!"), "/config")
            .unwrap();
        assert_eq!(out, json!("hello world!"));
    }

    #[test]
    fn test_substitution_recurses_into_collections() {
        let params = ResolvedParams::from_values(
            [("n".to_string(), json!(2))].into_iter().collect(),
        );
        let input = json!({"outer": {"list": ["${params.n}", "x${params.n}"]}});
        let out = params.substitute(&input, "/config").unwrap();
        assert_eq!(out, json!({"outer": {"list": [2, "x2"]}}));
    }

    #[test]
    fn test_unresolved_placeholder_is_fatal() {
        let params = ResolvedParams::default();
        let err = params
            .substitute(&json!("${params.batch_size}"), "/steps/0/config/size")
            .unwrap_err();
        match err {
            CompileError::UnresolvedParam { name, pointer } => {
                assert_eq!(name, "batch_size");
                assert_eq!(pointer, "/steps/0/config/size");
            }
            other => panic!("expected UnresolvedParam, got {:?}", other),
        }
    }

    #[test]
    fn test_env_override_parses_scalars() {
        let env: BTreeMap<String, String> = [
            ("OML_PARAM_LIMIT".to_string(), "9".to_string()),
            ("OML_PARAM_FLAG".to_string(), "true".to_string()),
            ("OML_PARAM_LABEL".to_string(), "plain".to_string()),
        ]
        .into_iter()
        .collect();
        let params =
            ResolvedParams::resolve(&BTreeMap::new(), None, &env, &BTreeMap::new());
        assert_eq!(params.get("limit"), Some(&json!(9)));
        assert_eq!(params.get("flag"), Some(&json!(true)));
        assert_eq!(params.get("label"), Some(&json!("plain")));
    }
}
