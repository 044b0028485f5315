//! Component registry view
//!
//! The registry itself lives with an external loader; the compiler consumes
//! this read-only view: component name -> driver reference, declared secret
//! paths, capability flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// One registered component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Driver the runtime dispatches this component to
    pub driver: String,

    /// JSON-pointer paths (relative to the step config) whose leaves hold secrets
    #[serde(default)]
    pub secret_paths: Vec<String>,

    /// Capability flags, opaque to the compiler
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Read-only registry view handed to the compiler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryView {
    pub components: BTreeMap<String, ComponentSpec>,
}

impl RegistryView {
    /// Registry covering the built-in drivers
    pub fn builtin() -> Self {
        let mut components = BTreeMap::new();
        components.insert(
            "core/echo".to_string(),
            ComponentSpec {
                driver: "echo".to_string(),
                secret_paths: vec![],
                capabilities: vec![],
            },
        );
        components.insert(
            "core/transform".to_string(),
            ComponentSpec {
                driver: "transform".to_string(),
                secret_paths: vec![],
                capabilities: vec![],
            },
        );
        components.insert(
            "core/merge".to_string(),
            ComponentSpec {
                driver: "merge".to_string(),
                secret_paths: vec![],
                capabilities: vec![],
            },
        );
        components.insert(
            "core/sleep".to_string(),
            ComponentSpec {
                driver: "sleep".to_string(),
                secret_paths: vec![],
                capabilities: vec![],
            },
        );
        components.insert(
            "core/flaky".to_string(),
            ComponentSpec {
                driver: "flaky".to_string(),
                secret_paths: vec![],
                capabilities: vec![],
            },
        );
        components.insert(
            "core/notify".to_string(),
            ComponentSpec {
                driver: "notify".to_string(),
                secret_paths: vec!["/auth/token".to_string()],
                capabilities: vec!["egress".to_string()],
            },
        );
        Self { components }
    }

    /// Load a registry document and merge it over the built-ins
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read registry {}", path.as_ref().display()))?;
        let loaded: RegistryView =
            serde_json::from_str(&content).context("Failed to parse registry document")?;
        let mut view = Self::builtin();
        view.components.extend(loaded.components);
        Ok(view)
    }

    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.components.get(name)
    }

    /// Canonicalizable view for the registry fingerprint
    pub fn as_value(&self) -> Value {
        serde_json::to_value(self).expect("registry serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_components_present() {
        let view = RegistryView::builtin();
        assert!(view.component("core/echo").is_some());
        assert!(view.component("core/merge").is_some());
        assert!(view.component("missing/one").is_none());
    }

    #[test]
    fn test_notify_declares_secret_path() {
        let view = RegistryView::builtin();
        let notify = view.component("core/notify").unwrap();
        assert_eq!(notify.secret_paths, vec!["/auth/token"]);
    }

    #[test]
    fn test_registry_value_is_stable() {
        let a = RegistryView::builtin().as_value();
        let b = RegistryView::builtin().as_value();
        assert_eq!(
            crate::compiler::fingerprint::digest(&a),
            crate::compiler::fingerprint::digest(&b)
        );
    }
}
