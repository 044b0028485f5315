//! Pipeline spec loaded from YAML
//!
//! The spec is validated for shape by an external collaborator before it
//! reaches the compiler; the checks here are the structural minimum the
//! compiler cannot proceed without (unique ids, resolvable `needs`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// User-authored pipeline description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Stable pipeline identifier
    pub id: String,

    /// Declared parameters (name -> declaration)
    #[serde(default)]
    pub params: BTreeMap<String, ParamDecl>,

    /// Named profiles overriding parameter values
    #[serde(default)]
    pub profiles: BTreeMap<String, BTreeMap<String, Value>>,

    /// Named connection references (alias -> fields, values may be env placeholders)
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionRef>,

    /// Retry/timeout defaults applied to steps that declare none
    #[serde(default)]
    pub defaults: StepDefaults,

    /// Ordered step declarations
    pub steps: Vec<StepSpec>,
}

/// A single declared parameter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParamDecl {
    /// Default value; a parameter without a default must be supplied by a
    /// higher-precedence layer or compilation fails on first use
    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub description: Option<String>,
}

/// A connection alias: field name -> value, where secret-bearing fields are
/// `${env:VAR}` placeholders resolved only at run time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRef {
    pub fields: BTreeMap<String, String>,
}

/// Global retry/timeout defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefaults {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_retries() -> u32 {
    0
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// One step declaration in the DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique step identifier
    pub id: String,

    /// Component reference resolved through the registry view
    pub component: String,

    /// Step configuration, pre-substitution
    #[serde(default)]
    pub config: BTreeMap<String, Value>,

    /// Upstream step ids this step waits on
    #[serde(default)]
    pub needs: Vec<String>,

    /// Connection alias this step uses, if any
    #[serde(default)]
    pub connection: Option<String>,

    /// Retry override
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Timeout override
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Expand this declaration into one child per collection element
    #[serde(default)]
    pub fan_out: Option<FanOutSpec>,

    /// Include this step only when the condition holds
    #[serde(default)]
    pub branch: Option<BranchSpec>,
}

/// Fan-out directive: one child step per element of `over`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutSpec {
    /// The iteration collection: an inline list or a `${params.*}` reference
    pub over: Value,

    /// Binding name for the current element inside the child config
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "item".to_string()
}

/// Branch directive: conditional step inclusion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchSpec {
    /// Value under test, usually a `${params.*}` reference
    pub when: Value,

    /// Expected value; defaults to boolean true
    #[serde(default)]
    pub equals: Option<Value>,
}

impl PipelineSpec {
    /// Load a pipeline spec from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a pipeline spec from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let spec: PipelineSpec = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Structural validation: unique ids, needs reference declared steps
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(&step.id) {
                anyhow::bail!("Duplicate step id: {}", step.id);
            }
            if step.id.contains('[') || step.id.contains(']') {
                anyhow::bail!(
                    "Step id '{}' may not contain brackets (reserved for fan-out children)",
                    step.id
                );
            }
        }

        let ids: HashSet<_> = self.steps.iter().map(|s| &s.id).collect();
        for step in &self.steps {
            for need in &step.needs {
                if !ids.contains(need) {
                    anyhow::bail!("Step '{}' needs non-existent step '{}'", step.id, need);
                }
            }
            if let Some(conn) = &step.connection {
                if !self.connections.contains_key(conn) {
                    anyhow::bail!(
                        "Step '{}' references undeclared connection '{}'",
                        step.id,
                        conn
                    );
                }
            }
        }

        Ok(())
    }

    /// Canonicalizable view of the whole spec, for the oml fingerprint
    pub fn as_value(&self) -> Value {
        serde_json::to_value(self).expect("spec serializes")
    }

    /// Declared defaults in the shape the parameter resolver consumes
    pub fn declared_defaults(&self) -> BTreeMap<String, Option<Value>> {
        self.params
            .iter()
            .map(|(name, decl)| (name.clone(), decl.default.clone()))
            .collect()
    }
}
