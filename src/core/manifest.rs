//! Compiled manifest: the only input the runtime trusts
//!
//! A manifest is the compiler's sole output: concrete steps in deterministic
//! topological order, the five input fingerprints, and provenance metadata.
//! Its on-disk form is the canonical JSON rendering, so recompiling identical
//! inputs yields byte-identical files.

use crate::compiler::fingerprint::{canonical_json, digest};
use crate::core::spec::ConnectionRef;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// One concrete step of a compiled manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestStep {
    pub id: String,

    /// Component reference the step was declared with
    pub component: String,

    /// Driver the runtime dispatches to
    pub driver: String,

    /// Fully-substituted config; secret-keyed values are env references only
    pub config: BTreeMap<String, Value>,

    /// Upstream step ids, sorted
    pub needs: Vec<String>,

    /// Connection alias, if the step uses one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,

    pub max_retries: u32,
    pub timeout_ms: u64,
}

/// The five input-slice fingerprints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprints {
    pub oml_fp: String,
    pub registry_fp: String,
    pub compiler_fp: String,
    pub params_fp: String,
    pub manifest_fp: String,
}

/// Provenance metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMeta {
    /// Compiler toolchain version the manifest was produced by
    pub toolchain: String,

    /// Active profile, if one was selected
    pub profile: Option<String>,

    /// Generation timestamp; excluded from every fingerprint and omitted
    /// under the default timestamp policy so output stays reproducible
    pub generated_at: Option<DateTime<Utc>>,
}

/// Compiled pipeline manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub pipeline_id: String,

    /// Steps in deterministic topological order
    pub steps: Vec<ManifestStep>,

    pub fingerprints: Fingerprints,

    /// Secret field names (never values) for the collector's redaction pass
    pub secret_keys: Vec<String>,

    /// Connection references; secret-bearing fields are env placeholders
    pub connections: BTreeMap<String, ConnectionRef>,

    pub meta: ManifestMeta,
}

impl Manifest {
    /// Canonical byte rendering, the form that gets persisted and compared
    pub fn to_canonical_string(&self) -> String {
        let value = serde_json::to_value(self).expect("manifest serializes");
        canonical_json(&value)
    }

    /// Input slice for the manifest's own fingerprint: the manifest with its
    /// self-fingerprint blanked and the wall-clock field nulled.
    pub fn self_fingerprint(&self) -> String {
        let mut for_hash = self.clone();
        for_hash.fingerprints.manifest_fp = String::new();
        for_hash.meta.generated_at = None;
        let value = serde_json::to_value(&for_hash).expect("manifest serializes");
        digest(&value)
    }

    pub fn step(&self, id: &str) -> Option<&ManifestStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path.as_ref(), self.to_canonical_string())
            .with_context(|| format!("Failed to write manifest {}", path.as_ref().display()))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest {}", path.as_ref().display()))?;
        serde_json::from_str(&content).context("Failed to parse manifest")
    }
}
