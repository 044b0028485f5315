//! Artifact collector
//!
//! Normalizes whatever an adapter returns into one on-disk layout, identical
//! across backends:
//!
//! ```text
//! out/
//!   manifest            canonical manifest bytes
//!   cfg/<step_id>       secret-stripped resolved config per step
//!   meta                toolchain/provenance + per-config checksums
//!   events              append-only NDJSON event stream
//!   metrics             append-only NDJSON metric stream
//!   artifacts/<id>/...  step-produced outputs
//! ```
//!
//! The final redaction pass runs here, independent of whatever the adapters
//! already stripped: values under secret keys are blanked, and any literal
//! occurrence of a bound secret value is scrubbed from persisted text.

use crate::compiler::fingerprint::{canonical_json, digest_str};
use crate::core::manifest::Manifest;
use crate::error::RunError;
use crate::execution::{CollectedArtifacts, ExecResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

const REDACTED: &str = "[redacted]";

pub struct ArtifactCollector {
    out_dir: PathBuf,
    /// Bound secret values to scrub wherever they appear as literals
    secret_values: Vec<String>,
}

impl ArtifactCollector {
    pub fn new(out_dir: PathBuf) -> Self {
        Self {
            out_dir,
            secret_values: Vec::new(),
        }
    }

    pub fn with_secret_values(mut self, values: Vec<String>) -> Self {
        self.secret_values = values.into_iter().filter(|v| !v.is_empty()).collect();
        self
    }

    /// Persist one run into the canonical layout.
    pub fn persist(
        &self,
        manifest: &Manifest,
        exec: &ExecResult,
        collected: &CollectedArtifacts,
    ) -> Result<(), RunError> {
        std::fs::create_dir_all(&self.out_dir)
            .map_err(|e| RunError::Collect(format!("create out dir: {}", e)))?;

        std::fs::write(self.out_dir.join("manifest"), manifest.to_canonical_string())
            .map_err(|e| RunError::Collect(format!("write manifest: {}", e)))?;

        // Per-step secret-stripped configs, checksummed for downstream audit
        let cfg_dir = self.out_dir.join("cfg");
        std::fs::create_dir_all(&cfg_dir)
            .map_err(|e| RunError::Collect(format!("create cfg dir: {}", e)))?;
        let mut checksums: BTreeMap<String, String> = BTreeMap::new();
        for step in &manifest.steps {
            let config = Value::Object(
                step.config
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );
            let redacted = redact_keys(&config, &manifest.secret_keys);
            let rendered = self.scrub(&canonical_json(&redacted));
            checksums.insert(step.id.clone(), digest_str(&rendered));
            std::fs::write(cfg_dir.join(&step.id), rendered)
                .map_err(|e| RunError::Collect(format!("write cfg/{}: {}", step.id, e)))?;
        }

        self.write_ndjson(
            "events",
            exec.events
                .iter()
                .map(|e| serde_json::to_value(e).expect("event serializes")),
        )?;
        self.write_ndjson(
            "metrics",
            exec.metrics
                .iter()
                .map(|m| serde_json::to_value(m).expect("metric serializes")),
        )?;

        let meta = serde_json::json!({
            "toolchain": manifest.meta.toolchain,
            "profile": manifest.meta.profile,
            "pipeline_id": manifest.pipeline_id,
            "outcome": exec.outcome,
            "error": exec.error,
            "statuses": exec.statuses,
            "config_checksums": checksums,
        });
        std::fs::write(self.out_dir.join("meta"), self.scrub(&canonical_json(&meta)))
            .map_err(|e| RunError::Collect(format!("write meta: {}", e)))?;

        // Step artifacts, byte-for-byte apart from literal secret scrubbing
        for rel in &collected.rel_paths {
            let src = collected.staging_root.join(rel);
            let dest = self.out_dir.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RunError::Collect(format!("create {}: {}", rel, e)))?;
            }
            let bytes =
                std::fs::read(&src).map_err(|e| RunError::Collect(format!("read {}: {}", rel, e)))?;
            let bytes = match String::from_utf8(bytes) {
                Ok(text) => self.scrub(&text).into_bytes(),
                Err(raw) => raw.into_bytes(),
            };
            std::fs::write(&dest, bytes)
                .map_err(|e| RunError::Collect(format!("write {}: {}", rel, e)))?;
        }
        debug!(count = collected.rel_paths.len(), "artifacts persisted");

        // Staging served its purpose
        std::fs::remove_dir_all(&collected.staging_root).ok();

        info!(out = %self.out_dir.display(), "run persisted");
        Ok(())
    }

    fn write_ndjson<I: Iterator<Item = Value>>(
        &self,
        name: &str,
        entries: I,
    ) -> Result<(), RunError> {
        let mut content = String::new();
        for entry in entries {
            content.push_str(&self.scrub(&canonical_json(&entry)));
            content.push('\n');
        }
        std::fs::write(self.out_dir.join(name), content)
            .map_err(|e| RunError::Collect(format!("write {}: {}", name, e)))
    }

    fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.secret_values {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), REDACTED);
            }
        }
        out
    }
}

/// Replace every value under a secret key, at any depth
fn redact_keys(value: &Value, secret_keys: &[String]) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if secret_keys.iter().any(|s| s == k) {
                    out.insert(k.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(k.clone(), redact_keys(v, secret_keys));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| redact_keys(v, secret_keys)).collect())
        }
        other => other.clone(),
    }
}
