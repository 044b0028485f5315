//! Spec-to-manifest compilation
//!
//! Side-effect free and non-interactive: inputs are read, a manifest (or a
//! compile error with a pointer into the spec) comes out. The only wall-clock
//! content is the labeled `generated_at` field, which never participates in
//! fingerprinting and is omitted under the default policy.

use crate::compiler::error::CompileError;
use crate::compiler::expand::{expand, ExpandedStep};
use crate::compiler::fingerprint::{digest, digest_str};
use crate::compiler::graph::topo_order;
use crate::compiler::params::ResolvedParams;
use crate::compiler::secrets::{is_env_reference, SecretKeySet};
use crate::core::manifest::{Fingerprints, Manifest, ManifestMeta, ManifestStep};
use crate::core::registry::RegistryView;
use crate::core::spec::PipelineSpec;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Compiler toolchain identity; feeds compiler_fp
pub const COMPILER_VERSION: &str = concat!("omlrun ", env!("CARGO_PKG_VERSION"));

/// Whether `meta.generated_at` is stamped. The default omits it, which is
/// what makes double-compiles byte-identical.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampPolicy {
    #[default]
    Omit,
    Stamp,
}

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub profile: Option<String>,
    pub timestamp: TimestampPolicy,
}

/// Compile a validated spec into a manifest.
pub fn compile(
    spec: &PipelineSpec,
    registry: &RegistryView,
    params: &ResolvedParams,
    options: &CompileOptions,
    compiler_version: &str,
) -> Result<Manifest, CompileError> {
    // 1. Expand dynamic shapes into a flat, deterministic step list
    let expanded = expand(spec, params)?;
    debug!(steps = expanded.len(), "expanded step list");

    // 2. Resolve the secret key set once, over the components actually used
    let mut components = Vec::with_capacity(expanded.len());
    for step in &expanded {
        let component = registry.component(&step.component).ok_or_else(|| {
            CompileError::Validation {
                pointer: format!("/steps/{}", step.id),
                message: format!("unknown component '{}'", step.component),
            }
        })?;
        components.push(component);
    }
    let secret_keys = SecretKeySet::resolve(components.iter().copied(), &spec.connections);

    // 3. Substitute parameters through every config, then reject inline secrets
    let mut configs: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for step in &expanded {
        let pointer = format!("/steps/{}/config", step.id);
        let mut resolved = BTreeMap::new();
        for (key, value) in &step.config {
            let substituted = params.substitute(value, &format!("{}/{}", pointer, key))?;
            resolved.insert(key.clone(), substituted);
        }
        check_inline_secrets(&step.id, &resolved, &secret_keys)?;
        configs.insert(step.id.clone(), resolved);
    }

    // 4. Deterministic topological order
    let order = topo_order(&expanded)?;
    let by_id: BTreeMap<&str, &ExpandedStep> =
        expanded.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut steps = Vec::with_capacity(order.len());
    for id in &order {
        let step = by_id[id.as_str()];
        let component = registry.component(&step.component).expect("checked above");
        let mut needs = step.needs.clone();
        needs.sort();
        steps.push(ManifestStep {
            id: step.id.clone(),
            component: step.component.clone(),
            driver: component.driver.clone(),
            config: configs.remove(&step.id).unwrap_or_default(),
            needs,
            connection: step.connection.clone(),
            max_retries: step.max_retries,
            timeout_ms: step.timeout_secs.saturating_mul(1000),
        });
    }

    // 5. Fingerprints over independent input slices
    let mut manifest = Manifest {
        pipeline_id: spec.id.clone(),
        steps,
        fingerprints: Fingerprints {
            oml_fp: digest(&spec.as_value()),
            registry_fp: digest(&registry.as_value()),
            compiler_fp: digest_str(compiler_version),
            params_fp: digest(&params.as_value()),
            manifest_fp: String::new(),
        },
        secret_keys: secret_keys.to_vec(),
        connections: spec.connections.clone(),
        meta: ManifestMeta {
            toolchain: compiler_version.to_string(),
            profile: options.profile.clone(),
            generated_at: match options.timestamp {
                TimestampPolicy::Omit => None,
                TimestampPolicy::Stamp => Some(Utc::now()),
            },
        },
    };
    manifest.fingerprints.manifest_fp = manifest.self_fingerprint();

    Ok(manifest)
}

/// A literal value under a secret key anywhere in a config is a hard error;
/// env references pass through and are resolved only at run time.
fn check_inline_secrets(
    step_id: &str,
    config: &BTreeMap<String, Value>,
    secrets: &SecretKeySet,
) -> Result<(), CompileError> {
    for (key, value) in config {
        check_inline_value(step_id, key, value, secrets)?;
    }
    Ok(())
}

fn check_inline_value(
    step_id: &str,
    key: &str,
    value: &Value,
    secrets: &SecretKeySet,
) -> Result<(), CompileError> {
    if secrets.contains(key) && !value.is_null() && !is_env_reference(value) {
        return Err(CompileError::SecretInlineForbidden {
            step: step_id.to_string(),
            key: key.to_string(),
        });
    }
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                check_inline_value(step_id, k, v, secrets)?;
            }
        }
        Value::Array(items) => {
            for v in items {
                check_inline_value(step_id, key, v, secrets)?;
            }
        }
        _ => {}
    }
    Ok(())
}
