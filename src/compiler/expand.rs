//! Pre-compile expansion of dynamic DAG shapes
//!
//! `branch` and `fan_out` directives are flattened into a concrete step list
//! before graph construction. Child ids follow the stable recipe
//! `parent[discriminant]`, and children are ordered by the canonical order of
//! the iteration collection, never by its declared order.

use crate::compiler::error::CompileError;
use crate::compiler::fingerprint::canonical_json;
use crate::compiler::params::ResolvedParams;
use crate::core::spec::{PipelineSpec, StepSpec};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// A concrete step after expansion; config is still pre-parameter-substitution
/// apart from the fan-out binding.
#[derive(Debug, Clone)]
pub struct ExpandedStep {
    pub id: String,
    pub component: String,
    pub config: BTreeMap<String, Value>,
    pub needs: Vec<String>,
    pub connection: Option<String>,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

/// Flatten branch/fan-out directives into a concrete step list.
pub fn expand(spec: &PipelineSpec, params: &ResolvedParams) -> Result<Vec<ExpandedStep>, CompileError> {
    let mut omitted: HashSet<String> = HashSet::new();
    // Fan-out parents map to the full set of their children for fan-in rewiring
    let mut replacements: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut steps: Vec<ExpandedStep> = Vec::new();

    for (idx, step) in spec.steps.iter().enumerate() {
        let pointer = format!("/steps/{}", idx);

        if let Some(branch) = &step.branch {
            let actual = params.substitute(&branch.when, &format!("{}/branch/when", pointer))?;
            let expected = branch.equals.clone().unwrap_or(Value::Bool(true));
            if actual != expected {
                omitted.insert(step.id.clone());
                continue;
            }
        }

        match &step.fan_out {
            None => steps.push(concrete(step, spec, step.id.clone(), step.config.clone())),
            Some(fan) => {
                let over = params.substitute(&fan.over, &format!("{}/fan_out/over", pointer))?;
                let items = match over {
                    Value::Array(items) => items,
                    other => {
                        return Err(CompileError::Validation {
                            pointer: format!("{}/fan_out/over", pointer),
                            message: format!(
                                "fan_out.over must resolve to a list, got {}",
                                canonical_json(&other)
                            ),
                        })
                    }
                };

                let mut children: Vec<(String, Value)> = items
                    .into_iter()
                    .map(|item| (discriminant(&item), item))
                    .collect();
                // Canonical order of the collection, not iteration order
                children.sort_by(|a, b| a.0.cmp(&b.0));

                let mut child_ids = Vec::with_capacity(children.len());
                for (disc, item) in children {
                    let child_id = format!("{}[{}]", step.id, disc);
                    let config = bind_item(&step.config, &fan.bind, &item, &pointer)?;
                    child_ids.push(child_id.clone());
                    steps.push(concrete(step, spec, child_id, config));
                }
                replacements.insert(step.id.clone(), child_ids);
            }
        }
    }

    // Rewire needs: fan-out parents fan in through all children; omitted
    // branch steps drop out of the edge set entirely.
    for step in &mut steps {
        let mut needs: Vec<String> = Vec::new();
        for need in std::mem::take(&mut step.needs) {
            if omitted.contains(&need) {
                continue;
            }
            match replacements.get(&need) {
                Some(children) => needs.extend(children.iter().cloned()),
                None => needs.push(need),
            }
        }
        needs.sort();
        needs.dedup();
        step.needs = needs;
    }

    Ok(steps)
}

fn concrete(
    step: &StepSpec,
    spec: &PipelineSpec,
    id: String,
    config: BTreeMap<String, Value>,
) -> ExpandedStep {
    ExpandedStep {
        id,
        component: step.component.clone(),
        config,
        needs: step.needs.clone(),
        connection: step.connection.clone(),
        max_retries: step.max_retries.unwrap_or(spec.defaults.max_retries),
        timeout_secs: step.timeout_secs.unwrap_or(spec.defaults.timeout_secs),
    }
}

/// Stable naming discriminant for one collection element
fn discriminant(item: &Value) -> String {
    match item {
        Value::String(s) => s.clone(),
        other => canonical_json(other),
    }
}

/// Substitute the fan-out binding (`${<bind>}`) through a child config
fn bind_item(
    config: &BTreeMap<String, Value>,
    bind: &str,
    item: &Value,
    pointer: &str,
) -> Result<BTreeMap<String, Value>, CompileError> {
    let placeholder = format!("${{{}}}", bind);
    let mut out = BTreeMap::new();
    for (k, v) in config {
        out.insert(
            k.clone(),
            bind_value(v, &placeholder, item, &format!("{}/config/{}", pointer, k))?,
        );
    }
    Ok(out)
}

fn bind_value(
    value: &Value,
    placeholder: &str,
    item: &Value,
    pointer: &str,
) -> Result<Value, CompileError> {
    match value {
        Value::String(s) if s == placeholder => Ok(item.clone()),
        Value::String(s) if s.contains(placeholder) => {
            let rendered = match item {
                Value::String(inner) => inner.clone(),
                other => canonical_json(other),
            };
            Ok(Value::String(s.replace(placeholder, &rendered)))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, v) in items.iter().enumerate() {
                out.push(bind_value(v, placeholder, item, &format!("{}/{}", pointer, i))?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(
                    k.clone(),
                    bind_value(v, placeholder, item, &format!("{}/{}", pointer, k))?,
                );
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
