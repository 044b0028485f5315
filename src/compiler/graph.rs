//! Dependency graph construction and deterministic topological ordering
//!
//! Kahn's algorithm with a lexical tie-break by step id among ready nodes.
//! The tie-break is load-bearing: it is what makes the manifest step order a
//! pure function of the expanded step set.

use crate::compiler::error::CompileError;
use crate::compiler::expand::ExpandedStep;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

/// Order the expanded steps topologically, smallest ready id first.
pub fn topo_order(steps: &[ExpandedStep]) -> Result<Vec<String>, CompileError> {
    let mut indegree: BTreeMap<&str, usize> = steps.iter().map(|s| (s.id.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for step in steps {
        for need in &step.needs {
            if !indegree.contains_key(need.as_str()) {
                return Err(CompileError::Validation {
                    pointer: format!("/steps/{}", step.id),
                    message: format!("need '{}' does not name an expanded step", need),
                });
            }
            *indegree.get_mut(step.id.as_str()).expect("known id") += 1;
            dependents.entry(need.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut ready: BinaryHeap<Reverse<&str>> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id.to_string());
        if let Some(next) = dependents.get(id) {
            for dependent in next {
                let deg = indegree.get_mut(dependent).expect("known id");
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse(*dependent));
                }
            }
        }
    }

    if order.len() != steps.len() {
        // Leftover nodes are on or downstream of a cycle; report the smallest id
        let stuck = indegree
            .iter()
            .filter(|(_, deg)| **deg > 0)
            .map(|(id, _)| *id)
            .min()
            .unwrap_or("");
        return Err(CompileError::CycleDetected {
            step: stuck.to_string(),
        });
    }

    Ok(order)
}
