//! Shared test fixtures and helpers

use omlrun::compiler::{compile, CompileOptions, ResolvedParams, COMPILER_VERSION};
use omlrun::core::{Manifest, PipelineSpec, RegistryView};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Pipeline exercising completion, failure propagation, and fan-out
pub const PARITY_SPEC: &str = r#"
id: "parity"
steps:
  - id: "greet"
    component: "core/echo"
    config: { message: "hello" }
  - id: "shout"
    component: "core/transform"
    needs: ["greet"]
    config: { op: "upper" }
  - id: "fan"
    component: "core/echo"
    config: { message: "shard ${item}" }
    fan_out:
      over: ["b", "a"]
  - id: "gather"
    component: "core/merge"
    needs: ["fan", "shout"]
  - id: "oops"
    component: "core/flaky"
    config: { fail_attempts: 99 }
  - id: "tail"
    component: "core/transform"
    needs: ["oops"]
"#;

pub fn compile_spec(yaml: &str) -> Manifest {
    compile_spec_with_params(yaml, BTreeMap::new())
}

pub fn compile_spec_with_params(
    yaml: &str,
    cli_params: BTreeMap<String, serde_json::Value>,
) -> Manifest {
    let spec = PipelineSpec::from_yaml(yaml).expect("fixture spec parses");
    let params = ResolvedParams::resolve(
        &spec.declared_defaults(),
        None,
        &BTreeMap::new(),
        &cli_params,
    );
    compile(
        &spec,
        &RegistryView::builtin(),
        &params,
        &CompileOptions::default(),
        COMPILER_VERSION,
    )
    .expect("fixture spec compiles")
}

/// Fresh scratch directory under the system temp root
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("omlrun-{}-{}", tag, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

/// Event type tags from a persisted events file, in order
pub fn event_types(events_file: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(events_file)
        .expect("read events")
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("event line parses");
            value["type"].as_str().expect("type tag").to_string()
        })
        .collect()
}

/// Relative artifact paths under a run directory, sorted
pub fn artifact_paths(run_dir: &std::path::Path) -> Vec<String> {
    let mut paths = Vec::new();
    let root = run_dir.join("artifacts");
    if root.is_dir() {
        collect_files(&root, run_dir, &mut paths);
    }
    paths.sort();
    paths
}

fn collect_files(dir: &std::path::Path, root: &std::path::Path, out: &mut Vec<String>) {
    for entry in std::fs::read_dir(dir).expect("read dir") {
        let path = entry.expect("dir entry").path();
        if path.is_dir() {
            collect_files(&path, root, out);
        } else {
            out.push(
                path.strip_prefix(root)
                    .expect("under root")
                    .to_string_lossy()
                    .replace('\\', "/"),
            );
        }
    }
}
