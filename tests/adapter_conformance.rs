//! Adapter conformance: the same fixtures through both backends
//!
//! The local and remote sandbox adapters must produce the same artifact
//! relative paths, the same ordered event-type sequence, and the same metric
//! names for a fixed manifest.

mod common;

use common::{artifact_paths, compile_spec, event_types, scratch_dir, PARITY_SPEC};
use omlrun::execution::{orchestrate, LocalAdapter, RunConfig, RunOutcome};
use omlrun::sandbox::{RemoteSandboxAdapter, SandboxConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

fn remote_adapter() -> RemoteSandboxAdapter {
    RemoteSandboxAdapter::new(SandboxConfig {
        program: PathBuf::from(env!("CARGO_BIN_EXE_omlrun")),
        args: vec!["__sandbox".to_string()],
        isolate_network: true,
    })
}

fn run_config(out_dir: PathBuf) -> RunConfig {
    RunConfig {
        out_dir,
        run_timeout: Some(Duration::from_secs(60)),
        heartbeat_interval: Duration::from_millis(100),
        stall_window: Duration::from_secs(20),
        env: BTreeMap::new(),
    }
}

fn metric_names(run_dir: &std::path::Path) -> BTreeSet<String> {
    std::fs::read_to_string(run_dir.join("metrics"))
        .expect("read metrics")
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["name"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn test_both_backends_observably_identical() {
    let manifest = compile_spec(PARITY_SPEC);
    let base = scratch_dir("parity");
    let local_out = base.join("local");
    let remote_out = base.join("remote");

    let local = orchestrate(
        &LocalAdapter::default(),
        &manifest,
        &run_config(local_out.clone()),
    )
    .await
    .expect("local run");
    let remote = orchestrate(
        &remote_adapter(),
        &manifest,
        &run_config(remote_out.clone()),
    )
    .await
    .expect("remote run");

    // The fixture contains a failing step, so both report Failed per step
    assert_eq!(local.outcome, RunOutcome::Failed);
    assert_eq!(remote.outcome, RunOutcome::Failed);
    assert_eq!(local.statuses, remote.statuses);

    // Same artifact relative paths
    assert_eq!(artifact_paths(&local_out), artifact_paths(&remote_out));
    assert!(artifact_paths(&local_out)
        .contains(&"artifacts/fan[a]/message.txt".to_string()));

    // Same ordered event-type sequence
    assert_eq!(
        event_types(&local_out.join("events")),
        event_types(&remote_out.join("events"))
    );

    // Same metric names
    assert_eq!(metric_names(&local_out), metric_names(&remote_out));

    // Same layout contract
    for file in ["manifest", "meta", "events", "metrics"] {
        assert!(local_out.join(file).is_file());
        assert!(remote_out.join(file).is_file());
    }

    // Identical manifests and identical secret-stripped configs
    assert_eq!(
        std::fs::read(local_out.join("manifest")).unwrap(),
        std::fs::read(remote_out.join("manifest")).unwrap()
    );
    for step in &manifest.steps {
        assert_eq!(
            std::fs::read(local_out.join("cfg").join(&step.id)).unwrap(),
            std::fs::read(remote_out.join("cfg").join(&step.id)).unwrap(),
            "cfg mismatch for {}",
            step.id
        );
    }

    std::fs::remove_dir_all(&base).ok();
}

#[tokio::test]
async fn test_remote_secret_bindings_reach_drivers_without_leaking() {
    let manifest = compile_spec(
        r#"
id: "secretrun"
steps:
  - id: "announce"
    component: "core/notify"
    config:
      target: "ops"
      auth:
        token: "${env:NOTIFY_TOKEN}"
"#,
    );
    let base = scratch_dir("secretrun");
    let out = base.join("run");
    let mut cfg = run_config(out.clone());
    cfg.env
        .insert("NOTIFY_TOKEN".to_string(), "sbx-t0k3n-value".to_string());

    let summary = orchestrate(&remote_adapter(), &manifest, &cfg)
        .await
        .expect("remote run");
    assert_eq!(summary.outcome, RunOutcome::Completed);

    // The receipt proves delivery; no persisted file may carry the literal
    let receipt =
        std::fs::read_to_string(out.join("artifacts/announce/receipt.json")).unwrap();
    assert!(receipt.contains("delivered"));
    for file in ["manifest", "meta", "events", "metrics", "cfg/announce"] {
        let content = std::fs::read_to_string(out.join(file)).unwrap();
        assert!(
            !content.contains("sbx-t0k3n-value"),
            "secret literal leaked into {}",
            file
        );
    }

    std::fs::remove_dir_all(&base).ok();
}

#[tokio::test]
async fn test_remote_run_completes_with_retries() {
    let manifest = compile_spec(
        r#"
id: "retryrun"
steps:
  - id: "wobble"
    component: "core/flaky"
    max_retries: 3
    config: { fail_attempts: 2 }
"#,
    );
    let base = scratch_dir("retryrun");
    let out = base.join("run");

    let summary = orchestrate(&remote_adapter(), &manifest, &run_config(out.clone()))
        .await
        .expect("remote run");
    assert_eq!(summary.outcome, RunOutcome::Completed);

    let types = event_types(&out.join("events"));
    assert_eq!(
        types.iter().filter(|t| t.as_str() == "step_retry").count(),
        2
    );
    std::fs::remove_dir_all(&base).ok();
}
