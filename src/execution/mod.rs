//! Execution layer: adapter contract, event model, drivers, shared runner
//!
//! The adapter contract is a three-phase protocol (`prepare`, `execute`,
//! `collect`) both backends implement identically from the caller's
//! perspective. `orchestrate` is the only caller and owns the state machine,
//! including unconditional collection and bounded provisioning retries.

pub mod driver;
pub mod events;
pub mod local;
pub mod stepper;

pub use driver::{DriverRegistry, SecretBindings, StepDriver, StepOutput};
pub use events::{EventSink, MemorySink, MetricRecord, RunEvent, RunOutcome, TimeoutScope};
pub use local::LocalAdapter;
pub use stepper::{RunReport, StepRunner};

use crate::collector::ArtifactCollector;
use crate::compiler::secrets::env_reference_var;
use crate::core::manifest::Manifest;
use crate::error::RunError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// How many times transient sandbox provisioning is retried
const PROVISION_ATTEMPTS: u32 = 3;

/// Terminal state of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Completed { attempts: u32 },
    Failed { error: String, attempts: u32 },
    TimedOut { attempts: u32, scope: TimeoutScope },
    Skipped { reason: String },
}

impl StepStatus {
    pub fn attempts(&self) -> u32 {
        match self {
            StepStatus::Completed { attempts }
            | StepStatus::Failed { attempts, .. }
            | StepStatus::TimedOut { attempts, .. } => *attempts,
            StepStatus::Skipped { .. } => 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Completed { .. })
    }
}

/// Caller-supplied run settings
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Final artifact directory the collector persists into
    pub out_dir: PathBuf,

    /// Whole-run deadline
    pub run_timeout: Option<Duration>,

    /// Cadence of sandbox heartbeats
    pub heartbeat_interval: Duration,

    /// Host-side stall tolerance on the control channel
    pub stall_window: Duration,

    /// Environment the secret bindings are resolved from
    pub env: BTreeMap<String, String>,
}

impl RunConfig {
    pub fn new(out_dir: PathBuf) -> Self {
        Self {
            out_dir,
            run_timeout: None,
            heartbeat_interval: Duration::from_millis(500),
            stall_window: Duration::from_secs(10),
            env: std::env::vars().collect(),
        }
    }
}

/// Aggregate execution result; always per-step, never one boolean
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub outcome: RunOutcome,
    pub statuses: BTreeMap<String, StepStatus>,
    pub events: Vec<RunEvent>,
    pub metrics: Vec<MetricRecord>,
    /// Run-level error detail (stall, channel loss), if any
    pub error: Option<String>,
}

/// Normalized artifact handle returned by `collect`
#[derive(Debug, Clone)]
pub struct CollectedArtifacts {
    /// Staging directory holding `artifacts/<step_id>/...`
    pub staging_root: PathBuf,

    /// Relative paths under the staging root, sorted
    pub rel_paths: Vec<String>,
}

impl CollectedArtifacts {
    /// Scan a staging directory for step artifacts
    pub fn scan(staging_root: PathBuf) -> Result<Self, RunError> {
        let mut rel_paths = Vec::new();
        let artifacts = staging_root.join("artifacts");
        if artifacts.is_dir() {
            walk(&artifacts, &staging_root, &mut rel_paths)
                .map_err(|e| RunError::Collect(e.to_string()))?;
        }
        rel_paths.sort();
        Ok(Self {
            staging_root,
            rel_paths,
        })
    }
}

fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(&path, root, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .expect("under root")
                .to_string_lossy()
                .replace('\\', "/");
            out.push(rel);
        }
    }
    Ok(())
}

/// Three-phase execution contract. State machine:
/// UNPREPARED -> PREPARED -> EXECUTING -> {COMPLETED | FAILED} -> COLLECTED.
/// `collect` consumes the prepared run so teardown happens on every path.
#[async_trait]
pub trait ExecutionAdapter {
    type Prepared: Send;

    /// Allocate backend resources; nothing executes yet. Safe to retry on
    /// transient provisioning failure.
    async fn prepare(
        &self,
        manifest: &Manifest,
        cfg: &RunConfig,
    ) -> Result<Self::Prepared, RunError>;

    /// Run every step in manifest order. Run-level outcomes (including
    /// timeouts) come back as an `ExecResult`; `Err` is reserved for faults
    /// that prevented execution from being observed at all.
    async fn execute(&self, prepared: &mut Self::Prepared) -> Result<ExecResult, RunError>;

    /// Retrieve outputs and release backend resources unconditionally.
    async fn collect(&self, prepared: Self::Prepared) -> Result<CollectedArtifacts, RunError>;
}

/// Rebuild per-step statuses and the run outcome from an event stream.
/// This is how the remote host recovers statuses from forwarded events; a
/// unit test pins it against the local runner's direct report.
pub fn fold_statuses(events: &[RunEvent]) -> (BTreeMap<String, StepStatus>, Option<RunOutcome>) {
    let mut statuses = BTreeMap::new();
    let mut outcome = None;
    for event in events {
        match event {
            RunEvent::StepComplete { step_id, attempts } => {
                statuses.insert(step_id.clone(), StepStatus::Completed { attempts: *attempts });
            }
            RunEvent::StepFailed {
                step_id,
                error,
                attempts,
            } => {
                statuses.insert(
                    step_id.clone(),
                    StepStatus::Failed {
                        error: error.clone(),
                        attempts: *attempts,
                    },
                );
            }
            RunEvent::StepTimedOut {
                step_id,
                attempts,
                scope,
            } => {
                statuses.insert(
                    step_id.clone(),
                    StepStatus::TimedOut {
                        attempts: *attempts,
                        scope: *scope,
                    },
                );
            }
            RunEvent::StepSkipped { step_id, reason } => {
                statuses.insert(
                    step_id.clone(),
                    StepStatus::Skipped {
                        reason: reason.clone(),
                    },
                );
            }
            RunEvent::RunComplete { outcome: o, .. } => outcome = Some(*o),
            _ => {}
        }
    }
    (statuses, outcome)
}

/// Environment variable names referenced by a manifest (connection fields and
/// step configs)
pub fn referenced_env_vars(manifest: &Manifest) -> BTreeSet<String> {
    let mut vars = BTreeSet::new();
    for conn in manifest.connections.values() {
        for value in conn.fields.values() {
            if let Some(var) = env_reference_var(&Value::String(value.clone())) {
                vars.insert(var.to_string());
            }
        }
    }
    for step in &manifest.steps {
        for value in step.config.values() {
            collect_env_vars(value, &mut vars);
        }
    }
    vars
}

fn collect_env_vars(value: &Value, vars: &mut BTreeSet<String>) {
    if let Some(var) = env_reference_var(value) {
        vars.insert(var.to_string());
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|v| collect_env_vars(v, vars)),
        Value::Object(map) => map.values().for_each(|v| collect_env_vars(v, vars)),
        _ => {}
    }
}

/// Resolve the manifest's env references against the caller's environment.
/// Bindings exist only in memory for the duration of one prepare/execute pair.
pub fn resolve_bindings(manifest: &Manifest, env: &BTreeMap<String, String>) -> SecretBindings {
    let referenced = referenced_env_vars(manifest);
    SecretBindings::from_env(
        referenced
            .into_iter()
            .filter_map(|var| env.get(&var).map(|v| (var, v.clone()))),
    )
}

/// Outcome summary handed back to the CLI
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub statuses: BTreeMap<String, StepStatus>,
    pub out_dir: PathBuf,
}

/// Drive one run through the full adapter state machine.
pub async fn orchestrate<A: ExecutionAdapter>(
    adapter: &A,
    manifest: &Manifest,
    cfg: &RunConfig,
) -> Result<RunSummary, RunError> {
    let mut prepared = None;
    let mut last_err = None;
    for attempt in 1..=PROVISION_ATTEMPTS {
        match adapter.prepare(manifest, cfg).await {
            Ok(p) => {
                prepared = Some(p);
                break;
            }
            Err(RunError::SandboxProvision(msg)) if attempt < PROVISION_ATTEMPTS => {
                warn!(attempt, %msg, "provisioning failed, retrying");
                last_err = Some(RunError::SandboxProvision(msg));
            }
            Err(e) => return Err(e),
        }
    }
    let mut prepared = prepared
        .ok_or_else(|| last_err.unwrap_or_else(|| RunError::Internal("prepare".to_string())))?;

    let exec = match adapter.execute(&mut prepared).await {
        Ok(exec) => exec,
        Err(e) => {
            // Still collect: salvage partial artifacts and guarantee teardown
            warn!(error = %e, "execute failed; collecting partial artifacts");
            ExecResult {
                outcome: match e {
                    RunError::Timeout { .. } => RunOutcome::TimedOut,
                    _ => RunOutcome::Failed,
                },
                statuses: BTreeMap::new(),
                events: Vec::new(),
                metrics: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    };

    let collected = adapter.collect(prepared).await?;
    let bound_values = resolve_bindings(manifest, &cfg.env)
        .iter()
        .map(|(_, value)| value.clone())
        .collect();
    let collector = ArtifactCollector::new(cfg.out_dir.clone()).with_secret_values(bound_values);
    collector.persist(manifest, &exec, &collected)?;

    info!(outcome = ?exec.outcome, "run finished");
    Ok(RunSummary {
        outcome: exec.outcome,
        statuses: exec.statuses,
        out_dir: cfg.out_dir.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_fold_statuses_roundtrip() {
        let run_id = Uuid::new_v4();
        let events = vec![
            RunEvent::RunStart {
                run_id,
                pipeline_id: "p".to_string(),
                step_count: 3,
            },
            RunEvent::StepStart {
                step_id: "a".to_string(),
                attempt: 1,
            },
            RunEvent::StepComplete {
                step_id: "a".to_string(),
                attempts: 1,
            },
            RunEvent::StepFailed {
                step_id: "b".to_string(),
                error: "boom".to_string(),
                attempts: 2,
            },
            RunEvent::StepSkipped {
                step_id: "c".to_string(),
                reason: "upstream_failed".to_string(),
            },
            RunEvent::RunComplete {
                run_id,
                outcome: RunOutcome::Failed,
            },
        ];
        let (statuses, outcome) = fold_statuses(&events);
        assert_eq!(outcome, Some(RunOutcome::Failed));
        assert_eq!(statuses["a"], StepStatus::Completed { attempts: 1 });
        assert_eq!(
            statuses["b"],
            StepStatus::Failed {
                error: "boom".to_string(),
                attempts: 2
            }
        );
        assert_eq!(
            statuses["c"],
            StepStatus::Skipped {
                reason: "upstream_failed".to_string()
            }
        );
    }

    #[test]
    fn test_referenced_env_vars_covers_connections_and_configs() {
        use crate::core::manifest::{Fingerprints, ManifestMeta, ManifestStep};
        use crate::core::spec::ConnectionRef;
        use serde_json::json;

        let manifest = Manifest {
            pipeline_id: "p".to_string(),
            steps: vec![ManifestStep {
                id: "ping".to_string(),
                component: "core/notify".to_string(),
                driver: "notify".to_string(),
                config: [("auth".to_string(), json!({"token": "${env:NOTIFY_TOKEN}"}))]
                    .into_iter()
                    .collect(),
                needs: vec![],
                connection: Some("warehouse".to_string()),
                max_retries: 0,
                timeout_ms: 1000,
            }],
            fingerprints: Fingerprints {
                oml_fp: String::new(),
                registry_fp: String::new(),
                compiler_fp: String::new(),
                params_fp: String::new(),
                manifest_fp: String::new(),
            },
            secret_keys: vec!["token".to_string()],
            connections: [(
                "warehouse".to_string(),
                ConnectionRef {
                    fields: [
                        ("host".to_string(), "db.internal".to_string()),
                        ("password".to_string(), "${env:WH_PASSWORD}".to_string()),
                    ]
                    .into_iter()
                    .collect(),
                },
            )]
            .into_iter()
            .collect(),
            meta: ManifestMeta {
                toolchain: "t".to_string(),
                profile: None,
                generated_at: None,
            },
        };

        let vars = referenced_env_vars(&manifest);
        assert!(vars.contains("NOTIFY_TOKEN"));
        assert!(vars.contains("WH_PASSWORD"));
        assert_eq!(vars.len(), 2);

        let env: BTreeMap<String, String> = [
            ("NOTIFY_TOKEN".to_string(), "tok".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]
        .into_iter()
        .collect();
        let bindings = resolve_bindings(&manifest, &env);
        assert_eq!(bindings.get("NOTIFY_TOKEN"), Some("tok"));
        assert_eq!(bindings.get("WH_PASSWORD"), None);
        assert_eq!(bindings.get("UNRELATED"), None);
    }
}
