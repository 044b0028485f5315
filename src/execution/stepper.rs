//! Shared step execution loop
//!
//! The single implementation of DAG-order execution used by both backends:
//! the local adapter calls it in-process, the sandbox runner calls it inside
//! the sandbox. Identical inputs produce the identical event stream.

use crate::core::manifest::Manifest;
use crate::execution::driver::{DriverRegistry, SecretBindings, StepContext, StepOutput};
use crate::execution::events::{
    EventSink, MetricRecord, RunEvent, RunOutcome, TimeoutScope,
};
use crate::execution::StepStatus;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Runs every step of a manifest in its compiled order
pub struct StepRunner {
    drivers: DriverRegistry,
}

/// Aggregate result of one run; per-step statuses, never a single boolean
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub statuses: BTreeMap<String, StepStatus>,
}

impl StepRunner {
    pub fn new(drivers: DriverRegistry) -> Self {
        Self { drivers }
    }

    /// Execute `manifest` step by step. Steps start only when every need
    /// completed; failures propagate to dependents while independent branches
    /// continue. Retries are deadline-aware: an attempt never starts after
    /// the run deadline, and each attempt's timeout is clamped to the
    /// remaining run budget.
    pub async fn run(
        &self,
        run_id: Uuid,
        manifest: &Manifest,
        out_root: &Path,
        secrets: &SecretBindings,
        run_timeout: Option<Duration>,
        sink: &dyn EventSink,
    ) -> RunReport {
        let deadline = run_timeout.map(|t| Instant::now() + t);
        let mut statuses: BTreeMap<String, StepStatus> = BTreeMap::new();
        let mut outputs: BTreeMap<String, StepOutput> = BTreeMap::new();
        let mut run_timed_out = false;

        sink.event(RunEvent::RunStart {
            run_id,
            pipeline_id: manifest.pipeline_id.clone(),
            step_count: manifest.steps.len(),
        });

        for step in &manifest.steps {
            if run_timed_out || deadline.is_some_and(|d| Instant::now() >= d) {
                run_timed_out = true;
                sink.event(RunEvent::StepSkipped {
                    step_id: step.id.clone(),
                    reason: "run_timeout".to_string(),
                });
                statuses.insert(
                    step.id.clone(),
                    StepStatus::Skipped {
                        reason: "run_timeout".to_string(),
                    },
                );
                continue;
            }

            let upstream_ok = step.needs.iter().all(|need| {
                matches!(statuses.get(need), Some(StepStatus::Completed { .. }))
            });
            if !upstream_ok {
                sink.event(RunEvent::StepSkipped {
                    step_id: step.id.clone(),
                    reason: "upstream_failed".to_string(),
                });
                statuses.insert(
                    step.id.clone(),
                    StepStatus::Skipped {
                        reason: "upstream_failed".to_string(),
                    },
                );
                continue;
            }

            let driver = match self.drivers.get(&step.driver) {
                Some(d) => d,
                None => {
                    sink.event(RunEvent::StepFailed {
                        step_id: step.id.clone(),
                        error: format!("unknown driver '{}'", step.driver),
                        attempts: 0,
                    });
                    statuses.insert(
                        step.id.clone(),
                        StepStatus::Failed {
                            error: format!("unknown driver '{}'", step.driver),
                            attempts: 0,
                        },
                    );
                    continue;
                }
            };

            let max_attempts = step.max_retries + 1;
            let step_timeout = Duration::from_millis(step.timeout_ms);
            let started = Instant::now();
            let mut attempt: u32 = 1;

            let status = loop {
                if attempt > 1 {
                    // A retry that cannot fit before the run deadline is not started
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        run_timed_out = true;
                        sink.event(RunEvent::StepTimedOut {
                            step_id: step.id.clone(),
                            attempts: attempt - 1,
                            scope: TimeoutScope::Run,
                        });
                        break StepStatus::TimedOut {
                            attempts: attempt - 1,
                            scope: TimeoutScope::Run,
                        };
                    }
                    sink.event(RunEvent::StepRetry {
                        step_id: step.id.clone(),
                        attempt,
                        max_retries: step.max_retries,
                    });
                }

                sink.event(RunEvent::StepStart {
                    step_id: step.id.clone(),
                    attempt,
                });
                info!(step = %step.id, attempt, "executing step");

                let (attempt_timeout, clamped_by_run) = match deadline {
                    Some(d) => {
                        let remaining = d.saturating_duration_since(Instant::now());
                        if remaining < step_timeout {
                            (remaining, true)
                        } else {
                            (step_timeout, false)
                        }
                    }
                    None => (step_timeout, false),
                };

                // Scoped so the attempt's borrow of upstream outputs ends
                // before the completion arm records this step's own output
                let attempt_result = {
                    let ctx = StepContext {
                        step,
                        attempt,
                        artifacts_dir: out_root.join("artifacts").join(&step.id),
                        upstream: &outputs,
                        secrets,
                    };
                    timeout(attempt_timeout, driver.run(ctx)).await
                };

                match attempt_result {
                    Ok(Ok(output)) => {
                        sink.event(RunEvent::StepComplete {
                            step_id: step.id.clone(),
                            attempts: attempt,
                        });
                        outputs.insert(step.id.clone(), output);
                        break StepStatus::Completed { attempts: attempt };
                    }
                    Ok(Err(err)) => {
                        warn!(step = %step.id, attempt, %err, "step attempt failed");
                        if attempt < max_attempts {
                            attempt += 1;
                            continue;
                        }
                        sink.event(RunEvent::StepFailed {
                            step_id: step.id.clone(),
                            error: err.to_string(),
                            attempts: attempt,
                        });
                        break StepStatus::Failed {
                            error: err.to_string(),
                            attempts: attempt,
                        };
                    }
                    Err(_) if clamped_by_run => {
                        run_timed_out = true;
                        sink.event(RunEvent::StepTimedOut {
                            step_id: step.id.clone(),
                            attempts: attempt,
                            scope: TimeoutScope::Run,
                        });
                        break StepStatus::TimedOut {
                            attempts: attempt,
                            scope: TimeoutScope::Run,
                        };
                    }
                    Err(_) => {
                        warn!(step = %step.id, attempt, "step attempt timed out");
                        if attempt < max_attempts {
                            attempt += 1;
                            continue;
                        }
                        sink.event(RunEvent::StepTimedOut {
                            step_id: step.id.clone(),
                            attempts: attempt,
                            scope: TimeoutScope::Step,
                        });
                        break StepStatus::TimedOut {
                            attempts: attempt,
                            scope: TimeoutScope::Step,
                        };
                    }
                }
            };

            sink.metric(MetricRecord {
                step_id: step.id.clone(),
                name: "step_duration_ms".to_string(),
                value: started.elapsed().as_millis() as f64,
            });
            sink.metric(MetricRecord {
                step_id: step.id.clone(),
                name: "step_attempts".to_string(),
                value: status.attempts() as f64,
            });
            statuses.insert(step.id.clone(), status);
        }

        let outcome = if run_timed_out
            || statuses
                .values()
                .any(|s| matches!(s, StepStatus::TimedOut { .. }))
        {
            RunOutcome::TimedOut
        } else if statuses
            .values()
            .any(|s| matches!(s, StepStatus::Failed { .. }))
        {
            RunOutcome::Failed
        } else {
            RunOutcome::Completed
        };

        sink.event(RunEvent::RunComplete { run_id, outcome });
        RunReport { outcome, statuses }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompileOptions, ResolvedParams, COMPILER_VERSION};
    use crate::core::registry::RegistryView;
    use crate::core::spec::PipelineSpec;
    use crate::execution::events::MemorySink;

    fn compile_yaml(yaml: &str) -> Manifest {
        let spec = PipelineSpec::from_yaml(yaml).unwrap();
        compile(
            &spec,
            &RegistryView::builtin(),
            &ResolvedParams::default(),
            &CompileOptions::default(),
            COMPILER_VERSION,
        )
        .unwrap()
    }

    fn scratch_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("omlrun-stepper-{}", Uuid::new_v4()))
    }

    async fn run(manifest: &Manifest, run_timeout: Option<Duration>) -> (RunReport, MemorySink) {
        let sink = MemorySink::new();
        let runner = StepRunner::new(DriverRegistry::builtin());
        let dir = scratch_dir();
        let report = runner
            .run(
                Uuid::new_v4(),
                manifest,
                &dir,
                &SecretBindings::default(),
                run_timeout,
                &sink,
            )
            .await;
        std::fs::remove_dir_all(&dir).ok();
        (report, sink)
    }

    #[tokio::test]
    async fn test_chain_completes_in_order() {
        let manifest = compile_yaml(
            r#"
id: "chain"
steps:
  - id: "greet"
    component: "core/echo"
    config: { message: "hello" }
  - id: "shout"
    component: "core/transform"
    needs: ["greet"]
    config: { op: "upper" }
"#,
        );
        let (report, sink) = run(&manifest, None).await;
        assert_eq!(report.outcome, RunOutcome::Completed);
        let types: Vec<_> = sink.events().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            vec!["run_start", "step_start", "step_complete", "step_start", "step_complete", "run_complete"]
        );
    }

    #[tokio::test]
    async fn test_failure_propagates_but_siblings_continue() {
        let manifest = compile_yaml(
            r#"
id: "branchy"
steps:
  - id: "bad"
    component: "core/flaky"
    config: { fail_attempts: 99 }
  - id: "good"
    component: "core/echo"
    config: { message: "fine" }
  - id: "dependent"
    component: "core/transform"
    needs: ["bad"]
"#,
        );
        let (report, _) = run(&manifest, None).await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert!(matches!(
            report.statuses["bad"],
            StepStatus::Failed { .. }
        ));
        assert!(matches!(
            report.statuses["good"],
            StepStatus::Completed { .. }
        ));
        assert!(matches!(
            report.statuses["dependent"],
            StepStatus::Skipped { ref reason, .. } if reason == "upstream_failed"
        ));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let manifest = compile_yaml(
            r#"
id: "retry"
steps:
  - id: "wobble"
    component: "core/flaky"
    max_retries: 3
    config: { fail_attempts: 2 }
"#,
        );
        let (report, sink) = run(&manifest, None).await;
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.statuses["wobble"], StepStatus::Completed { attempts: 3 });
        let retries = sink
            .events()
            .iter()
            .filter(|e| e.event_type() == "step_retry")
            .count();
        assert_eq!(retries, 2);
        let attempts_metric = sink
            .metrics()
            .into_iter()
            .find(|m| m.name == "step_attempts")
            .unwrap();
        assert_eq!(attempts_metric.value, 3.0);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_step() {
        let manifest = compile_yaml(
            r#"
id: "exhaust"
steps:
  - id: "wobble"
    component: "core/flaky"
    max_retries: 1
    config: { fail_attempts: 5 }
"#,
        );
        let (report, _) = run(&manifest, None).await;
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(
            report.statuses["wobble"],
            StepStatus::Failed {
                error: "induced failure on attempt 2".to_string(),
                attempts: 2
            }
        );
    }

    #[tokio::test]
    async fn test_step_timeout_distinct_from_failure() {
        let manifest = compile_yaml(
            r#"
id: "slow"
steps:
  - id: "nap"
    component: "core/sleep"
    timeout_secs: 1
    config: { duration_ms: 50 }
"#,
        );
        // Shrink the per-step timeout below the sleep to force the timeout path
        let mut manifest = manifest;
        manifest.steps[0].timeout_ms = 10;
        let (report, sink) = run(&manifest, None).await;
        assert_eq!(report.outcome, RunOutcome::TimedOut);
        assert!(matches!(
            report.statuses["nap"],
            StepStatus::TimedOut { scope: TimeoutScope::Step, .. }
        ));
        assert!(sink
            .events()
            .iter()
            .any(|e| e.event_type() == "step_timed_out"));
    }

    #[tokio::test]
    async fn test_run_deadline_skips_remaining_steps() {
        let manifest = compile_yaml(
            r#"
id: "deadline"
steps:
  - id: "a_nap"
    component: "core/sleep"
    config: { duration_ms: 200 }
  - id: "b_after"
    component: "core/echo"
    config: { message: "late" }
"#,
        );
        let (report, _) = run(&manifest, Some(Duration::from_millis(40))).await;
        assert_eq!(report.outcome, RunOutcome::TimedOut);
        assert!(matches!(
            report.statuses["a_nap"],
            StepStatus::TimedOut { scope: TimeoutScope::Run, .. }
        ));
        assert!(matches!(
            report.statuses["b_after"],
            StepStatus::Skipped { ref reason } if reason == "run_timeout"
        ));
    }

    #[tokio::test]
    async fn test_retry_not_started_past_deadline() {
        let mut manifest = compile_yaml(
            r#"
id: "nolate"
steps:
  - id: "nap"
    component: "core/sleep"
    max_retries: 50
    config: { duration_ms: 50 }
"#,
        );
        // Each attempt burns its 10ms step timeout until the 35ms run budget
        // runs dry; the retry loop must stop at the deadline, well short of
        // the 51 allowed attempts.
        manifest.steps[0].timeout_ms = 10;
        let (report, _) = run(&manifest, Some(Duration::from_millis(35))).await;
        assert_eq!(report.outcome, RunOutcome::TimedOut);
        match &report.statuses["nap"] {
            StepStatus::TimedOut { scope: TimeoutScope::Run, attempts } => {
                assert!(*attempts < 51);
            }
            other => panic!("expected run-scoped timeout, got {:?}", other),
        }
    }
}
