//! Remote sandbox execution adapter
//!
//! Implements the same three-phase contract as the local adapter by
//! provisioning an ephemeral isolated environment, shipping the manifest
//! over stdin and secrets as environment bindings, and forwarding the
//! runner's line-delimited control messages into the same sink types the
//! local adapter writes to directly. Collection always tears the sandbox
//! down, success or failure.

pub mod bundle;
pub mod protocol;
pub mod provision;
pub mod runner;

pub use protocol::{ControlMessage, RunSettings, SandboxPayload};
pub use provision::{SandboxConfig, SandboxHandle};
pub use runner::run_sandbox_side;

use crate::core::manifest::Manifest;
use crate::error::RunError;
use crate::execution::driver::SecretBindings;
use crate::execution::events::MemorySink;
use crate::execution::{
    fold_statuses, resolve_bindings, CollectedArtifacts, EventSink, ExecResult,
    ExecutionAdapter, RunConfig, RunOutcome,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

pub struct RemoteSandboxAdapter {
    sandbox: SandboxConfig,
}

/// Backend handle for one sandboxed run
pub struct SandboxPrepared {
    session_id: Uuid,
    manifest: Manifest,
    handle: SandboxHandle,
    secrets: SecretBindings,
    staging: PathBuf,
    run_timeout_ms: Option<u64>,
    heartbeat_interval_ms: u64,
    stall_window: Duration,
}

impl RemoteSandboxAdapter {
    pub fn new(sandbox: SandboxConfig) -> Self {
        Self { sandbox }
    }

    /// Adapter that runs this binary's own runner entry in the sandbox
    pub fn current_exe() -> Result<Self, RunError> {
        Ok(Self::new(SandboxConfig::current_exe()?))
    }
}

#[async_trait]
impl ExecutionAdapter for RemoteSandboxAdapter {
    type Prepared = SandboxPrepared;

    async fn prepare(
        &self,
        manifest: &Manifest,
        cfg: &RunConfig,
    ) -> Result<Self::Prepared, RunError> {
        std::fs::create_dir_all(&cfg.out_dir)
            .map_err(|e| RunError::SandboxProvision(format!("create run dir: {}", e)))?;
        let session_id = Uuid::new_v4();
        let handle = SandboxHandle::provision(&cfg.out_dir)?;
        let staging = cfg.out_dir.join(format!(".stage-{}", session_id));
        debug!(%session_id, sandbox = %handle.id, "sandbox session prepared");

        Ok(SandboxPrepared {
            session_id,
            manifest: manifest.clone(),
            secrets: resolve_bindings(manifest, &cfg.env),
            handle,
            staging,
            run_timeout_ms: cfg.run_timeout.map(|t| t.as_millis() as u64),
            heartbeat_interval_ms: cfg.heartbeat_interval.as_millis() as u64,
            stall_window: cfg.stall_window,
        })
    }

    async fn execute(&self, prepared: &mut Self::Prepared) -> Result<ExecResult, RunError> {
        let payload = SandboxPayload {
            manifest: prepared.manifest.clone(),
            run: RunSettings {
                run_timeout_ms: prepared.run_timeout_ms,
                heartbeat_interval_ms: prepared.heartbeat_interval_ms,
            },
        };
        let payload_bytes = serde_json::to_vec(&payload)
            .map_err(|e| RunError::Internal(format!("encode payload: {}", e)))?;

        let stdout = prepared
            .handle
            .spawn_runner(&self.sandbox, &payload_bytes, &prepared.secrets)
            .await?;
        let mut lines = BufReader::new(stdout).lines();

        // Forwarded messages land in the same sink type the local adapter
        // uses; arrival order is emission order.
        let sink = MemorySink::new();

        loop {
            match timeout(prepared.stall_window, lines.next_line()).await {
                Err(_) => {
                    warn!(
                        session = %prepared.session_id,
                        "no control message within stall window; cancelling"
                    );
                    prepared.handle.kill_runner().await;
                    let events = sink.events();
                    let (statuses, _) = fold_statuses(&events);
                    return Ok(ExecResult {
                        outcome: RunOutcome::TimedOut,
                        statuses,
                        events,
                        metrics: sink.metrics(),
                        error: Some(format!(
                            "control channel stalled beyond {:?}",
                            prepared.stall_window
                        )),
                    });
                }
                Ok(Ok(Some(line))) => match ControlMessage::decode_line(&line) {
                    Ok(ControlMessage::Event { event }) => sink.event(event),
                    Ok(ControlMessage::Metric { metric }) => sink.metric(metric),
                    Ok(ControlMessage::Heartbeat { seq }) => {
                        trace!(session = %prepared.session_id, seq, "heartbeat")
                    }
                    Ok(ControlMessage::Log { level, message }) => {
                        info!(session = %prepared.session_id, %level, "{}", message)
                    }
                    Err(e) => {
                        warn!(session = %prepared.session_id, error = %e, line, "undecodable control line")
                    }
                },
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    prepared.handle.kill_runner().await;
                    let events = sink.events();
                    let (statuses, _) = fold_statuses(&events);
                    return Ok(ExecResult {
                        outcome: RunOutcome::Failed,
                        statuses,
                        events,
                        metrics: sink.metrics(),
                        error: Some(format!("control channel read failed: {}", e)),
                    });
                }
            }
        }

        let exited_ok = prepared.handle.wait_runner().await.unwrap_or(false);
        let events = sink.events();
        let metrics = sink.metrics();
        let (statuses, outcome) = fold_statuses(&events);
        match outcome {
            Some(outcome) => Ok(ExecResult {
                outcome,
                statuses,
                events,
                metrics,
                error: None,
            }),
            None => Ok(ExecResult {
                outcome: RunOutcome::Failed,
                statuses,
                events,
                metrics,
                error: Some(format!(
                    "control channel closed before run completion (runner ok: {})",
                    exited_ok
                )),
            }),
        }
    }

    async fn collect(&self, mut prepared: Self::Prepared) -> Result<CollectedArtifacts, RunError> {
        // Fetch one compressed bundle of the sandbox output directory, then
        // tear the sandbox down no matter how the fetch went.
        let bundle_path = prepared
            .staging
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join(format!(".bundle-{}.tar.gz", prepared.session_id));

        let fetched = bundle::pack(&prepared.handle.out_dir(), &bundle_path)
            .and_then(|_| bundle::unpack(&bundle_path, &prepared.staging));
        std::fs::remove_file(&bundle_path).ok();

        prepared.handle.teardown().await;

        fetched?;
        CollectedArtifacts::scan(prepared.staging)
    }
}
