//! Local execution adapter
//!
//! Runs step drivers directly in-process, single-threaded, in manifest order.
//! `prepare` only creates the session staging directory; step inputs flow by
//! in-memory reference inside the shared runner.

use crate::core::manifest::Manifest;
use crate::error::RunError;
use crate::execution::driver::{DriverRegistry, SecretBindings};
use crate::execution::events::MemorySink;
use crate::execution::stepper::StepRunner;
use crate::execution::{
    resolve_bindings, CollectedArtifacts, ExecResult, ExecutionAdapter, RunConfig,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub struct LocalAdapter {
    drivers: DriverRegistry,
}

/// Backend handle for one local run; owned by the adapter that made it
pub struct LocalPrepared {
    session_id: Uuid,
    manifest: Manifest,
    staging: PathBuf,
    secrets: SecretBindings,
    run_timeout: Option<Duration>,
}

impl LocalAdapter {
    pub fn new(drivers: DriverRegistry) -> Self {
        Self { drivers }
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new(DriverRegistry::builtin())
    }
}

#[async_trait]
impl ExecutionAdapter for LocalAdapter {
    type Prepared = LocalPrepared;

    async fn prepare(
        &self,
        manifest: &Manifest,
        cfg: &RunConfig,
    ) -> Result<Self::Prepared, RunError> {
        let session_id = Uuid::new_v4();
        let staging = cfg.out_dir.join(format!(".stage-{}", session_id));
        std::fs::create_dir_all(&staging)
            .map_err(|e| RunError::Internal(format!("create staging dir: {}", e)))?;
        debug!(%session_id, staging = %staging.display(), "local session prepared");

        Ok(LocalPrepared {
            session_id,
            manifest: manifest.clone(),
            staging,
            secrets: resolve_bindings(manifest, &cfg.env),
            run_timeout: cfg.run_timeout,
        })
    }

    async fn execute(&self, prepared: &mut Self::Prepared) -> Result<ExecResult, RunError> {
        let sink = MemorySink::new();
        let runner = StepRunner::new(self.drivers.clone());
        let report = runner
            .run(
                prepared.session_id,
                &prepared.manifest,
                &prepared.staging,
                &prepared.secrets,
                prepared.run_timeout,
                &sink,
            )
            .await;

        Ok(ExecResult {
            outcome: report.outcome,
            statuses: report.statuses,
            events: sink.events(),
            metrics: sink.metrics(),
            error: None,
        })
    }

    async fn collect(&self, prepared: Self::Prepared) -> Result<CollectedArtifacts, RunError> {
        CollectedArtifacts::scan(prepared.staging)
    }
}
