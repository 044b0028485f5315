//! Sandbox provisioning and teardown
//!
//! A sandbox is an ephemeral, network-isolated execution environment: a
//! private workdir plus a single runner process spawned from the configured
//! program. Secrets go in as environment bindings at spawn time and are
//! never written to a file. Teardown kills the runner and removes the
//! workdir; it is idempotent and runs on every path.

use crate::error::RunError;
use crate::execution::driver::SecretBindings;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};
use uuid::Uuid;

/// Environment prefix for secret bindings inside the sandbox
pub const SECRET_ENV_PREFIX: &str = "OML_SECRET_";

/// Flag the runner checks to confirm it is network-isolated
pub const ISOLATION_ENV: &str = "OML_SANDBOX_ISOLATED";

/// How the sandbox runner process is started
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Program to execute inside the sandbox
    pub program: PathBuf,

    /// Arguments selecting the runner entry
    pub args: Vec<String>,

    /// Whether the environment denies network egress
    pub isolate_network: bool,
}

impl SandboxConfig {
    /// Run the current executable's hidden runner entry
    pub fn current_exe() -> Result<Self, RunError> {
        let program = std::env::current_exe()
            .map_err(|e| RunError::SandboxProvision(format!("resolve runner binary: {}", e)))?;
        Ok(Self {
            program,
            args: vec!["__sandbox".to_string()],
            isolate_network: true,
        })
    }
}

/// Handle to one provisioned sandbox; owned exclusively by its adapter
#[derive(Debug)]
pub struct SandboxHandle {
    pub id: Uuid,
    workdir: PathBuf,
    child: Option<Child>,
    torn_down: bool,
}

impl SandboxHandle {
    /// Allocate the sandbox workdir. Nothing executes yet.
    pub fn provision(root: &Path) -> Result<Self, RunError> {
        let id = Uuid::new_v4();
        let workdir = root.join(format!(".sandbox-{}", id));
        std::fs::create_dir_all(workdir.join("out"))
            .map_err(|e| RunError::SandboxProvision(format!("allocate workdir: {}", e)))?;
        debug!(%id, workdir = %workdir.display(), "sandbox provisioned");
        Ok(Self {
            id,
            workdir,
            child: None,
            torn_down: false,
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Directory the runner writes step outputs into
    pub fn out_dir(&self) -> PathBuf {
        self.workdir.join("out")
    }

    /// Start the runner: payload over stdin, control channel on stdout,
    /// secrets as prefixed environment bindings.
    pub async fn spawn_runner(
        &mut self,
        cfg: &SandboxConfig,
        payload: &[u8],
        secrets: &SecretBindings,
    ) -> Result<ChildStdout, RunError> {
        let mut command = Command::new(&cfg.program);
        command
            .args(&cfg.args)
            .current_dir(&self.workdir)
            .env_clear()
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if cfg.isolate_network {
            command.env(ISOLATION_ENV, "1");
        }
        for (var, value) in secrets.iter() {
            command.env(format!("{}{}", SECRET_ENV_PREFIX, var), value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| RunError::SandboxProvision(format!("spawn runner: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunError::Channel("runner stdin unavailable".to_string()))?;
        stdin
            .write_all(payload)
            .await
            .map_err(|e| RunError::Channel(format!("ship payload: {}", e)))?;
        drop(stdin);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::Channel("runner stdout unavailable".to_string()))?;
        self.child = Some(child);
        Ok(stdout)
    }

    /// Forcibly stop the runner if it is still alive
    pub async fn kill_runner(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill().await {
                warn!(sandbox = %self.id, error = %e, "kill runner");
            }
        }
    }

    /// Wait for the runner to exit, returning its success flag
    pub async fn wait_runner(&mut self) -> Option<bool> {
        match self.child.as_mut() {
            Some(child) => match child.wait().await {
                Ok(status) => Some(status.success()),
                Err(e) => {
                    warn!(sandbox = %self.id, error = %e, "wait runner");
                    Some(false)
                }
            },
            None => None,
        }
    }

    /// Release everything. Idempotent; called on success and failure alike.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.kill_runner().await;
        if let Some(child) = self.child.as_mut() {
            let _ = child.wait().await;
        }
        self.child = None;
        if let Err(e) = std::fs::remove_dir_all(&self.workdir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(sandbox = %self.id, error = %e, "remove workdir");
            }
        }
        self.torn_down = true;
        debug!(sandbox = %self.id, "sandbox torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}
