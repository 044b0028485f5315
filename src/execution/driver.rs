//! Step drivers
//!
//! The driver seam mirrors the registry: a manifest step names a driver, the
//! runtime dispatches to it. Built-in drivers are deliberately small and
//! deterministic so the same manifest behaves identically on every backend.

use crate::compiler::secrets::env_reference_var;
use crate::core::manifest::ManifestStep;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by a driver invocation
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Missing upstream output from '{0}'")]
    MissingUpstream(String),

    #[error("Missing secret binding '{0}'")]
    MissingSecret(String),

    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output of one completed step, passed downstream by in-memory reference
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub value: Value,
}

impl StepOutput {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// String rendering used when an output feeds a text-shaped consumer
    pub fn render(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => crate::compiler::fingerprint::canonical_json(other),
        }
    }
}

/// Secret values bound for the duration of one prepare/execute pair.
/// Keys are environment variable names; values never leave memory on the host.
#[derive(Debug, Clone, Default)]
pub struct SecretBindings {
    values: BTreeMap<String, String>,
}

impl SecretBindings {
    pub fn from_env<I: IntoIterator<Item = (String, String)>>(vars: I) -> Self {
        Self {
            values: vars.into_iter().collect(),
        }
    }

    pub fn get(&self, var: &str) -> Option<&str> {
        self.values.get(var).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Resolve a config value that may be an env reference
    pub fn resolve(&self, value: &Value) -> Result<String, DriverError> {
        match env_reference_var(value) {
            Some(var) => self
                .get(var)
                .map(str::to_string)
                .ok_or_else(|| DriverError::MissingSecret(var.to_string())),
            None => match value {
                Value::String(s) => Ok(s.clone()),
                other => Ok(crate::compiler::fingerprint::canonical_json(other)),
            },
        }
    }
}

/// Everything a driver sees for one attempt
pub struct StepContext<'a> {
    pub step: &'a ManifestStep,
    pub attempt: u32,
    /// Per-step artifact directory; the driver writes its outputs here
    pub artifacts_dir: PathBuf,
    pub upstream: &'a BTreeMap<String, StepOutput>,
    pub secrets: &'a SecretBindings,
}

impl StepContext<'_> {
    /// Output of the single declared upstream, or the one named in `input`
    pub fn upstream_input(&self) -> Result<&StepOutput, DriverError> {
        let id = match self.step.config.get("input").and_then(Value::as_str) {
            Some(explicit) => explicit.to_string(),
            None => match self.step.needs.as_slice() {
                [only] => only.clone(),
                _ => {
                    return Err(DriverError::Config(
                        "step has no single upstream; set config.input".to_string(),
                    ))
                }
            },
        };
        self.upstream
            .get(&id)
            .ok_or(DriverError::MissingUpstream(id))
    }

    fn write_artifact(&self, name: &str, bytes: &[u8]) -> Result<(), DriverError> {
        std::fs::create_dir_all(&self.artifacts_dir)?;
        std::fs::write(self.artifacts_dir.join(name), bytes)?;
        Ok(())
    }
}

/// The driver contract both backends dispatch through
#[async_trait]
pub trait StepDriver: Send + Sync {
    async fn run(&self, ctx: StepContext<'_>) -> Result<StepOutput, DriverError>;
}

/// Driver name -> implementation
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn StepDriver>>,
}

impl DriverRegistry {
    /// Registry of the built-in drivers
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register("echo", Arc::new(EchoDriver));
        registry.register("transform", Arc::new(TransformDriver));
        registry.register("merge", Arc::new(MergeDriver));
        registry.register("sleep", Arc::new(SleepDriver));
        registry.register("flaky", Arc::new(FlakyDriver));
        registry.register("notify", Arc::new(NotifyDriver));
        registry
    }

    pub fn register(&mut self, name: &str, driver: Arc<dyn StepDriver>) {
        self.drivers.insert(name.to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepDriver>> {
        self.drivers.get(name).cloned()
    }
}

/// Writes its configured message
pub struct EchoDriver;

#[async_trait]
impl StepDriver for EchoDriver {
    async fn run(&self, ctx: StepContext<'_>) -> Result<StepOutput, DriverError> {
        let message = ctx
            .step
            .config
            .get("message")
            .cloned()
            .ok_or_else(|| DriverError::Config("echo requires config.message".to_string()))?;
        let out = StepOutput::new(message);
        ctx.write_artifact("message.txt", out.render().as_bytes())?;
        Ok(out)
    }
}

/// Applies a string operation to one upstream output
pub struct TransformDriver;

#[async_trait]
impl StepDriver for TransformDriver {
    async fn run(&self, ctx: StepContext<'_>) -> Result<StepOutput, DriverError> {
        let input = ctx.upstream_input()?.render();
        let op = ctx
            .step
            .config
            .get("op")
            .and_then(Value::as_str)
            .unwrap_or("upper");
        let transformed = match op {
            "upper" => input.to_uppercase(),
            "lower" => input.to_lowercase(),
            "reverse" => input.chars().rev().collect(),
            other => {
                return Err(DriverError::Config(format!("unknown transform op '{}'", other)))
            }
        };
        ctx.write_artifact("transformed.txt", transformed.as_bytes())?;
        Ok(StepOutput::new(Value::String(transformed)))
    }
}

/// Concatenates upstream outputs in lexical need order
pub struct MergeDriver;

#[async_trait]
impl StepDriver for MergeDriver {
    async fn run(&self, ctx: StepContext<'_>) -> Result<StepOutput, DriverError> {
        let mut parts = Vec::with_capacity(ctx.step.needs.len());
        for need in &ctx.step.needs {
            let output = ctx
                .upstream
                .get(need)
                .ok_or_else(|| DriverError::MissingUpstream(need.clone()))?;
            parts.push(output.render());
        }
        let merged = parts.join("\n");
        ctx.write_artifact("merged.txt", merged.as_bytes())?;
        Ok(StepOutput::new(Value::String(merged)))
    }
}

/// Sleeps for the configured duration; exists for timeout scenarios
pub struct SleepDriver;

#[async_trait]
impl StepDriver for SleepDriver {
    async fn run(&self, ctx: StepContext<'_>) -> Result<StepOutput, DriverError> {
        let ms = ctx
            .step
            .config
            .get("duration_ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| DriverError::Config("sleep requires config.duration_ms".to_string()))?;
        debug!(step = %ctx.step.id, ms, "sleeping");
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        Ok(StepOutput::new(Value::Null))
    }
}

/// Fails the first `fail_attempts` attempts, then succeeds
pub struct FlakyDriver;

#[async_trait]
impl StepDriver for FlakyDriver {
    async fn run(&self, ctx: StepContext<'_>) -> Result<StepOutput, DriverError> {
        let fail_attempts = ctx
            .step
            .config
            .get("fail_attempts")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;
        if ctx.attempt <= fail_attempts {
            return Err(DriverError::Failed(format!(
                "induced failure on attempt {}",
                ctx.attempt
            )));
        }
        let out = StepOutput::new(Value::String(format!("ok after {} attempts", ctx.attempt)));
        ctx.write_artifact("result.txt", out.render().as_bytes())?;
        Ok(out)
    }
}

/// Delivers a notification using a secret-bound token. The token is consumed
/// in memory and must never appear in the output or any artifact.
pub struct NotifyDriver;

#[async_trait]
impl StepDriver for NotifyDriver {
    async fn run(&self, ctx: StepContext<'_>) -> Result<StepOutput, DriverError> {
        let auth = ctx
            .step
            .config
            .get("auth")
            .and_then(Value::as_object)
            .ok_or_else(|| DriverError::Config("notify requires config.auth".to_string()))?;
        let token_ref = auth
            .get("token")
            .ok_or_else(|| DriverError::Config("notify requires config.auth.token".to_string()))?;
        let token = ctx.secrets.resolve(token_ref)?;
        if token.is_empty() {
            return Err(DriverError::Failed("empty auth token".to_string()));
        }

        let target = ctx
            .step
            .config
            .get("target")
            .and_then(Value::as_str)
            .unwrap_or("default");
        let receipt = serde_json::json!({ "delivered": true, "target": target });
        ctx.write_artifact(
            "receipt.json",
            crate::compiler::fingerprint::canonical_json(&receipt).as_bytes(),
        )?;
        Ok(StepOutput::new(receipt))
    }
}
