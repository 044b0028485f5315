//! Sandbox-side runner entry
//!
//! Invoked inside the sandbox as the single long-running command. Reads the
//! payload from stdin, rebuilds secret bindings from the environment, runs
//! the identical step-execution logic the local adapter uses, and streams
//! control messages on stdout as they occur.

use crate::execution::driver::{DriverRegistry, SecretBindings};
use crate::execution::events::{EventSink, MetricRecord, RunEvent};
use crate::execution::stepper::StepRunner;
use crate::sandbox::protocol::{ControlMessage, SandboxPayload};
use crate::sandbox::provision::{ISOLATION_ENV, SECRET_ENV_PREFIX};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

/// Sink that serializes events/metrics onto the control channel. A single
/// queue feeds the writer so emission order survives the process boundary.
struct ChannelSink {
    tx: UnboundedSender<ControlMessage>,
}

impl EventSink for ChannelSink {
    fn event(&self, event: RunEvent) {
        let _ = self.tx.send(ControlMessage::Event { event });
    }

    fn metric(&self, metric: MetricRecord) {
        let _ = self.tx.send(ControlMessage::Metric { metric });
    }
}

/// Entry point for the hidden `__sandbox` subcommand.
pub async fn run_sandbox_side() -> Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("read payload from stdin")?;
    let payload: SandboxPayload =
        serde_json::from_str(&input).context("parse sandbox payload")?;

    let secrets = SecretBindings::from_env(std::env::vars().filter_map(|(key, value)| {
        key.strip_prefix(SECRET_ENV_PREFIX)
            .map(|name| (name.to_string(), value))
    }));

    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(msg) = rx.recv().await {
            if stdout.write_all(msg.encode_line().as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
        let _ = stdout.shutdown().await;
    });

    let isolated = std::env::var(ISOLATION_ENV).is_ok();
    let _ = tx.send(ControlMessage::Log {
        level: "info".to_string(),
        message: format!(
            "sandbox runner started: {} steps, isolated={}",
            payload.manifest.steps.len(),
            isolated
        ),
    });

    let heartbeat_tx = tx.clone();
    let interval = Duration::from_millis(payload.run.heartbeat_interval_ms.max(1));
    let heartbeat = tokio::spawn(async move {
        let mut seq: u64 = 0;
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if heartbeat_tx
                .send(ControlMessage::Heartbeat { seq })
                .is_err()
            {
                break;
            }
            seq += 1;
        }
    });

    let sink = ChannelSink { tx: tx.clone() };
    let runner = StepRunner::new(DriverRegistry::builtin());
    let run_timeout = payload.run.run_timeout_ms.map(Duration::from_millis);
    runner
        .run(
            Uuid::new_v4(),
            &payload.manifest,
            &PathBuf::from("out"),
            &secrets,
            run_timeout,
            &sink,
        )
        .await;

    // Stop producers, then let the writer drain the queue
    heartbeat.abort();
    drop(sink);
    drop(tx);
    writer.await.ok();

    Ok(())
}
