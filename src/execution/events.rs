//! Run event and metric model
//!
//! Both backends emit the same tagged event vocabulary through the same sink
//! seam; events carry no wall-clock fields so the stream for a fixed manifest
//! is identical regardless of backend.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

/// Final disposition of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    TimedOut,
}

/// Scope of a timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutScope {
    Step,
    Run,
}

/// Structured execution events, tagged explicitly by type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStart {
        run_id: Uuid,
        pipeline_id: String,
        step_count: usize,
    },
    StepStart {
        step_id: String,
        attempt: u32,
    },
    StepRetry {
        step_id: String,
        attempt: u32,
        max_retries: u32,
    },
    StepComplete {
        step_id: String,
        attempts: u32,
    },
    StepFailed {
        step_id: String,
        error: String,
        attempts: u32,
    },
    StepTimedOut {
        step_id: String,
        attempts: u32,
        scope: TimeoutScope,
    },
    StepSkipped {
        step_id: String,
        reason: String,
    },
    RunComplete {
        run_id: Uuid,
        outcome: RunOutcome,
    },
}

impl RunEvent {
    /// Stable type tag, as serialized
    pub fn event_type(&self) -> &'static str {
        match self {
            RunEvent::RunStart { .. } => "run_start",
            RunEvent::StepStart { .. } => "step_start",
            RunEvent::StepRetry { .. } => "step_retry",
            RunEvent::StepComplete { .. } => "step_complete",
            RunEvent::StepFailed { .. } => "step_failed",
            RunEvent::StepTimedOut { .. } => "step_timed_out",
            RunEvent::StepSkipped { .. } => "step_skipped",
            RunEvent::RunComplete { .. } => "run_complete",
        }
    }
}

/// One metric sample, always attributable to a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step_id: String,
    pub name: String,
    pub value: f64,
}

/// Sink both backends write into; the local adapter writes directly, the
/// remote host forwards control-channel messages here in arrival order.
pub trait EventSink: Send + Sync {
    fn event(&self, event: RunEvent);
    fn metric(&self, metric: MetricRecord);
}

/// Collecting sink backed by memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<RunEvent>>,
    metrics: Mutex<Vec<MetricRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().expect("sink lock").clone()
    }

    pub fn metrics(&self) -> Vec<MetricRecord> {
        self.metrics.lock().expect("sink lock").clone()
    }
}

impl EventSink for MemorySink {
    fn event(&self, event: RunEvent) {
        self.events.lock().expect("sink lock").push(event);
    }

    fn metric(&self, metric: MetricRecord) {
        self.metrics.lock().expect("sink lock").push(metric);
    }
}
