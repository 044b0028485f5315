//! Control-channel protocol
//!
//! One JSON document per line, host-bound. Every message carries an explicit
//! `type` tag so the host never has to infer the kind from key presence.

use crate::core::manifest::Manifest;
use crate::execution::events::{MetricRecord, RunEvent};
use serde::{Deserialize, Serialize};

/// Messages streamed from the sandbox to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Event { event: RunEvent },
    Metric { metric: MetricRecord },
    Heartbeat { seq: u64 },
    Log { level: String, message: String },
}

impl ControlMessage {
    /// Encode as one line, newline included
    pub fn encode_line(&self) -> String {
        let mut line = serde_json::to_string(self).expect("control message serializes");
        line.push('\n');
        line
    }

    pub fn decode_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

/// Everything the sandbox runner needs, shipped over stdin. Secrets are
/// never part of the payload; they arrive as environment bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPayload {
    pub manifest: Manifest,
    pub run: RunSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    pub run_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_messages_roundtrip_by_type_tag() {
        let messages = vec![
            ControlMessage::Event {
                event: RunEvent::StepStart {
                    step_id: "a".to_string(),
                    attempt: 1,
                },
            },
            ControlMessage::Metric {
                metric: MetricRecord {
                    step_id: "a".to_string(),
                    name: "step_duration_ms".to_string(),
                    value: 12.0,
                },
            },
            ControlMessage::Heartbeat { seq: 7 },
            ControlMessage::Log {
                level: "info".to_string(),
                message: "hello".to_string(),
            },
        ];
        for msg in messages {
            let line = msg.encode_line();
            assert!(line.ends_with('\n'));
            let back = ControlMessage::decode_line(&line).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn test_outer_tag_distinguishes_event_from_log() {
        let line = ControlMessage::Event {
            event: RunEvent::RunComplete {
                run_id: Uuid::nil(),
                outcome: crate::execution::events::RunOutcome::Completed,
            },
        }
        .encode_line();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"]["type"], "run_complete");
    }

    #[test]
    fn test_garbage_line_is_an_error() {
        assert!(ControlMessage::decode_line("not json").is_err());
        assert!(ControlMessage::decode_line(r#"{"no_type": true}"#).is_err());
    }
}
