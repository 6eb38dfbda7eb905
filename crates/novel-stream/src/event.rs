use std::collections::BTreeMap;

use tracing::debug;

use crate::errors::MalformedFrame;
use crate::model::AgentRole;

/// Field-name to text mapping carried by a turn-completion record.
pub type StructuredResult = BTreeMap<String, String>;

/// Parsed meaning of one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentEvent {
    /// Incremental text for one agent's current turn.
    StreamDelta { agent: AgentRole, content: String },
    /// Authoritative result for one agent's turn; supersedes its deltas.
    TurnComplete {
        agent: AgentRole,
        payload: StructuredResult,
    },
    /// Out-of-band notice not attributable to an agent's content.
    SystemNotice { message: String },
    /// Backend-signaled error.
    Error { message: String },
    /// No further events are expected.
    StreamEnd,
}

impl AgentEvent {
    /// Agent the event belongs to, if any.
    pub fn agent(&self) -> Option<AgentRole> {
        match self {
            Self::StreamDelta { agent, .. } | Self::TurnComplete { agent, .. } => Some(*agent),
            _ => None,
        }
    }
}

const KIND_DELTA: &str = "stream";
const KIND_COMPLETE: &str = "end";

/// Classifies one decoded payload.
///
/// Records without an agent (or from `system`) that are not deltas or
/// completions become notices, whatever their `type`. Returns `Ok(None)` for
/// records of an unknown kind that name a real agent; those are ignored so
/// newer backends can add record kinds.
pub fn classify(payload: &str) -> Result<Option<AgentEvent>, MalformedFrame> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| MalformedFrame::new(format!("invalid JSON payload: {e}")))?;
    let Some(record) = value.as_object() else {
        return Err(MalformedFrame::new("payload is not a JSON object"));
    };

    if let Some(error) = record.get("error").filter(|v| !v.is_null()) {
        let message = match error {
            serde_json::Value::String(text) => text.clone(),
            other => other
                .get("message")
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| other.to_string()),
        };
        return Ok(Some(AgentEvent::Error { message }));
    }

    let kind = record.get("type").and_then(|v| v.as_str());
    let agent_name = record.get("agent").and_then(|v| v.as_str());
    match kind {
        Some(KIND_DELTA) => {
            let agent = parse_agent(agent_name)?;
            let content = record
                .get("content")
                .and_then(|v| v.as_str())
                .ok_or_else(|| MalformedFrame::new("stream record without text content"))?;
            Ok(Some(AgentEvent::StreamDelta {
                agent,
                content: content.to_string(),
            }))
        }
        Some(KIND_COMPLETE) => {
            let agent = parse_agent(agent_name)?;
            let data = record
                .get("data")
                .and_then(|v| v.as_object())
                .ok_or_else(|| MalformedFrame::new("end record without result object"))?;
            let payload = data
                .iter()
                .map(|(key, value)| {
                    let text = match value {
                        serde_json::Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    (key.clone(), text)
                })
                .collect();
            Ok(Some(AgentEvent::TurnComplete { agent, payload }))
        }
        _ if agent_name.is_none_or(|name| name == "system") => {
            let message = record
                .get("data")
                .and_then(|d| d.get("message"))
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| payload.to_string());
            Ok(Some(AgentEvent::SystemNotice { message }))
        }
        other => {
            debug!(kind = ?other, agent = ?agent_name, "ignoring unrecognized record kind");
            Ok(None)
        }
    }
}

fn parse_agent(name: Option<&str>) -> Result<AgentRole, MalformedFrame> {
    let name = name.ok_or_else(|| MalformedFrame::new("record without agent"))?;
    name.parse()
        .map_err(|e| MalformedFrame::new(format!("record for {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_delta_records() {
        let event = classify(r#"{"type":"stream","agent":"writer","content":"夜"}"#)
            .expect("valid")
            .expect("event");
        assert_eq!(
            event,
            AgentEvent::StreamDelta {
                agent: AgentRole::Writer,
                content: "夜".into()
            }
        );
    }

    #[test]
    fn classifies_completion_records_and_stringifies_non_text_values() {
        let event = classify(
            r#"{"type":"end","agent":"planner","data":{"novel_outline":"全书","revision_number":2}}"#,
        )
        .expect("valid")
        .expect("event");
        let AgentEvent::TurnComplete { agent, payload } = event else {
            panic!("expected completion");
        };
        assert_eq!(agent, AgentRole::Planner);
        assert_eq!(payload.get("novel_outline").map(String::as_str), Some("全书"));
        assert_eq!(payload.get("revision_number").map(String::as_str), Some("2"));
    }

    #[test]
    fn error_indicator_wins_over_other_fields() {
        let event = classify(r#"{"error":"model overloaded","agent":"planner","type":"stream"}"#)
            .expect("valid")
            .expect("event");
        assert_eq!(
            event,
            AgentEvent::Error {
                message: "model overloaded".into()
            }
        );
    }

    #[test]
    fn system_records_become_notices() {
        let event = classify(r#"{"agent":"system","data":{"message":"开始planner工作..."}}"#)
            .expect("valid")
            .expect("event");
        assert_eq!(
            event,
            AgentEvent::SystemNotice {
                message: "开始planner工作...".into()
            }
        );

        let raw = r#"{"note":"hello"}"#;
        let event = classify(raw).expect("valid").expect("event");
        assert_eq!(event, AgentEvent::SystemNotice { message: raw.into() });
    }

    #[test]
    fn unknown_kind_without_agent_is_a_notice() {
        let raw = r#"{"type":"progress","message":"检索记忆中"}"#;
        assert_eq!(
            classify(raw),
            Ok(Some(AgentEvent::SystemNotice { message: raw.into() }))
        );
        assert_eq!(
            classify(r#"{"type":"status","agent":"system","data":{"message":"排队中"}}"#),
            Ok(Some(AgentEvent::SystemNotice {
                message: "排队中".into()
            }))
        );
    }

    #[test]
    fn unknown_kind_for_known_agent_is_ignored() {
        assert_eq!(
            classify(r#"{"type":"tool_call","agent":"writer","name":"search"}"#),
            Ok(None)
        );
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(classify("{not json").is_err());
        assert!(classify("[1,2]").is_err());
        assert!(classify(r#"{"type":"stream","agent":"critic","content":"x"}"#).is_err());
        assert!(classify(r#"{"type":"stream","agent":"writer"}"#).is_err());
        assert!(classify(r#"{"type":"end","agent":"writer","data":"draft"}"#).is_err());
    }
}
