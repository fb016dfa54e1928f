//! Stream events: the outward vocabulary of the client
//!
//! Smaller and steadier than the wire-level session updates, so UI layers do
//! not need to understand protocol framing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::protocol::{
    AvailableCommand, PlanEntryPriority, PlanEntryStatus, SessionConfigOption, StopReason,
    ToolCallContent, ToolCallStatus, ToolKind,
};

/// Who authored a text fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
}

/// One entry of the agent's plan, numbered by position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub id: String,
    pub title: String,
    pub status: PlanEntryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<PlanEntryPriority>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        text: String,
        role: MessageRole,
    },
    ThoughtDelta {
        text: String,
    },
    ToolCallStart {
        id: String,
        title: String,
        kind: ToolKind,
        status: ToolCallStatus,
        locations: Vec<PathBuf>,
        content: Vec<ToolCallContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_input: Option<serde_json::Value>,
    },
    /// Only the fields the patch changed are set
    ToolCallDelta {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ToolKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ToolCallStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        locations: Option<Vec<PathBuf>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Vec<ToolCallContent>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_output: Option<serde_json::Value>,
    },
    ToolCallComplete {
        id: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_output: Option<serde_json::Value>,
    },
    Plan {
        entries: Vec<PlanItem>,
    },
    AvailableCommands {
        commands: Vec<AvailableCommand>,
    },
    ModeChange {
        mode_id: String,
    },
    ConfigOptionChange {
        options: Vec<SessionConfigOption>,
    },
    SessionInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_at: Option<String>,
    },
    /// Always the last event of a successful turn
    MessageComplete {
        stop_reason: StopReason,
    },
    /// Always the last event of a failed turn
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
}

impl StreamEvent {
    /// Event kind name as used on the serialised form
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::ThoughtDelta { .. } => "thought_delta",
            StreamEvent::ToolCallStart { .. } => "tool_call_start",
            StreamEvent::ToolCallDelta { .. } => "tool_call_delta",
            StreamEvent::ToolCallComplete { .. } => "tool_call_complete",
            StreamEvent::Plan { .. } => "plan",
            StreamEvent::AvailableCommands { .. } => "available_commands",
            StreamEvent::ModeChange { .. } => "mode_change",
            StreamEvent::ConfigOptionChange { .. } => "config_option_change",
            StreamEvent::SessionInfo { .. } => "session_info",
            StreamEvent::MessageComplete { .. } => "message_complete",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// Whether this event ends the stream of a turn
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::MessageComplete { .. } | StreamEvent::Error { .. }
        )
    }

    /// Tool call this event refers to, if any
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            StreamEvent::ToolCallStart { id, .. }
            | StreamEvent::ToolCallDelta { id, .. }
            | StreamEvent::ToolCallComplete { id, .. } => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ContentBlock, ConfigOptionKind, ConfigOptionValue};
    use serde_json::json;

    fn one_of_each() -> Vec<StreamEvent> {
        vec![
            StreamEvent::TextDelta {
                text: "hi".to_string(),
                role: MessageRole::Agent,
            },
            StreamEvent::ThoughtDelta {
                text: "thinking".to_string(),
            },
            StreamEvent::ToolCallStart {
                id: "tc-1".to_string(),
                title: "Read main.rs".to_string(),
                kind: ToolKind::Read,
                status: ToolCallStatus::Pending,
                locations: vec![PathBuf::from("/tmp/proj/main.rs")],
                content: vec![ToolCallContent::Content {
                    content: ContentBlock::text("preview"),
                }],
                raw_input: Some(json!({"path": "main.rs"})),
            },
            StreamEvent::ToolCallDelta {
                id: "tc-1".to_string(),
                title: None,
                kind: None,
                status: Some(ToolCallStatus::InProgress),
                locations: None,
                content: None,
                raw_output: None,
            },
            StreamEvent::ToolCallComplete {
                id: "tc-1".to_string(),
                status: ToolCallStatus::Completed,
                raw_output: Some(json!("ok")),
            },
            StreamEvent::Plan {
                entries: vec![PlanItem {
                    id: "0".to_string(),
                    title: "Step".to_string(),
                    status: PlanEntryStatus::InProgress,
                    priority: Some(PlanEntryPriority::High),
                }],
            },
            StreamEvent::AvailableCommands {
                commands: vec![AvailableCommand {
                    name: "test".to_string(),
                    description: "Run tests".to_string(),
                    input: None,
                }],
            },
            StreamEvent::ModeChange {
                mode_id: "plan".to_string(),
            },
            StreamEvent::ConfigOptionChange {
                options: vec![SessionConfigOption {
                    id: "effort".to_string(),
                    name: "Effort".to_string(),
                    description: None,
                    category: Some("model".to_string()),
                    kind: ConfigOptionKind::Select,
                    current_value: "low".to_string(),
                    options: vec![ConfigOptionValue {
                        value: "low".to_string(),
                        name: "Low".to_string(),
                        description: None,
                    }],
                }],
            },
            StreamEvent::SessionInfo {
                title: Some("Refactor".to_string()),
                updated_at: Some("2025-01-01T00:00:00Z".to_string()),
            },
            StreamEvent::MessageComplete {
                stop_reason: StopReason::EndTurn,
            },
            StreamEvent::Error {
                message: "connection lost".to_string(),
                code: Some(-32603),
            },
        ]
    }

    #[test]
    fn test_twelve_kinds_preserve_fields() {
        let events = one_of_each();
        assert_eq!(events.len(), 12);

        let mut kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), 12);

        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
            let back: StreamEvent = serde_json::from_value(value).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn test_terminal_events() {
        for event in one_of_each() {
            let expected = matches!(event.kind(), "message_complete" | "error");
            assert_eq!(event.is_terminal(), expected, "{}", event.kind());
        }
    }

    #[test]
    fn test_tool_call_id_accessor() {
        let events = one_of_each();
        let ids: Vec<&str> = events.iter().filter_map(|e| e.tool_call_id()).collect();
        assert_eq!(ids, vec!["tc-1", "tc-1", "tc-1"]);
    }
}
