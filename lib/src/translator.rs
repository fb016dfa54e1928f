//! Session update translation
//!
//! Turns wire-level `session/update` payloads into [`StreamEvent`]s while
//! tracking the lifecycle of every tool call seen in the session.

use std::collections::HashMap;

use crate::events::{MessageRole, PlanItem, StreamEvent};
use crate::protocol::{
    ContentChunk, Plan, SessionUpdate, StopReason, ToolCall, ToolCallLocation, ToolCallStatus,
    ToolCallUpdate,
};

/// Stateful translator for one session's update stream
#[derive(Debug, Default)]
pub struct UpdateTranslator {
    tool_calls: HashMap<String, ToolCallStatus>,
}

impl UpdateTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget tracked tool calls, e.g. when the session changes
    pub fn reset(&mut self) {
        self.tool_calls.clear();
    }

    /// Status last seen for a tool call
    pub fn tool_call_status(&self, id: &str) -> Option<ToolCallStatus> {
        self.tool_calls.get(id).copied()
    }

    /// Translate one update into zero or more events
    pub fn translate(&mut self, update: SessionUpdate) -> Vec<StreamEvent> {
        match update {
            SessionUpdate::UserMessageChunk(chunk) => {
                text_event(chunk, |text| StreamEvent::TextDelta {
                    text,
                    role: MessageRole::User,
                })
            }
            SessionUpdate::AgentMessageChunk(chunk) => {
                text_event(chunk, |text| StreamEvent::TextDelta {
                    text,
                    role: MessageRole::Agent,
                })
            }
            SessionUpdate::AgentThoughtChunk(chunk) => {
                text_event(chunk, |text| StreamEvent::ThoughtDelta { text })
            }
            SessionUpdate::ToolCall(call) => self.start_tool_call(call),
            SessionUpdate::ToolCallUpdate(patch) => self.patch_tool_call(patch),
            SessionUpdate::Plan(plan) => vec![plan_event(plan)],
            SessionUpdate::AvailableCommandsUpdate(update) => vec![StreamEvent::AvailableCommands {
                commands: update.available_commands,
            }],
            SessionUpdate::CurrentModeUpdate(update) => vec![StreamEvent::ModeChange {
                mode_id: update.current_mode_id,
            }],
            SessionUpdate::ConfigOptionUpdate(update) => vec![StreamEvent::ConfigOptionChange {
                options: update.config_options,
            }],
            SessionUpdate::SessionInfoUpdate(info) => vec![StreamEvent::SessionInfo {
                title: info.title,
                updated_at: info.updated_at,
            }],
        }
    }

    /// Event closing a prompt turn
    pub fn complete(&self, stop_reason: StopReason) -> StreamEvent {
        StreamEvent::MessageComplete { stop_reason }
    }

    fn start_tool_call(&mut self, call: ToolCall) -> Vec<StreamEvent> {
        if self.tool_calls.contains_key(&call.tool_call_id) {
            tracing::debug!(
                "Tool call {} announced again, treating as a patch",
                call.tool_call_id
            );
            return self.patch_tool_call(call.into_update());
        }

        let id = call.tool_call_id.clone();
        let status = call.status;
        self.tool_calls.insert(id.clone(), status);

        let mut events = vec![StreamEvent::ToolCallStart {
            id: id.clone(),
            title: call.title,
            kind: call.kind,
            status,
            locations: location_paths(call.locations),
            content: call.content,
            raw_input: call.raw_input,
        }];
        if status.is_terminal() {
            events.push(StreamEvent::ToolCallComplete {
                id,
                status,
                raw_output: call.raw_output,
            });
        }
        events
    }

    fn patch_tool_call(&mut self, patch: ToolCallUpdate) -> Vec<StreamEvent> {
        let id = patch.tool_call_id;
        let Some(previous) = self.tool_calls.get(&id).copied() else {
            tracing::warn!("Dropping update for unknown tool call {}", id);
            return Vec::new();
        };
        if previous.is_terminal() {
            tracing::warn!(
                "Dropping update for tool call {} already {:?}",
                id,
                previous
            );
            return Vec::new();
        }

        if let Some(status) = patch.status {
            self.tool_calls.insert(id.clone(), status);
        }

        let mut events = vec![StreamEvent::ToolCallDelta {
            id: id.clone(),
            title: patch.title,
            kind: patch.kind,
            status: patch.status,
            locations: patch.locations.map(location_paths),
            content: patch.content,
            raw_output: patch.raw_output.clone(),
        }];
        if let Some(status) = patch.status.filter(ToolCallStatus::is_terminal) {
            events.push(StreamEvent::ToolCallComplete {
                id,
                status,
                raw_output: patch.raw_output,
            });
        }
        events
    }
}

fn text_event(chunk: ContentChunk, make: impl FnOnce(String) -> StreamEvent) -> Vec<StreamEvent> {
    match chunk.content.as_text() {
        Some(text) => vec![make(text.to_string())],
        None => {
            tracing::debug!("Dropping non-text {} chunk", chunk.content.kind());
            Vec::new()
        }
    }
}

fn plan_event(plan: Plan) -> StreamEvent {
    StreamEvent::Plan {
        entries: plan
            .entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| PlanItem {
                id: index.to_string(),
                title: entry.content,
                status: entry.status,
                priority: Some(entry.priority),
            })
            .collect(),
    }
}

fn location_paths(locations: Vec<ToolCallLocation>) -> Vec<std::path::PathBuf> {
    locations.into_iter().map(|location| location.path).collect()
}
