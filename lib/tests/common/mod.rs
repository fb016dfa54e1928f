//! Common Test Utilities
//!
//! A scripted fake agent speaking newline-delimited JSON-RPC over an
//! in-memory duplex, and a launcher that hands its streams to the client.
//!
//! The agent's behaviour for `session/prompt` is chosen by the prompt text:
//!
//! | prompt       | behaviour                                                    |
//! |--------------|--------------------------------------------------------------|
//! | `ping`       | one `pong` chunk, then `end_turn`                            |
//! | `tools`      | `tc-1` announced pending, patched to completed, `end_turn`   |
//! | `permission` | asks permission for `tc-2`, echoes the outcome as a chunk    |
//! | `slow`       | answers only after `session/cancel`, with `cancelled`        |
//! | `crash`      | closes its streams without answering                         |
//!
//! `session/load` replays [`REPLAYED_HISTORY`] for the loaded session before
//! answering.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};

use acp_bridge_lib::transport::{AgentStreams, Launcher};
use acp_bridge_lib::{ClientConfig, Result};

pub const SESSION_ID: &str = "sess-1";
pub const FORKED_SESSION_ID: &str = "sess-fork";

/// User and agent text replayed by `session/load`, followed by a switch to `plan`
pub const REPLAYED_HISTORY: [&str; 2] = ["what changed?", "two files"];

/// Knobs for one fake agent
#[derive(Debug, Clone)]
pub struct FakeAgentOptions {
    pub protocol_version: u16,
    pub agent_capabilities: Value,
}

impl Default for FakeAgentOptions {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            agent_capabilities: json!({}),
        }
    }
}

impl FakeAgentOptions {
    /// Advertise `loadSession` and every experimental session operation
    pub fn with_session_capabilities() -> Self {
        Self {
            agent_capabilities: json!({
                "loadSession": true,
                "sessionCapabilities": {"list": {}, "fork": {}, "resume": {}}
            }),
            ..Self::default()
        }
    }
}

/// Every message the fake agent received, in order
#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<Value>>>);

impl Transcript {
    fn push(&self, message: Value) {
        self.0.lock().unwrap().push(message);
    }

    pub fn messages(&self) -> Vec<Value> {
        self.0.lock().unwrap().clone()
    }

    /// Params of the first message with `method`
    pub fn params_of(&self, method: &str) -> Option<Value> {
        self.messages()
            .into_iter()
            .find(|m| m["method"] == method)
            .map(|m| m["params"].clone())
    }

    pub fn count(&self, method: &str) -> usize {
        self.messages().iter().filter(|m| m["method"] == method).count()
    }

    /// Wait until a message with `method` has arrived
    pub async fn wait_for(&self, method: &str) {
        for _ in 0..500 {
            if self.count(method) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent never received {}", method);
    }
}

struct FakeAgent {
    options: FakeAgentOptions,
    transcript: Transcript,
    writer: WriteHalf<DuplexStream>,
    /// Session named by the latest prompt
    session_id: Value,
    /// Prompt waiting on a permission answer or a cancel
    pending_prompt: Option<Value>,
}

impl FakeAgent {
    async fn send(&mut self, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        // the client may already be gone
        let _ = self.writer.write_all(line.as_bytes()).await;
        let _ = self.writer.flush().await;
    }

    async fn reply(&mut self, id: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await;
    }

    async fn reply_error(&mut self, id: &Value, code: i32, message: &str) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}))
            .await;
    }

    async fn update(&mut self, update: Value) {
        let session_id = self.session_id.clone();
        self.update_for(&session_id, update).await;
    }

    async fn update_for(&mut self, session_id: &Value, update: Value) {
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {"sessionId": session_id, "update": update}
        }))
        .await;
    }

    async fn replay(&mut self, session_id: &Value) {
        let [question, answer] = REPLAYED_HISTORY;
        self.update_for(
            session_id,
            json!({"sessionUpdate": "user_message_chunk", "content": {"type": "text", "text": question}}),
        )
        .await;
        self.update_for(
            session_id,
            json!({"sessionUpdate": "agent_message_chunk", "content": {"type": "text", "text": answer}}),
        )
        .await;
        self.update_for(
            session_id,
            json!({"sessionUpdate": "current_mode_update", "currentModeId": "plan"}),
        )
        .await;
    }

    async fn chunk(&mut self, text: &str) {
        self.update(json!({
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "text", "text": text}
        }))
        .await;
    }

    async fn run(mut self, reader: tokio::io::ReadHalf<DuplexStream>) {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let message: Value = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(_) => continue,
            };
            self.transcript.push(message.clone());

            let id = message.get("id").cloned();
            let method = message["method"].as_str().map(str::to_string);
            match (id, method) {
                (Some(id), Some(method)) => {
                    if !self.request(id, &method, &message["params"]).await {
                        return;
                    }
                }
                (None, Some(method)) => self.notification(&method).await,
                (Some(id), None) => self.response(id, &message).await,
                (None, None) => {}
            }
        }
    }

    /// Serve a client request; false ends the agent
    async fn request(&mut self, id: Value, method: &str, params: &Value) -> bool {
        match method {
            "initialize" => {
                let result = json!({
                    "protocolVersion": self.options.protocol_version,
                    "agentCapabilities": self.options.agent_capabilities,
                    "authMethods": [],
                    "agentInfo": {"name": "fake-agent", "version": "0.0.1"}
                });
                self.reply(&id, result).await;
            }
            "session/new" => {
                let result = json!({
                    "sessionId": SESSION_ID,
                    "modes": {
                        "currentModeId": "code",
                        "availableModes": [
                            {"id": "code", "name": "Code"},
                            {"id": "plan", "name": "Plan"}
                        ]
                    }
                });
                self.reply(&id, result).await;
            }
            "session/set_mode" => {
                if params["modeId"] == "bogus" {
                    self.reply_error(&id, -32602, "Unknown mode: bogus").await;
                } else {
                    self.reply(&id, json!({})).await;
                }
            }
            "session/set_model" => self.reply(&id, json!({})).await,
            "session/set_config_option" => {
                let result = json!({
                    "configOptions": [{
                        "id": params["configId"],
                        "name": "Thinking",
                        "type": "select",
                        "currentValue": params["value"],
                        "options": [
                            {"value": "low", "name": "Low"},
                            {"value": "high", "name": "High"}
                        ]
                    }]
                });
                self.reply(&id, result).await;
            }
            "session/list" => {
                let result = json!({
                    "sessions": [{"sessionId": "old-1", "cwd": "/tmp/proj", "title": "Earlier work"}]
                });
                self.reply(&id, result).await;
            }
            "session/load" => {
                self.replay(&params["sessionId"]).await;
                self.reply(&id, json!({})).await;
            }
            "session/resume" => self.reply(&id, json!({})).await,
            "session/fork" => {
                self.reply(&id, json!({"sessionId": FORKED_SESSION_ID})).await;
            }
            "session/prompt" => return self.prompt(id, params).await,
            other => {
                let message = format!("Method not found: {}", other);
                self.reply_error(&id, -32601, &message).await;
            }
        }
        true
    }

    async fn prompt(&mut self, id: Value, params: &Value) -> bool {
        let text = params["prompt"][0]["text"].as_str().unwrap_or_default().to_string();
        self.session_id = params["sessionId"].clone();
        match text.as_str() {
            "ping" => {
                self.chunk("pong").await;
                self.reply(&id, json!({"stopReason": "end_turn"})).await;
            }
            "tools" => {
                self.update(json!({
                    "sessionUpdate": "tool_call",
                    "toolCallId": "tc-1",
                    "title": "Read notes.md",
                    "kind": "read",
                    "status": "pending",
                    "locations": [{"path": "/tmp/proj/notes.md"}]
                }))
                .await;
                self.update(json!({
                    "sessionUpdate": "tool_call_update",
                    "toolCallId": "tc-1",
                    "status": "completed",
                    "rawOutput": {"bytes": 12}
                }))
                .await;
                self.reply(&id, json!({"stopReason": "end_turn"})).await;
            }
            "permission" => {
                self.pending_prompt = Some(id);
                self.send(json!({
                    "jsonrpc": "2.0",
                    "id": "perm-1",
                    "method": "session/request_permission",
                    "params": {
                        "sessionId": self.session_id,
                        "toolCall": {"toolCallId": "tc-2", "title": "Delete build/", "kind": "delete"},
                        "options": [
                            {"optionId": "allow", "name": "Allow", "kind": "allow_once"},
                            {"optionId": "always", "name": "Always allow", "kind": "allow_always"},
                            {"optionId": "reject", "name": "Reject", "kind": "reject_once"}
                        ]
                    }
                }))
                .await;
            }
            "slow" => self.pending_prompt = Some(id),
            "crash" => return false,
            _ => self.reply(&id, json!({"stopReason": "end_turn"})).await,
        }
        true
    }

    async fn notification(&mut self, method: &str) {
        if method == "session/cancel" {
            if let Some(id) = self.pending_prompt.take() {
                self.reply(&id, json!({"stopReason": "cancelled"})).await;
            }
        }
    }

    /// The client answered our permission request
    async fn response(&mut self, id: Value, message: &Value) {
        if id != "perm-1" {
            return;
        }
        let outcome = if message.get("error").is_some() {
            json!({"error": message["error"]["code"]})
        } else {
            message["result"]["outcome"].clone()
        };
        self.chunk(&outcome.to_string()).await;
        if let Some(prompt) = self.pending_prompt.take() {
            self.reply(&prompt, json!({"stopReason": "end_turn"})).await;
        }
    }
}

/// Launches a fresh fake agent per `connect`
#[derive(Debug, Clone, Default)]
pub struct DuplexLauncher {
    pub options: FakeAgentOptions,
    pub transcript: Transcript,
    launches: Arc<Mutex<usize>>,
}

impl DuplexLauncher {
    pub fn new(options: FakeAgentOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn launches(&self) -> usize {
        *self.launches.lock().unwrap()
    }
}

#[async_trait]
impl Launcher for DuplexLauncher {
    async fn launch(&self, _config: &ClientConfig) -> Result<AgentStreams> {
        *self.launches.lock().unwrap() += 1;

        let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (agent_read, agent_write) = tokio::io::split(agent_side);

        let agent = FakeAgent {
            options: self.options.clone(),
            transcript: self.transcript.clone(),
            writer: agent_write,
            session_id: json!(SESSION_ID),
            pending_prompt: None,
        };
        tokio::spawn(agent.run(agent_read));

        Ok(AgentStreams {
            reader: Box::new(client_read),
            writer: Box::new(client_write),
            process: None,
        })
    }
}

pub fn config() -> ClientConfig {
    ClientConfig::new("fake-agent", vec![], "/tmp/proj")
}
