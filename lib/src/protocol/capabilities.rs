//! Capabilities negotiated during `initialize`

use serde::{Deserialize, Serialize};

/// What this client offers the agent
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(default)]
    pub fs: FileSystemCapability,
    #[serde(default)]
    pub terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemCapability {
    #[serde(default)]
    pub read_text_file: bool,
    #[serde(default)]
    pub write_text_file: bool,
}

/// What the agent advertised in its `initialize` response
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    #[serde(default)]
    pub load_session: bool,
    #[serde(default)]
    pub prompt_capabilities: PromptCapabilities,
    #[serde(default)]
    pub mcp_capabilities: McpCapabilities,
    #[serde(default)]
    pub session_capabilities: SessionCapabilities,
}

/// Content kinds the agent accepts in prompts besides text and resource links
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptCapabilities {
    #[serde(default)]
    pub image: bool,
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub embedded_context: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpCapabilities {
    #[serde(default)]
    pub http: bool,
    #[serde(default)]
    pub sse: bool,
}

/// Experimental session operations; each is supported when present
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<CapabilityMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork: Option<CapabilityMarker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<CapabilityMarker>,
}

/// Empty object whose presence advertises a capability
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CapabilityMarker {}

impl AgentCapabilities {
    pub fn supports_list(&self) -> bool {
        self.session_capabilities.list.is_some()
    }

    pub fn supports_fork(&self) -> bool {
        self.session_capabilities.fork.is_some()
    }

    pub fn supports_resume(&self) -> bool {
        self.session_capabilities.resume.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_capabilities_default_when_missing() {
        let caps: AgentCapabilities = serde_json::from_value(json!({})).unwrap();
        assert!(!caps.load_session);
        assert!(!caps.supports_list());
        assert!(!caps.supports_fork());
        assert!(!caps.supports_resume());
    }

    #[test]
    fn test_session_capability_markers() {
        let caps: AgentCapabilities = serde_json::from_value(json!({
            "loadSession": true,
            "promptCapabilities": {"image": true},
            "sessionCapabilities": {"list": {}, "resume": {}}
        }))
        .unwrap();

        assert!(caps.load_session);
        assert!(caps.prompt_capabilities.image);
        assert!(!caps.prompt_capabilities.audio);
        assert!(caps.supports_list());
        assert!(caps.supports_resume());
        assert!(!caps.supports_fork());
    }

    #[test]
    fn test_client_capabilities_wire_shape() {
        let caps = ClientCapabilities {
            fs: FileSystemCapability {
                read_text_file: true,
                write_text_file: false,
            },
            terminal: true,
        };
        assert_eq!(
            serde_json::to_value(&caps).unwrap(),
            json!({"fs": {"readTextFile": true, "writeTextFile": false}, "terminal": true})
        );
    }
}
