//! Configuration types for the ACP client

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{ClientError, Result};
use crate::protocol::{ClientCapabilities, EnvVariable, FileSystemCapability, Implementation, McpServer};

/// Default number of agent requests served concurrently
fn default_max_inflight_requests() -> usize {
    8
}

/// Default cap on buffered terminal output (1 MiB)
fn default_terminal_output_byte_limit() -> u64 {
    1_048_576
}

/// Default grace period between SIGTERM and SIGKILL
fn default_kill_grace_period_ms() -> u64 {
    5_000
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cwd() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

/// Everything needed to launch an agent and open a session with it
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Agent executable, already resolved by the host
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the agent process
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Session working directory; must be absolute
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    #[serde(default)]
    pub capabilities: CapabilityConfig,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default = "default_max_inflight_requests")]
    pub max_inflight_requests: usize,
    #[serde(default = "default_terminal_output_byte_limit")]
    pub terminal_output_byte_limit: u64,
    #[serde(default = "default_kill_grace_period_ms")]
    pub kill_grace_period_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Client-side features offered to the agent
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CapabilityConfig {
    #[serde(default = "enabled")]
    pub read_text_file: bool,
    #[serde(default = "enabled")]
    pub write_text_file: bool,
    #[serde(default = "enabled")]
    pub terminal: bool,
}

fn enabled() -> bool {
    true
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            read_text_file: true,
            write_text_file: true,
            terminal: true,
        }
    }
}

/// Stdio MCP server handed to the agent on session setup
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: default_cwd(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            capabilities: CapabilityConfig::default(),
            mcp_servers: Vec::new(),
            max_inflight_requests: default_max_inflight_requests(),
            terminal_output_byte_limit: default_terminal_output_byte_limit(),
            kill_grace_period_ms: default_kill_grace_period_ms(),
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Config for launching `command` with `args` in `cwd`
    pub fn new(command: impl Into<String>, args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(ClientError::Config(
                "Agent command cannot be empty".to_string(),
            ));
        }

        if !self.cwd.is_absolute() {
            return Err(ClientError::Config(format!(
                "Working directory must be an absolute path: {}",
                self.cwd.display()
            )));
        }

        if !["error", "warn", "info", "debug", "trace"].contains(&self.log_level.as_str()) {
            return Err(ClientError::Config(format!(
                "Invalid log level: {}",
                self.log_level
            )));
        }

        if self.max_inflight_requests == 0 {
            return Err(ClientError::Config(
                "max_inflight_requests must be at least 1".to_string(),
            ));
        }

        if self.terminal_output_byte_limit == 0 {
            return Err(ClientError::Config(
                "terminal_output_byte_limit must be positive".to_string(),
            ));
        }

        for server in &self.mcp_servers {
            if server.name.is_empty() {
                return Err(ClientError::Config(
                    "MCP server name cannot be empty".to_string(),
                ));
            }
            if server.command.is_empty() {
                return Err(ClientError::Config(format!(
                    "MCP server '{}' command cannot be empty",
                    server.name
                )));
            }
        }

        Ok(())
    }

    /// Load configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Capabilities advertised in `initialize`
    ///
    /// File-system capabilities are only offered when a handler is installed
    /// to serve them.
    pub fn client_capabilities(&self, has_fs_handler: bool) -> ClientCapabilities {
        ClientCapabilities {
            fs: FileSystemCapability {
                read_text_file: has_fs_handler && self.capabilities.read_text_file,
                write_text_file: has_fs_handler && self.capabilities.write_text_file,
            },
            terminal: self.capabilities.terminal,
        }
    }

    pub fn client_info(&self) -> Implementation {
        Implementation {
            name: self.client_name.clone(),
            title: None,
            version: self.client_version.clone(),
        }
    }

    /// MCP servers in wire form, sorted env for stable output
    pub fn wire_mcp_servers(&self) -> Vec<McpServer> {
        self.mcp_servers
            .iter()
            .map(|server| {
                let mut env: Vec<EnvVariable> = server
                    .env
                    .iter()
                    .map(|(name, value)| EnvVariable {
                        name: name.clone(),
                        value: value.clone(),
                    })
                    .collect();
                env.sort_by(|a, b| a.name.cmp(&b.name));
                McpServer {
                    name: server.name.clone(),
                    command: PathBuf::from(&server.command),
                    args: server.args.clone(),
                    env,
                }
            })
            .collect()
    }

    pub fn kill_grace_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.kill_grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ClientConfig {
        ClientConfig::new("my-agent", vec!["--acp".to_string()], "/tmp/proj")
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();

        assert!(config.command.is_empty());
        assert!(config.cwd.is_absolute());
        assert_eq!(config.max_inflight_requests, 8);
        assert_eq!(config.terminal_output_byte_limit, 1_048_576);
        assert_eq!(config.kill_grace_period_ms, 5_000);
        assert_eq!(config.log_level, "info");
        assert!(config.capabilities.terminal);
        assert!(config.mcp_servers.is_empty());
    }

    #[test]
    fn test_config_validation_success() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation_empty_command() {
        let config = ClientConfig::default();
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("command cannot be empty"));
    }

    #[test]
    fn test_config_validation_relative_cwd() {
        let mut config = valid_config();
        config.cwd = PathBuf::from("relative/dir");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = valid_config();
        config.log_level = "loud".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_config_validation_mcp_servers() {
        let mut config = valid_config();
        config.mcp_servers.push(McpServerConfig {
            name: "files".to_string(),
            command: String::new(),
            args: vec![],
            env: HashMap::new(),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("MCP server 'files' command cannot be empty"));
    }

    #[test]
    fn test_config_json_roundtrip_applies_defaults() {
        let config = ClientConfig::from_json(
            r#"{"command": "agent", "cwd": "/tmp/proj", "capabilities": {"terminal": false}}"#,
        )
        .unwrap();

        assert_eq!(config.command, "agent");
        assert!(!config.capabilities.terminal);
        assert!(config.capabilities.read_text_file);
        assert_eq!(config.max_inflight_requests, 8);

        let json = config.to_json().unwrap();
        let reparsed = ClientConfig::from_json(&json).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_client_capabilities_require_fs_handler() {
        let config = valid_config();
        let without = config.client_capabilities(false);
        assert!(!without.fs.read_text_file);
        assert!(!without.fs.write_text_file);
        assert!(without.terminal);

        let with = config.client_capabilities(true);
        assert!(with.fs.read_text_file);
        assert!(with.fs.write_text_file);
    }

    #[test]
    fn test_wire_mcp_servers() {
        let mut config = valid_config();
        let mut env = HashMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        config.mcp_servers.push(McpServerConfig {
            name: "files".to_string(),
            command: "/usr/bin/mcp-files".to_string(),
            args: vec!["--root".to_string()],
            env,
        });

        let servers = config.wire_mcp_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].env[0].name, "A");
        assert_eq!(servers[0].command, PathBuf::from("/usr/bin/mcp-files"));
    }
}
