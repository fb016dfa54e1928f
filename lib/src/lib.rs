//! ACP Bridge Library
//!
//! The client side of the Agent Client Protocol (ACP): launches an agent
//! process, performs the handshake, streams prompt turns back as
//! [`StreamEvent`]s, and answers the agent's permission, file-system and
//! terminal requests on behalf of the host application.
//!
//! ```no_run
//! use acp_bridge_lib::{create_client, AgentClient, ClientConfig, MessageOptions};
//! use futures::StreamExt;
//!
//! # async fn run() -> acp_bridge_lib::Result<()> {
//! let config = ClientConfig::new("my-agent", vec!["--acp".to_string()], "/tmp/proj");
//! let client = create_client(config, None)?;
//! client.connect().await?;
//!
//! let mut events = client.send_message("ping", MessageOptions::default())?;
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event);
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod host;
pub mod permission;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod terminal_manager;
pub mod translator;
pub mod transport;
pub mod user_prompt;

pub use client::{AgentClient, Client, EventStream, MessageOptions, TerminalOptions};
pub use config::{CapabilityConfig, ClientConfig, McpServerConfig};
pub use error::{AcpError, ClientError, Result};
pub use events::{MessageRole, PlanItem, StreamEvent};
pub use fs::{FileSystemHandler, LocalFileSystem};
pub use permission::{
    handler_fn, PermissionHandler, PermissionHandlerResponse, PermissionRequest, RiskLevel,
};
pub use registry::{
    clear_implementations, create_client, register_implementation, registered_implementations,
    set_default_implementation, ImplementationRegistry,
};
pub use session::Session;
pub use terminal_manager::{TerminalHandle, TerminalManager, TerminalState};
pub use transport::TransportKind;
pub use user_prompt::{console_input, ConsoleInput, ConsolePermissionHandler};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_facade_is_object_safe() {
        fn assert_object_safe(_: Option<Box<dyn AgentClient>>) {}
        assert_object_safe(None);
    }

    #[test]
    fn test_default_config_targets_protocol_v1() {
        assert_eq!(protocol::PROTOCOL_VERSION, 1);
        let config = ClientConfig::default();
        assert_eq!(config.max_inflight_requests, 8);
        assert_eq!(config.terminal_output_byte_limit, 1_048_576);
    }
}
