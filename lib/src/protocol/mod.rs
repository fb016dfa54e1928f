//! Wire data model for the Agent Client Protocol
//!
//! Every multi-shape value is a closed, tagged enum so that a new message kind
//! is a compile-visible change wherever it is matched. Field names follow the
//! protocol's camelCase JSON; tags follow its snake_case discriminators.

pub mod capabilities;
pub mod content;
pub mod jsonrpc;
pub mod messages;
pub mod session_update;
pub mod tool_call;

pub use capabilities::*;
pub use content::*;
pub use messages::*;
pub use session_update::*;
pub use tool_call::*;

/// Protocol version negotiated during `initialize`
pub const PROTOCOL_VERSION: u16 = 1;

/// Method names, grouped by the side that serves them
pub mod methods {
    // Served by the agent
    pub const INITIALIZE: &str = "initialize";
    pub const SESSION_NEW: &str = "session/new";
    pub const SESSION_LOAD: &str = "session/load";
    pub const SESSION_LIST: &str = "session/list";
    pub const SESSION_FORK: &str = "session/fork";
    pub const SESSION_RESUME: &str = "session/resume";
    pub const SESSION_PROMPT: &str = "session/prompt";
    pub const SESSION_CANCEL: &str = "session/cancel";
    pub const SESSION_SET_MODE: &str = "session/set_mode";
    pub const SESSION_SET_MODEL: &str = "session/set_model";
    pub const SESSION_SET_CONFIG_OPTION: &str = "session/set_config_option";

    // Served by the client
    pub const SESSION_UPDATE: &str = "session/update";
    pub const SESSION_REQUEST_PERMISSION: &str = "session/request_permission";
    pub const FS_READ_TEXT_FILE: &str = "fs/read_text_file";
    pub const FS_WRITE_TEXT_FILE: &str = "fs/write_text_file";
    pub const TERMINAL_CREATE: &str = "terminal/create";
    pub const TERMINAL_OUTPUT: &str = "terminal/output";
    pub const TERMINAL_WAIT_FOR_EXIT: &str = "terminal/wait_for_exit";
    pub const TERMINAL_KILL: &str = "terminal/kill";
    pub const TERMINAL_RELEASE: &str = "terminal/release";
}

/// Session identifier assigned by the agent
pub type SessionId = String;
