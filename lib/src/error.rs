//! Error types for the ACP client engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON-RPC error codes used on the wire
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Agent requires authentication before the call can proceed
    pub const AUTH_REQUIRED: i32 = -32000;
    /// The referenced resource (file, terminal, session) does not exist
    pub const RESOURCE_NOT_FOUND: i32 = -32002;
}

/// Error object exchanged with the agent
///
/// Mirrors the JSON-RPC 2.0 error object. Errors received from the agent are
/// surfaced to callers unchanged, and errors produced while serving agent
/// requests are encoded with this type.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct AcpError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl AcpError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured details to the error
    pub fn with_data(mut self, data: impl Into<serde_json::Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::PARSE_ERROR, format!("Parse error: {}", detail))
    }

    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_REQUEST, format!("Invalid request: {}", detail))
    }

    pub fn method_not_found(method: impl std::fmt::Display) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, format!("Invalid params: {}", detail))
    }

    pub fn internal_error(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, format!("Internal error: {}", detail))
    }

    pub fn auth_required() -> Self {
        Self::new(codes::AUTH_REQUIRED, "Authentication required")
    }

    pub fn resource_not_found(resource: impl std::fmt::Display) -> Self {
        Self::new(
            codes::RESOURCE_NOT_FOUND,
            format!("Resource not found: {}", resource),
        )
    }
}

/// Main error type for the client engine
#[derive(Error, Debug)]
pub enum ClientError {
    /// The operation needs a live session and there is none
    #[error("Not connected: no active session")]
    NotConnected,

    /// The negotiated capabilities do not cover the operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error(
        "Unknown implementation '{name}' (registered: {})",
        .registered.join(", ")
    )]
    UnknownImplementation {
        name: String,
        registered: Vec<String>,
    },

    /// A terminal handle was used after release
    #[error("Invalid terminal handle: {0}")]
    InvalidHandle(String),

    /// Agent process could not be started or the handshake failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Error reported by the agent, or produced while serving it
    #[error("Protocol error: {0}")]
    Protocol(#[from] AcpError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Convert client error to JSON-RPC error code
    pub fn to_json_rpc_error(&self) -> i32 {
        match self {
            ClientError::Protocol(err) => err.code,
            ClientError::Serialization(_) => codes::INVALID_PARAMS,
            ClientError::InvalidHandle(_) => codes::RESOURCE_NOT_FOUND,
            ClientError::Unsupported(_) => codes::METHOD_NOT_FOUND,
            ClientError::NotConnected => codes::INTERNAL_ERROR,
            ClientError::Connection(_) => codes::INTERNAL_ERROR,
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// Encode this error for a response sent back to the agent
    pub fn to_acp_error(&self) -> AcpError {
        match self {
            ClientError::Protocol(err) => err.clone(),
            ClientError::Serialization(err) => AcpError::invalid_params(err),
            ClientError::InvalidHandle(id) => AcpError::resource_not_found(id),
            other => AcpError::new(other.to_json_rpc_error(), other.to_string()),
        }
    }
}

/// Convenience type alias for Results using ClientError
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = ClientError::NotConnected;
        assert_eq!(err.to_string(), "Not connected: no active session");

        let err = ClientError::Unsupported("session/fork".to_string());
        assert_eq!(err.to_string(), "Unsupported operation: session/fork");

        let err = ClientError::InvalidHandle("term_1".to_string());
        assert_eq!(err.to_string(), "Invalid terminal handle: term_1");

        let err = ClientError::Connection("spawn failed".to_string());
        assert_eq!(err.to_string(), "Connection error: spawn failed");

        let err = ClientError::Config("empty command".to_string());
        assert_eq!(err.to_string(), "Configuration error: empty command");
    }

    #[test]
    fn test_unknown_implementation_lists_names() {
        let err = ClientError::UnknownImplementation {
            name: "missing".to_string(),
            registered: vec!["process".to_string(), "sdk".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("missing"));
        assert!(message.contains("process, sdk"));
    }

    #[test]
    fn test_method_not_found() {
        let err = AcpError::method_not_found("foo");
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "Method not found: foo");
        assert_eq!(err.to_string(), "Method not found: foo");
    }

    #[test]
    fn test_acp_error_codes() {
        assert_eq!(AcpError::parse_error("x").code, -32700);
        assert_eq!(AcpError::invalid_request("x").code, -32600);
        assert_eq!(AcpError::invalid_params("x").code, -32602);
        assert_eq!(AcpError::internal_error("x").code, -32603);
        assert_eq!(AcpError::auth_required().code, -32000);
        assert_eq!(AcpError::resource_not_found("x").code, -32002);
    }

    #[test]
    fn test_acp_error_wire_shape() {
        let err = AcpError::internal_error("boom").with_data("details");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], -32603);
        assert_eq!(value["data"], "details");

        let plain = serde_json::to_value(AcpError::auth_required()).unwrap();
        assert!(plain.get("data").is_none());

        let parsed: AcpError =
            serde_json::from_str(r#"{"code":-32601,"message":"Method not found: x"}"#).unwrap();
        assert_eq!(parsed, AcpError::method_not_found("x"));
    }

    #[test]
    fn test_json_rpc_error_codes() {
        let err = ClientError::Protocol(AcpError::method_not_found("x"));
        assert_eq!(err.to_json_rpc_error(), -32601);

        let err = ClientError::InvalidHandle("t".to_string());
        assert_eq!(err.to_json_rpc_error(), -32002);

        let err = ClientError::Internal("t".to_string());
        assert_eq!(err.to_json_rpc_error(), -32603);
    }

    #[test]
    fn test_to_acp_error_preserves_protocol_errors() {
        let original = AcpError::resource_not_found("/tmp/missing");
        let err = ClientError::Protocol(original.clone());
        assert_eq!(err.to_acp_error(), original);

        let err = ClientError::Connection("closed".to_string());
        let encoded = err.to_acp_error();
        assert_eq!(encoded.code, -32603);
        assert_eq!(encoded.message, "Connection error: closed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let client_error: ClientError = io_error.into();

        match client_error {
            ClientError::Io(_) => {} // Expected
            _ => panic!("Expected Io variant"),
        }
    }

    #[test]
    fn test_serde_error_conversion() {
        let serde_error = serde_json::from_str::<serde_json::Value>("{invalid json").unwrap_err();
        let client_error: ClientError = serde_error.into();
        assert!(matches!(client_error, ClientError::Serialization(_)));
    }
}
