//! JSON-RPC 2.0 envelopes exchanged as newline-delimited JSON

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::AcpError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Request id; agents may use numbers or strings
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Str(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Any line read from the peer, before classification
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<AcpError>,
}

/// A classified inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Request {
        id: RequestId,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: RequestId,
        result: Result<Value, AcpError>,
    },
}

impl Incoming {
    /// Parse one line of input
    ///
    /// Returns the id alongside the error when the line was recognisably a
    /// request, so the caller can answer it.
    pub fn parse(line: &str) -> Result<Self, (Option<RequestId>, AcpError)> {
        let raw: RawMessage =
            serde_json::from_str(line).map_err(|e| (None, AcpError::parse_error(e)))?;

        if raw.jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
            return Err((
                raw.id,
                AcpError::invalid_request("missing or unsupported jsonrpc version"),
            ));
        }

        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Incoming::Request {
                id,
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            (None, Some(method)) => Ok(Incoming::Notification {
                method,
                params: raw.params.unwrap_or(Value::Null),
            }),
            (Some(id), None) => {
                let result = match raw.error {
                    Some(error) => Err(error),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Incoming::Response { id, result })
            }
            (None, None) => Err((
                None,
                AcpError::invalid_request("message has neither id nor method"),
            )),
        }
    }
}

/// An outbound message, serialised to a single line
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Request {
        jsonrpc: &'static str,
        id: RequestId,
        method: String,
        params: Value,
    },
    Notification {
        jsonrpc: &'static str,
        method: String,
        params: Value,
    },
    Response {
        jsonrpc: &'static str,
        id: RequestId,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<AcpError>,
    },
}

impl Outgoing {
    pub fn request(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Outgoing::Request {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Outgoing::Notification {
            jsonrpc: JSONRPC_VERSION,
            method: method.into(),
            params,
        }
    }

    pub fn response(id: RequestId, result: Result<Value, AcpError>) -> Self {
        let (result, error) = match result {
            Ok(value) => (Some(value), None),
            Err(error) => (None, Some(error)),
        };
        Outgoing::Response {
            jsonrpc: JSONRPC_VERSION,
            id,
            result,
            error,
        }
    }

    /// Serialise to a single line without the trailing newline
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
