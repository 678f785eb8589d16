use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WireError};

/// JSON-RPC version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Limit on how much of an unrecognized line is echoed into errors.
const ERROR_SNIPPET_LEN: usize = 120;

/// A request/response identifier. We always generate integers, but the
/// server may echo back either form and dispatch must match both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self::Number(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::Text(id) => write!(f, "{id}"),
        }
    }
}

/// An outgoing method call expecting a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Create a request with the standard version tag.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A one-way message with no reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    /// Create a notification with the standard version tag.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A remote error descriptor from a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Result-or-error payload of a response.
///
/// Flattened into [`Response`], so a message only classifies as a response
/// when it actually carries a `result` or `error` member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseOutcome {
    Result(Value),
    Error(RpcError),
}

/// A reply to a previously sent request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

impl Response {
    /// Create a successful response (test and fixture helper).
    pub fn result(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            outcome: ResponseOutcome::Result(result),
        }
    }

    /// Create an error response (test and fixture helper).
    pub fn error(id: impl Into<RequestId>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            outcome: ResponseOutcome::Error(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Classification of one incoming line.
///
/// Variant order matters: a response carries `result`/`error`, a request
/// carries `id` + `method`, and anything with just `method` is a
/// notification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Response(Response),
    Request(Request),
    Notification(Notification),
}

impl Message {
    /// Parse and classify one wire line.
    pub fn from_line(line: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(line)?;
        serde_json::from_value(value).map_err(|_| {
            let text = String::from_utf8_lossy(line);
            let snippet: String = text.chars().take(ERROR_SNIPPET_LEN).collect();
            WireError::UnrecognizedMessage(snippet)
        })
    }
}
