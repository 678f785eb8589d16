//! Newline-delimited JSON-RPC 2.0 framing for mcplink.
//!
//! This is the wire layer: every message is one JSON document terminated by
//! `\n`, the framing used by MCP stdio servers. The codec hands callers
//! complete lines only — no partial reads, no buffer management in user
//! code — and the message model classifies each line as a request,
//! response, or notification.

pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{decode_line, encode, WireConfig, DEFAULT_MAX_LINE};
pub use error::{Result, WireError};
pub use message::{
    Message, Notification, Request, RequestId, Response, ResponseOutcome, RpcError, JSONRPC_VERSION,
    PROTOCOL_VERSION,
};
pub use reader::LineReader;
pub use writer::LineWriter;
