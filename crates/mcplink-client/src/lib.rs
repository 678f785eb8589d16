//! High-level MCP stdio client for mcplink.
//!
//! This is the "just works" layer. Spawn a tool server, perform the
//! handshake, then issue concurrent tool calls from any thread: a single
//! background reader routes each reply to the caller whose request id it
//! matches, per-call deadlines never leak pending state, and an optional
//! caching decorator memoizes idempotent tools.

pub mod cache;
pub mod client;
pub mod connection;
pub mod correlate;
pub mod error;
pub mod state;

pub use cache::{cache_key, CacheConfig, CacheStats, ToolCache, ToolCaller};
pub use client::{ClientConfig, McpClient, ToolCall};
pub use connection::Connection;
pub use correlate::{CallHandle, Correlator};
pub use error::{ClientError, Result};
pub use state::ConnectionState;
