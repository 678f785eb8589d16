use std::fmt;
use std::time::Duration;

use mcplink_proc::{ServerProcess, StopOutcome};
use mcplink_wire::{WireConfig, PROTOCOL_VERSION};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cache::ToolCaller;
use crate::connection::Connection;
use crate::correlate::CallHandle;
use crate::error::{ClientError, Result};
use crate::state::ConnectionState;

/// Client behavior knobs. `Default` matches a typical local tool server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline applied to calls that don't pass their own.
    pub default_timeout: Duration,
    /// Deadline for the initialize exchange.
    pub handshake_timeout: Duration,
    /// Grace period for draining calls and stopping the server on close.
    pub shutdown_grace: Duration,
    /// Protocol revision offered during the handshake.
    pub protocol_version: String,
    /// Client name reported in `clientInfo`.
    pub client_name: String,
    /// Client version reported in `clientInfo`.
    pub client_version: String,
    /// Wire-level settings (line size limit).
    pub wire: WireConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(3),
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_name: "mcplink".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            wire: WireConfig::default(),
        }
    }
}

/// A handshake-gated MCP client over one tool-server connection.
///
/// Construction leaves the client `Unstarted`; every tool call is rejected
/// with [`ClientError::NotReady`] until [`initialize`] succeeds. Calls may
/// then be issued concurrently from any thread.
///
/// [`initialize`]: McpClient::initialize
pub struct McpClient {
    connection: Connection,
    process: Option<ServerProcess>,
    config: ClientConfig,
}

impl McpClient {
    /// Spawn a tool server and connect to its stdio, with default
    /// configuration.
    pub fn spawn(command: &[String]) -> Result<Self> {
        Self::spawn_with_config(command, ClientConfig::default())
    }

    /// Spawn a tool server and connect to its stdio.
    pub fn spawn_with_config(command: &[String], config: ClientConfig) -> Result<Self> {
        let mut process = ServerProcess::spawn(command)?;
        let stdout = process.take_stdout()?;
        let stdin = process.take_stdin()?;
        let connection = Connection::start(stdout, stdin, config.wire.clone());

        Ok(Self {
            connection,
            process: Some(process),
            config,
        })
    }

    /// Build a client over an existing connection (no owned subprocess).
    pub fn from_connection(connection: Connection, config: ClientConfig) -> Self {
        Self {
            connection,
            process: None,
            config,
        }
    }

    /// Perform the initialize exchange and unlock tool calls.
    ///
    /// Sends `initialize`, waits for the server's reply within the
    /// handshake deadline, then acknowledges with the
    /// `notifications/initialized` notification. Returns the server's
    /// initialize result. Any failure leaves the client `Failed`.
    pub fn initialize(&self) -> Result<Value> {
        if !self
            .connection
            .transition(ConnectionState::Unstarted, ConnectionState::Initializing)
        {
            return Err(ClientError::NotReady(self.connection.state()));
        }

        match self.handshake() {
            Ok(server_info) => {
                self.connection
                    .transition(ConnectionState::Initializing, ConnectionState::Ready);
                Ok(server_info)
            }
            Err(err) => {
                self.connection.set_state(ConnectionState::Failed);
                Err(ClientError::HandshakeFailed(Box::new(err)))
            }
        }
    }

    fn handshake(&self) -> Result<Value> {
        let params = json!({
            "protocolVersion": self.config.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            },
        });

        let server_info =
            self.connection
                .request("initialize", Some(params), self.config.handshake_timeout)?;

        if let Some(name) = server_info
            .get("serverInfo")
            .and_then(|info| info.get("name"))
            .and_then(Value::as_str)
        {
            info!(server = name, "handshake complete");
        }

        self.connection.notify("notifications/initialized", None)?;
        Ok(server_info)
    }

    /// Invoke a tool and block for its unwrapped result.
    ///
    /// `timeout` of `None` uses the configured default.
    pub fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        self.call_tool_detached(name, arguments)?.wait(timeout)
    }

    /// Invoke a tool and return a handle, so several calls can be in
    /// flight from one thread.
    pub fn call_tool_detached(&self, name: &str, arguments: Value) -> Result<ToolCall> {
        self.ensure_ready()?;
        let params = json!({ "name": name, "arguments": arguments });
        let handle = self
            .connection
            .request_detached("tools/call", Some(params))?;
        debug!(tool = name, id = handle.id(), "tool call dispatched");
        Ok(ToolCall { handle })
    }

    /// List the tools the server exposes.
    pub fn list_tools(&self) -> Result<Value> {
        self.ensure_ready()?;
        self.connection
            .request("tools/list", None, self.config.default_timeout)
    }

    /// Liveness probe.
    pub fn ping(&self) -> Result<()> {
        self.ensure_ready()?;
        self.connection
            .request("ping", None, self.config.default_timeout)?;
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.connection.pending_calls()
    }

    /// Pid of the owned server process, if this client spawned one.
    pub fn server_pid(&self) -> Option<u32> {
        self.process.as_ref().map(ServerProcess::id)
    }

    /// Shut down in order: stop accepting calls, drain in-flight calls up
    /// to the grace period, close the server's stdin, then stop the
    /// process (escalating to SIGTERM and kill if it lingers).
    ///
    /// Idempotent; later calls report [`StopOutcome::AlreadyExited`].
    pub fn close(&mut self) -> Result<Option<StopOutcome>> {
        let grace = self.config.shutdown_grace;
        self.connection.begin_close(grace);

        let outcome = match self.process.as_mut() {
            Some(process) => Some(process.shutdown(grace)?),
            None => None,
        };
        self.connection.join_reader();

        if let Some(outcome) = outcome {
            debug!(?outcome, "client closed");
        }
        Ok(outcome)
    }

    fn ensure_ready(&self) -> Result<()> {
        let state = self.connection.state();
        if state.accepts_calls() {
            Ok(())
        } else {
            Err(ClientError::NotReady(state))
        }
    }
}

impl fmt::Debug for McpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpClient")
            .field("state", &self.connection.state())
            .field("pid", &self.server_pid())
            .field("pending_calls", &self.pending_calls())
            .finish_non_exhaustive()
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if self.process.is_some() {
            if let Err(err) = self.close() {
                warn!(error = %err, "shutdown on drop failed");
            }
        }
    }
}

impl ToolCaller for McpClient {
    fn call_tool(&self, name: &str, arguments: Value, timeout: Option<Duration>) -> Result<Value> {
        McpClient::call_tool(self, name, arguments, timeout)
    }
}

/// One in-flight tool call.
pub struct ToolCall {
    handle: CallHandle,
}

impl ToolCall {
    /// The request id backing this call.
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Block until the call resolves, then unwrap the tool result.
    pub fn wait(self, timeout: Duration) -> Result<Value> {
        unwrap_tool_result(self.handle.wait(timeout)?)
    }
}

/// Unwrap the MCP `tools/call` result envelope.
///
/// Servers wrap output as `{"content": [{"type": "text", "text": ...}],
/// "isError": bool}`. Text blocks are concatenated and, when they parse as
/// JSON, returned structured; otherwise as a plain string. Results without
/// a `content` array pass through untouched.
fn unwrap_tool_result(result: Value) -> Result<Value> {
    let Some(content) = result.get("content").and_then(Value::as_array) else {
        return Ok(result);
    };

    let text = content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");

    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(ClientError::ToolFailed(text));
    }

    match serde_json::from_str(&text) {
        Ok(parsed) => Ok(parsed),
        Err(_) => Ok(Value::String(text)),
    }
}
