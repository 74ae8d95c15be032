//! Shared types for the MCP client.
//!
//! Server configuration as persisted in the registry, per-connection state,
//! and the status snapshot reported to the application.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::protocol::ServerInfo;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Default per-request timeout (seconds) when a config omits `timeout`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How the client reaches a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawned subprocess, newline-delimited JSON over stdin/stdout.
    Stdio,
    /// JSON-RPC over HTTP POST.
    Http,
    /// Reserved; configs validate but connecting fails.
    Websocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Http => "http",
            TransportKind::Websocket => "websocket",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tool server entry in `mcp_servers.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique, stable identifier. Immutable once created.
    pub server_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub transport: TransportKind,
    /// Executable for stdio servers.
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Endpoint for http/websocket servers.
    #[serde(default)]
    pub url: String,
    /// Environment overrides for the spawned process. Values may reference
    /// `${VAR}` / `${VAR:-default}`; they are resolved at spawn time.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub enabled: bool,
    /// Only honored by the opt-in reconnect supervisor.
    #[serde(default)]
    pub auto_reconnect: bool,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl ServerConfig {
    /// Create a stdio server config (disabled until explicitly enabled).
    pub fn stdio(server_id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        let server_id = server_id.into();
        Self {
            name: server_id.clone(),
            server_id,
            description: String::new(),
            transport: TransportKind::Stdio,
            command: command.into(),
            args,
            url: String::new(),
            env: HashMap::new(),
            timeout: DEFAULT_TIMEOUT_SECS,
            enabled: false,
            auto_reconnect: false,
        }
    }

    /// Create an HTTP server config (disabled until explicitly enabled).
    pub fn http(server_id: impl Into<String>, url: impl Into<String>) -> Self {
        let server_id = server_id.into();
        Self {
            name: server_id.clone(),
            server_id,
            description: String::new(),
            transport: TransportKind::Http,
            command: String::new(),
            args: Vec::new(),
            url: url.into(),
            env: HashMap::new(),
            timeout: DEFAULT_TIMEOUT_SECS,
            enabled: false,
            auto_reconnect: false,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// The request timeout as a `Duration` (never zero).
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.server_id
        } else {
            &self.name
        }
    }

    /// Check the transport-dependent required fields.
    ///
    /// stdio requires a non-empty `command`; http and websocket require a
    /// non-empty `url`.
    pub fn validate(&self) -> Result<(), McpError> {
        let invalid = |reason: &str| McpError::InvalidConfig {
            server_id: self.server_id.clone(),
            reason: reason.to_string(),
        };

        if self.server_id.trim().is_empty() {
            return Err(invalid("server_id must not be empty"));
        }

        match self.transport {
            TransportKind::Stdio if self.command.trim().is_empty() => {
                Err(invalid("stdio transport requires a non-empty command"))
            }
            TransportKind::Http | TransportKind::Websocket if self.url.trim().is_empty() => Err(
                invalid(&format!("{} transport requires a non-empty url", self.transport)),
            ),
            _ => Ok(()),
        }
    }
}

// ─── Connection State ────────────────────────────────────────────────────────

/// Lifecycle position of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Status plus the message of the last failure, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub error: Option<String>,
}

impl ConnectionState {
    pub fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            error: None,
        }
    }

    pub fn connecting() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            error: None,
        }
    }

    pub fn connected() -> Self {
        Self {
            status: ConnectionStatus::Connected,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Error,
            error: Some(message.into()),
        }
    }

    /// Disconnected, but remembering why (peer exited, …).
    pub fn lost(message: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            error: Some(message.into()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::disconnected()
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Per-server status row returned by `get_server_status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub status: ConnectionStatus,
    pub error: Option<String>,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    pub server_info: Option<ServerInfo>,
    pub protocol_version: Option<String>,
    /// RFC 3339 timestamp of the last successful handshake.
    pub connected_at: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
