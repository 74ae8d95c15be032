//! MCP client error types.
//!
//! Every failure the tool-integration layer can produce is an [`McpError`].
//! Callers that need to branch on the broad category (config vs connection
//! vs protocol …) use [`McpError::kind`] instead of matching every variant.

use serde::Serialize;
use thiserror::Error;

/// Broad error category, stable across variants and serialized into
/// failure envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or conflicting server configuration.
    Config,
    /// A connection could not be established or was lost.
    Connection,
    /// The peer answered with a JSON-RPC error.
    Protocol,
    /// Unknown tool/resource/prompt, or server not currently connected.
    NotFound,
    /// No response within the configured bound.
    Timeout,
    /// Reading or writing the registry file failed.
    Persistence,
}

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server configuration failed validation.
    #[error("invalid config for server '{server_id}': {reason}")]
    InvalidConfig { server_id: String, reason: String },

    /// `add` was called with a `server_id` that already exists.
    #[error("server '{server_id}' already exists")]
    DuplicateServer { server_id: String },

    /// No configuration exists for this server id.
    #[error("no configuration for server '{server_id}'")]
    ServerNotFound { server_id: String },

    /// The server is configured but has no live connection.
    #[error("server '{server_id}' is not connected")]
    NotConnected { server_id: String },

    /// The stdio command could not be found on the execution path.
    #[error("command '{command}' for server '{name}' not found on PATH")]
    CommandNotFound { name: String, command: String },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// The transport kind is declared but not implemented.
    #[error("server '{name}' uses unsupported transport '{transport}'")]
    UnsupportedTransport { name: String, transport: String },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The peer closed its end of the channel (process exited).
    #[error("server '{name}' closed the connection: {reason}")]
    PeerClosed { name: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found in the catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// Resource not found in the catalog.
    #[error("unknown resource: '{uri}'")]
    UnknownResource { uri: String },

    /// Prompt not found in the catalog.
    #[error("unknown prompt: '{name}'")]
    UnknownPrompt { name: String },

    /// A request timed out.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The registry file could not be read or written.
    #[error("registry error at '{path}': {reason}")]
    Persistence { path: String, reason: String },
}

impl McpError {
    /// The broad category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::InvalidConfig { .. } | McpError::DuplicateServer { .. } => ErrorKind::Config,
            McpError::ServerNotFound { .. }
            | McpError::NotConnected { .. }
            | McpError::UnknownTool { .. }
            | McpError::UnknownResource { .. }
            | McpError::UnknownPrompt { .. } => ErrorKind::NotFound,
            McpError::CommandNotFound { .. }
            | McpError::SpawnFailed { .. }
            | McpError::InitFailed { .. }
            | McpError::UnsupportedTransport { .. }
            | McpError::TransportError { .. }
            | McpError::PeerClosed { .. } => ErrorKind::Connection,
            McpError::ServerError { .. } => ErrorKind::Protocol,
            McpError::Timeout { .. } => ErrorKind::Timeout,
            McpError::Persistence { .. } => ErrorKind::Persistence,
        }
    }

    /// Whether the error means the underlying channel can no longer be trusted.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            McpError::TransportError { .. } | McpError::PeerClosed { .. } | McpError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            McpError::DuplicateServer { server_id: "a".into() }.kind(),
            ErrorKind::Config
        );
        assert_eq!(
            McpError::NotConnected { server_id: "a".into() }.kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            McpError::CommandNotFound {
                name: "a".into(),
                command: "nope".into()
            }
            .kind(),
            ErrorKind::Connection
        );
        assert_eq!(
            McpError::ServerError {
                code: -32601,
                message: "Method not found".into(),
                data: None
            }
            .kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            McpError::Timeout {
                server: "a".into(),
                method: "tools/call".into(),
                timeout_ms: 10
            }
            .kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_channel_failure() {
        assert!(McpError::PeerClosed {
            name: "a".into(),
            reason: "eof".into()
        }
        .is_channel_failure());
        assert!(!McpError::UnknownTool { name: "x".into() }.is_channel_failure());
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
    }
}
