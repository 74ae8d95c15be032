//! mcp-hub — connects an assistant to external MCP tool servers.
//!
//! Layers, bottom up:
//! - [`mcp_client`]: registry, transports, handshake, catalogs, and the
//!   [`ClientManager`](mcp_client::ClientManager) that routes calls
//! - [`dispatch`]: LLM-facing tool names and call envelopes
//! - [`service`]: the [`McpHub`](service::McpHub) facade an application holds
//! - [`settings`] / [`logging`]: ambient configuration and tracing setup

pub mod dispatch;
pub mod logging;
pub mod mcp_client;
pub mod service;
pub mod settings;

pub use dispatch::{ToolDispatcher, ToolEnvelope, ToolRef};
pub use mcp_client::{ClientManager, McpError, ServerConfig, ServerRegistry};
pub use service::{Envelope, McpHub};
pub use settings::HubSettings;

/// Return the platform-standard data directory for mcp-hub.
///
/// - macOS: `~/Library/Application Support/mcp-hub/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-hub\`
/// - Linux: `$XDG_DATA_HOME/mcp-hub/` (fallback `~/.local/share/mcp-hub/`)
///
/// Falls back to `~/.mcp-hub/` only if none of the above can be resolved.
pub fn data_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-hub");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".mcp-hub")
}
