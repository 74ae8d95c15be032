//! MCP client — connections to external tool servers.
//!
//! This module handles:
//! - Persisting server configurations (`mcp_servers.json`)
//! - Spawning stdio servers and talking JSON-RPC 2.0 over their pipes
//! - JSON-RPC over HTTP POST for remote servers
//! - The initialize handshake and tool/resource/prompt discovery
//! - Aggregating catalogs and routing calls across servers
//! - Optional background reconnection
//!
//! The [`ClientManager`] is used by the tool dispatcher to route tool calls
//! from the LLM to the server that advertised them.

pub mod catalog;
pub mod connection;
pub mod errors;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod supervisor;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use catalog::{CapabilityCatalog, PromptDescriptor, ResourceDescriptor, ToolDescriptor};
pub use connection::Connection;
pub use errors::{ErrorKind, McpError};
pub use manager::{BulkErrors, ClientManager, Routed};
pub use registry::{ConfigMap, ServerRegistry};
pub use supervisor::{SupervisorConfig, SupervisorHandle};
pub use types::{ConnectionState, ConnectionStatus, ServerConfig, ServerStatus, TransportKind};
