//! Application-facing operations.
//!
//! [`McpHub`] is what a REST layer or CLI holds. Every operation returns an
//! [`Envelope`] (tool calls return the dispatcher's [`ToolEnvelope`]), so
//! callers never branch on Rust error types.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::dispatch::{LlmTool, ToolDispatcher, ToolEnvelope};
use crate::mcp_client::protocol::{GetPromptResult, ReadResourceResult};
use crate::mcp_client::{
    ClientManager, ErrorKind, McpError, PromptDescriptor, ResourceDescriptor, Routed,
    ServerConfig, ServerRegistry, ServerStatus, SupervisorHandle,
};
use crate::settings::HubSettings;

// ─── Envelope ────────────────────────────────────────────────────────────────

/// Uniform success/error result.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
        }
    }

    pub fn err(error: &McpError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
        }
    }

    /// A failure that still carries data (e.g. status after a failed connect).
    pub fn err_with(error: &McpError, data: T) -> Self {
        Self {
            data: Some(data),
            ..Self::err(error)
        }
    }
}

impl<T> From<Result<T, McpError>> for Envelope<T> {
    fn from(result: Result<T, McpError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(&e),
        }
    }
}

// ─── McpHub ──────────────────────────────────────────────────────────────────

pub struct McpHub {
    manager: Arc<ClientManager>,
    dispatcher: ToolDispatcher,
    settings: HubSettings,
    supervisor: Mutex<Option<SupervisorHandle>>,
}

impl McpHub {
    /// Build a hub from settings. Nothing is loaded or connected yet.
    pub fn new(settings: HubSettings) -> Self {
        let registry = ServerRegistry::new(settings.registry_path());
        Self::with_manager(Arc::new(ClientManager::new(registry)), settings)
    }

    pub fn with_manager(manager: Arc<ClientManager>, settings: HubSettings) -> Self {
        let mut dispatcher =
            ToolDispatcher::new(Arc::clone(&manager)).with_prefix(settings.tool_prefix.clone());
        if let Some(timeout) = settings.call_timeout() {
            dispatcher = dispatcher.with_call_timeout(timeout);
        }
        Self {
            manager,
            dispatcher,
            settings,
            supervisor: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &ToolDispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Load the registry, connect enabled servers and start the supervisor
    /// if configured. Individual connect failures show up in the statuses.
    pub async fn start(&self) -> Envelope<Vec<ServerStatus>> {
        if let Err(e) = self.manager.initialize().await {
            tracing::error!(error = %e, "failed to initialize servers");
            return Envelope::err(&e);
        }

        if self.settings.auto_reconnect {
            let handle = self
                .manager
                .spawn_supervisor(self.settings.supervisor.clone());
            *self.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        Envelope::ok(self.manager.get_server_status())
    }

    /// Stop the supervisor and tear down every connection.
    pub async fn shutdown(&self) {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.stop();
        }
        self.manager.shutdown().await;
    }

    // ─── Servers ─────────────────────────────────────────────────────────────

    pub fn list_servers(&self) -> Envelope<Vec<ServerStatus>> {
        Envelope::ok(self.manager.get_server_status())
    }

    pub async fn add_server(&self, config: ServerConfig) -> Envelope<ServerStatus> {
        let server_id = config.server_id.clone();
        match self.manager.add_server(config).await {
            Ok(()) => self.status_envelope(&server_id),
            Err(e) => Envelope::err(&e),
        }
    }

    pub async fn update_server(&self, server_id: &str, config: ServerConfig) -> Envelope<ServerStatus> {
        match self.manager.update_server(server_id, config).await {
            Ok(()) => self.status_envelope(server_id),
            Err(e) => Envelope::err(&e),
        }
    }

    pub async fn remove_server(&self, server_id: &str) -> Envelope<String> {
        match self.manager.remove_server(server_id).await {
            Ok(true) => Envelope::ok(server_id.to_string()),
            Ok(false) => Envelope::err(&McpError::ServerNotFound {
                server_id: server_id.to_string(),
            }),
            Err(e) => Envelope::err(&e),
        }
    }

    /// Connect a server. On failure the envelope still carries its status.
    pub async fn connect_server(&self, server_id: &str) -> Envelope<ServerStatus> {
        match self.manager.connect_server(server_id).await {
            Ok(()) => self.status_envelope(server_id),
            Err(e) => match self.manager.server_status(server_id) {
                Some(status) => Envelope::err_with(&e, status),
                None => Envelope::err(&e),
            },
        }
    }

    pub async fn disconnect_server(&self, server_id: &str) -> Envelope<ServerStatus> {
        match self.manager.disconnect_server(server_id).await {
            Ok(()) => self.status_envelope(server_id),
            Err(e) => Envelope::err(&e),
        }
    }

    /// Re-read the registry and reconnect everything.
    pub async fn reload(&self) -> Envelope<Vec<ServerStatus>> {
        match self.manager.reload().await {
            Ok(_) => Envelope::ok(self.manager.get_server_status()),
            Err(e) => Envelope::err(&e),
        }
    }

    fn status_envelope(&self, server_id: &str) -> Envelope<ServerStatus> {
        self.manager
            .server_status(server_id)
            .ok_or_else(|| McpError::ServerNotFound {
                server_id: server_id.to_string(),
            })
            .into()
    }

    // ─── Catalog ─────────────────────────────────────────────────────────────

    pub fn list_tools(&self) -> Envelope<Vec<LlmTool>> {
        Envelope::ok(self.dispatcher.list_tools())
    }

    /// Tool list in OpenAI function-calling format.
    pub fn openai_tools(&self) -> Envelope<Vec<Value>> {
        Envelope::ok(self.dispatcher.to_openai_tools())
    }

    pub fn list_resources(&self) -> Envelope<Vec<ResourceDescriptor>> {
        Envelope::ok(self.manager.get_all_resources())
    }

    pub fn list_prompts(&self) -> Envelope<Vec<PromptDescriptor>> {
        Envelope::ok(self.manager.get_all_prompts())
    }

    // ─── Invocation ──────────────────────────────────────────────────────────

    /// Invoke a tool by composite name.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolEnvelope {
        self.dispatcher.invoke(name, arguments).await
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        server_id: Option<&str>,
    ) -> Envelope<Routed<ReadResourceResult>> {
        self.manager.read_resource(uri, server_id).await.into()
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        server_id: Option<&str>,
    ) -> Envelope<Routed<GetPromptResult>> {
        self.manager.get_prompt(name, arguments, server_id).await.into()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::ConnectionStatus;

    fn hub(dir: &tempfile::TempDir) -> McpHub {
        McpHub::new(HubSettings {
            registry_path: Some(dir.path().join("servers.json").display().to_string()),
            ..HubSettings::default()
        })
    }

    #[tokio::test]
    async fn test_start_with_default_registry() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        let env = hub.start().await;
        assert!(env.success);
        assert!(env.data.unwrap().iter().all(|s| !s.enabled));
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_with_malformed_registry_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("servers.json"), "{").unwrap();
        let env = hub(&dir).start().await;
        assert!(!env.success);
        assert_eq!(env.error_kind, Some(ErrorKind::Persistence));
    }

    #[tokio::test]
    async fn test_server_admin_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);

        let added = hub
            .add_server(ServerConfig::stdio("echo", "echo", vec!["hi".into()]))
            .await;
        assert!(added.success);
        assert_eq!(added.data.unwrap().status, ConnectionStatus::Disconnected);

        let dup = hub
            .add_server(ServerConfig::stdio("echo", "cat", vec![]))
            .await;
        assert!(!dup.success);
        assert_eq!(dup.error_kind, Some(ErrorKind::Config));

        let invalid = hub.add_server(ServerConfig::http("web", "")).await;
        assert_eq!(invalid.error_kind, Some(ErrorKind::Config));

        let removed = hub.remove_server("echo").await;
        assert!(removed.success);
        let missing = hub.remove_server("echo").await;
        assert!(!missing.success);
        assert_eq!(missing.error_kind, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_connect_failure_carries_status() {
        let dir = tempfile::tempdir().unwrap();
        let hub = hub(&dir);
        hub.add_server(ServerConfig::stdio(
            "ghost",
            "definitely-not-a-real-command-xyz",
            vec![],
        ))
        .await;
        let env = hub.connect_server("ghost").await;
        assert!(!env.success);
        assert_eq!(env.error_kind, Some(ErrorKind::Connection));
        assert_eq!(env.data.unwrap().status, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_read_unknown_resource() {
        let dir = tempfile::tempdir().unwrap();
        let env = hub(&dir).read_resource("file:///nope", None).await;
        assert!(!env.success);
        assert_eq!(env.error_kind, Some(ErrorKind::NotFound));
    }

    #[test]
    fn test_envelope_json_shape() {
        let ok = serde_json::to_value(Envelope::ok(vec![1, 2])).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true, "data": [1, 2]}));

        let err = serde_json::to_value(Envelope::<()>::err(&McpError::UnknownTool {
            name: "x".into(),
        }))
        .unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["error_kind"], "not_found");
        assert!(err.get("data").is_none());
    }
}
