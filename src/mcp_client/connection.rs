//! One live session with one configured server.
//!
//! A [`Connection`] owns its transport, runs the handshake, caches the
//! server's [`CapabilityCatalog`] and issues correlated requests. Failures
//! stay inside the connection: they update its state and error message and
//! are returned to the caller of the failing operation only.
//!
//! A stdio peer that exits while idle is reported as disconnected from the
//! moment its process is reaped; the transport itself is released by the
//! next operation that touches it.

use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{watch, RwLock};

use super::catalog::CapabilityCatalog;
use super::errors::McpError;
use super::protocol::{
    decode_result, CallToolParams, CallToolResult, ClientNotification, ClientRequest,
    GetPromptParams, GetPromptResult, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, PageParams, ReadResourceParams, ReadResourceResult,
    ServerInfo,
};
use super::transport::Transport;
use super::types::{ConnectionState, ConnectionStatus, ServerConfig, ServerStatus, TransportKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on `nextCursor` pages followed per listing.
const MAX_LIST_PAGES: usize = 32;

/// Grace period between SIGTERM and kill on teardown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Session Metadata ────────────────────────────────────────────────────────

/// What the server told us during the handshake.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub protocol_version: Option<String>,
    pub server_info: Option<ServerInfo>,
    pub capabilities: Map<String, Value>,
    pub connected_at: DateTime<Utc>,
}

// ─── Connection ──────────────────────────────────────────────────────────────

pub struct Connection {
    config: ServerConfig,
    state: StdRwLock<ConnectionState>,
    catalog: StdRwLock<Arc<CapabilityCatalog>>,
    session: StdRwLock<Option<SessionInfo>>,
    transport: RwLock<Option<Arc<Transport>>>,
    /// Exit status of the live stdio peer, if it has one.
    peer_exit: StdRwLock<Option<watch::Receiver<Option<String>>>>,
    shutdown_grace: Duration,
}

impl Connection {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: StdRwLock::new(ConnectionState::disconnected()),
            catalog: StdRwLock::new(Arc::new(CapabilityCatalog::new())),
            session: StdRwLock::new(None),
            transport: RwLock::new(None),
            peer_exit: StdRwLock::new(None),
            shutdown_grace: SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    /// Current state. A connected stdio server whose process has exited
    /// reads as disconnected.
    pub fn state(&self) -> ConnectionState {
        let state = self.recorded_state();
        if !state.is_connected() {
            return state;
        }
        match self.peer_exit_status() {
            Some(status) => ConnectionState::lost(self.peer_exit_error(&status).to_string()),
            None => state,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Connected as far as the last operation knows, but the process is gone.
    pub fn has_lost_peer(&self) -> bool {
        self.recorded_state().is_connected() && self.peer_exit_status().is_some()
    }

    fn recorded_state(&self) -> ConnectionState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn peer_exit_status(&self) -> Option<String> {
        self.peer_exit
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|exit| exit.borrow().clone())
    }

    fn peer_exit_error(&self, status: &str) -> McpError {
        McpError::PeerClosed {
            name: self.server_id().to_string(),
            reason: format!("process exited ({status})"),
        }
    }

    /// The current catalog. Empty unless connected.
    pub fn catalog(&self) -> Arc<CapabilityCatalog> {
        Arc::clone(&self.catalog.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Open the transport, handshake and populate the catalog.
    ///
    /// An already-open connection is torn down first. On failure every
    /// acquired resource is released and the state is `error`.
    pub async fn connect(&self) -> Result<(), McpError> {
        self.disconnect().await;

        let id = self.server_id().to_string();
        self.set_state(ConnectionState::connecting());
        tracing::info!(server = %id, transport = %self.config.transport, "connecting");

        if let Err(e) = self.config.validate() {
            self.set_state(ConnectionState::error(e.to_string()));
            return Err(e);
        }

        let transport = match Transport::open(&self.config).await {
            Ok(t) => Arc::new(t),
            Err(e) => {
                tracing::warn!(server = %id, error = %e, "failed to open transport");
                self.set_state(ConnectionState::error(e.to_string()));
                return Err(e);
            }
        };

        let init = match self.handshake(&transport).await {
            Ok(init) => init,
            Err(e) => {
                transport.shutdown(self.shutdown_grace).await;
                tracing::warn!(server = %id, error = %e, "handshake failed");
                self.set_state(ConnectionState::error(e.to_string()));
                return Err(e);
            }
        };

        let catalog = self.discover(&transport, &init).await;

        tracing::info!(
            server = %id,
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            tools = catalog.tools().len(),
            resources = catalog.resources().len(),
            prompts = catalog.prompts().len(),
            "connected"
        );

        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(SessionInfo {
            protocol_version: init.protocol_version,
            server_info: init.server_info,
            capabilities: init.capabilities,
            connected_at: Utc::now(),
        });
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(catalog);
        *self.peer_exit.write().unwrap_or_else(|e| e.into_inner()) = transport.exit_watch();
        *self.transport.write().await = Some(transport);
        self.set_state(ConnectionState::connected());
        Ok(())
    }

    /// Release the transport, clear the catalog and mark `disconnected`.
    ///
    /// Idempotent.
    pub async fn disconnect(&self) {
        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            tracing::info!(server = %self.server_id(), "disconnecting");
            transport.shutdown(self.shutdown_grace).await;
        }
        self.clear_session();
        self.set_state(ConnectionState::disconnected());
    }

    async fn handshake(&self, transport: &Transport) -> Result<InitializeResult, McpError> {
        let id = self.server_id();
        let request = ClientRequest::Initialize(InitializeParams::default());

        let value = match self.exchange(transport, &request, self.config.request_timeout()).await {
            Ok(value) => value,
            Err(e @ McpError::Timeout { .. }) => return Err(e),
            Err(e) => {
                return Err(McpError::InitFailed {
                    name: id.to_string(),
                    reason: with_diagnostics(e.to_string(), transport),
                })
            }
        };

        let init: InitializeResult =
            serde_json::from_value(value).map_err(|e| McpError::InitFailed {
                name: id.to_string(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        transport
            .notify(&ClientNotification::Initialized)
            .await
            .map_err(|e| McpError::InitFailed {
                name: id.to_string(),
                reason: with_diagnostics(format!("initialized notification failed: {e}"), transport),
            })?;

        Ok(init)
    }

    /// Query all three listings. Each one is best-effort.
    async fn discover(&self, transport: &Transport, init: &InitializeResult) -> CapabilityCatalog {
        let tools = self
            .list_or_empty(transport, init, "tools", ClientRequest::ListTools, |r: ListToolsResult| {
                (r.tools, r.next_cursor)
            })
            .await;
        let resources = self
            .list_or_empty(
                transport,
                init,
                "resources",
                ClientRequest::ListResources,
                |r: ListResourcesResult| (r.resources, r.next_cursor),
            )
            .await;
        let prompts = self
            .list_or_empty(
                transport,
                init,
                "prompts",
                ClientRequest::ListPrompts,
                |r: ListPromptsResult| (r.prompts, r.next_cursor),
            )
            .await;

        CapabilityCatalog::from_listings(self.server_id(), tools, resources, prompts)
    }

    async fn list_or_empty<R, T>(
        &self,
        transport: &Transport,
        init: &InitializeResult,
        category: &str,
        make_request: impl Fn(PageParams) -> ClientRequest,
        split: impl Fn(R) -> (Vec<T>, Option<String>),
    ) -> Vec<T>
    where
        R: serde::de::DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor = None;

        for _ in 0..MAX_LIST_PAGES {
            let request = make_request(PageParams { cursor });
            let page = self
                .exchange(transport, &request, self.config.request_timeout())
                .await
                .and_then(|v| decode_result::<R>(self.server_id(), request.method(), v));

            match page {
                Ok(page) => {
                    let (mut batch, next) = split(page);
                    items.append(&mut batch);
                    match next {
                        Some(next) if !next.is_empty() => cursor = Some(next),
                        _ => return items,
                    }
                }
                Err(e) => {
                    if init.advertises(category) {
                        tracing::warn!(server = %self.server_id(), category, error = %e, "listing failed");
                    } else {
                        tracing::debug!(server = %self.server_id(), category, error = %e, "listing not supported");
                    }
                    return items;
                }
            }
        }

        tracing::warn!(
            server = %self.server_id(),
            category,
            pages = MAX_LIST_PAGES,
            "listing truncated at page limit"
        );
        items
    }

    // ─── Calls ───────────────────────────────────────────────────────────────

    /// Invoke a tool advertised by this server.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        self.call_tool_with_timeout(name, arguments, self.config.request_timeout())
            .await
    }

    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_connected().await?;
        if !self.catalog().has_tool(name) {
            return Err(McpError::UnknownTool {
                name: name.to_string(),
            });
        }

        let arguments = if arguments.is_null() {
            Value::Object(Map::new())
        } else {
            arguments
        };
        let request = ClientRequest::CallTool(CallToolParams {
            name: name.to_string(),
            arguments,
        });

        tracing::debug!(server = %self.server_id(), tool = name, "calling tool");
        let value = self.request(&request, timeout).await?;
        decode_result(self.server_id(), request.method(), value)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        self.ensure_connected().await?;
        if !self.catalog().has_resource(uri) {
            return Err(McpError::UnknownResource {
                uri: uri.to_string(),
            });
        }

        let request = ClientRequest::ReadResource(ReadResourceParams {
            uri: uri.to_string(),
        });
        let value = self.request(&request, self.config.request_timeout()).await?;
        decode_result(self.server_id(), request.method(), value)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<GetPromptResult, McpError> {
        self.ensure_connected().await?;
        if !self.catalog().has_prompt(name) {
            return Err(McpError::UnknownPrompt {
                name: name.to_string(),
            });
        }

        let request = ClientRequest::GetPrompt(GetPromptParams {
            name: name.to_string(),
            arguments,
        });
        let value = self.request(&request, self.config.request_timeout()).await?;
        decode_result(self.server_id(), request.method(), value)
    }

    /// Fail unless connected. A peer found dead here is released first.
    async fn ensure_connected(&self) -> Result<(), McpError> {
        if !self.recorded_state().is_connected() {
            return Err(McpError::NotConnected {
                server_id: self.server_id().to_string(),
            });
        }
        let Some(status) = self.peer_exit_status() else {
            return Ok(());
        };

        let err = self.peer_exit_error(&status);
        let transport = self.transport.read().await.clone();
        if let Some(transport) = transport {
            tracing::warn!(server = %self.server_id(), %status, "server exited while idle, releasing connection");
            self.release(&transport, ConnectionState::lost(err.to_string())).await;
        }
        Err(err)
    }

    /// Issue a request on the live transport and apply the failure policy.
    ///
    /// A stdio timeout or broken pipe leaves a channel whose next read could
    /// belong to the wrong request, so the process is torn down.
    async fn request(&self, request: &ClientRequest, timeout: Duration) -> Result<Value, McpError> {
        let transport = self
            .transport
            .read()
            .await
            .clone()
            .ok_or_else(|| McpError::NotConnected {
                server_id: self.server_id().to_string(),
            })?;

        let result = self.exchange(&transport, request, timeout).await;

        if let Err(e) = &result {
            if transport.kind() == TransportKind::Stdio && e.is_channel_failure() {
                let next = match e {
                    McpError::PeerClosed { .. } => ConnectionState::lost(e.to_string()),
                    _ => ConnectionState::error(e.to_string()),
                };
                tracing::warn!(
                    server = %self.server_id(),
                    method = request.method(),
                    error = %e,
                    "channel failed, releasing connection"
                );
                self.release(&transport, next).await;
            }
        }
        result
    }

    async fn exchange(
        &self,
        transport: &Transport,
        request: &ClientRequest,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        match tokio::time::timeout(timeout, transport.request(request, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: self.server_id().to_string(),
                method: request.method().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Drop `failed` if it is still the live transport, then set `next`.
    async fn release(&self, failed: &Arc<Transport>, next: ConnectionState) {
        let taken = {
            let mut guard = self.transport.write().await;
            match guard.as_ref() {
                Some(current) if Arc::ptr_eq(current, failed) => guard.take(),
                _ => None,
            }
        };
        if let Some(transport) = taken {
            transport.shutdown(self.shutdown_grace).await;
            self.clear_session();
            self.set_state(next);
        }
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn clear_session(&self) {
        *self.catalog.write().unwrap_or_else(|e| e.into_inner()) =
            Arc::new(CapabilityCatalog::new());
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = None;
        *self.peer_exit.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    // ─── Status ──────────────────────────────────────────────────────────────

    pub fn status(&self) -> ServerStatus {
        let state = self.state();
        let catalog = self.catalog();
        let session = self.session();
        let mut status = status_without_connection(&self.config);
        status.status = state.status;
        status.error = state.error;
        if state.status == ConnectionStatus::Connected {
            status.tool_count = catalog.tools().len();
            status.resource_count = catalog.resources().len();
            status.prompt_count = catalog.prompts().len();
        }
        if let Some(session) = session {
            status.server_info = session.server_info;
            status.protocol_version = session.protocol_version;
            status.connected_at = Some(session.connected_at.to_rfc3339());
        }
        status
    }
}

/// Status row for a configured server that has no connection object.
pub fn status_without_connection(config: &ServerConfig) -> ServerStatus {
    ServerStatus {
        server_id: config.server_id.clone(),
        name: config.display_name().to_string(),
        description: config.description.clone(),
        transport: config.transport,
        enabled: config.enabled,
        status: ConnectionStatus::Disconnected,
        error: None,
        tool_count: 0,
        resource_count: 0,
        prompt_count: 0,
        server_info: None,
        protocol_version: None,
        connected_at: None,
    }
}

fn with_diagnostics(reason: String, transport: &Transport) -> String {
    let extra = transport.diagnostics();
    if extra.trim().is_empty() || reason.contains("stderr:") {
        reason
    } else {
        format!("{reason} | stderr: {}", extra.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
