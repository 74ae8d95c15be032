//! Client manager — owns every config and every live connection.
//!
//! This is the primary API used by the tool dispatcher and the application
//! service. One instance is constructed by the application and shared as an
//! `Arc<ClientManager>`; tests build isolated instances.
//!
//! Structural mutations (connect, disconnect, add, update, remove) are
//! serialized per server id. Different servers proceed independently.
//! Catalog reads take a snapshot and are not linearized with mutations, so
//! a tool seen in a listing may be gone by the time it is called; that case
//! surfaces as a not-found error.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::catalog::{PromptDescriptor, ResourceDescriptor, ToolDescriptor};
use super::connection::{status_without_connection, Connection, SHUTDOWN_TIMEOUT};
use super::errors::McpError;
use super::protocol::{CallToolResult, GetPromptResult, ReadResourceResult};
use super::registry::{ConfigMap, ServerRegistry};
use super::types::{ConnectionStatus, ServerConfig, ServerStatus};

/// A result together with the server that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct Routed<T> {
    pub server_id: String,
    pub result: T,
}

/// Per-server failures from a bulk operation.
pub type BulkErrors = Vec<(String, McpError)>;

// ─── ClientManager ───────────────────────────────────────────────────────────

pub struct ClientManager {
    registry: ServerRegistry,
    configs: StdRwLock<ConfigMap>,
    /// Only present for servers that have been connected since their last
    /// explicit disconnect. Kept after a failed connect so status can show
    /// the error.
    connections: StdRwLock<BTreeMap<String, Arc<Connection>>>,
    server_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Serializes read-modify-write of the registry file.
    registry_lock: Mutex<()>,
    /// Consecutive supervisor reconnect attempts per server.
    reconnect_attempts: StdMutex<HashMap<String, u32>>,
    shutdown_grace: Duration,
}

impl ClientManager {
    pub fn new(registry: ServerRegistry) -> Self {
        Self {
            registry,
            configs: StdRwLock::new(ConfigMap::new()),
            connections: StdRwLock::new(BTreeMap::new()),
            server_locks: StdMutex::new(HashMap::new()),
            registry_lock: Mutex::new(()),
            reconnect_attempts: StdMutex::new(HashMap::new()),
            shutdown_grace: SHUTDOWN_TIMEOUT,
        }
    }

    /// Override how long a stdio server gets to exit before it is killed.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Snapshot of all configs, in routing order.
    pub fn configs(&self) -> ConfigMap {
        self.configs.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn config(&self, server_id: &str) -> Option<ServerConfig> {
        self.configs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(server_id)
            .cloned()
    }

    pub fn connection(&self, server_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(server_id)
            .cloned()
    }

    fn connection_snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn connected(&self) -> impl Iterator<Item = Arc<Connection>> {
        self.connection_snapshot()
            .into_iter()
            .filter(|c| c.is_connected())
    }

    fn server_lock(&self, server_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.server_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(server_id.to_string()).or_default())
    }

    async fn lock_server(&self, server_id: &str) -> OwnedMutexGuard<()> {
        self.server_lock(server_id).lock_owned().await
    }

    /// Drop the lock entry of a server that no longer exists, unless another
    /// task is already waiting on it.
    fn release_server_lock(&self, server_id: &str, guard: OwnedMutexGuard<()>) {
        let mut locks = self.server_locks.lock().unwrap_or_else(|e| e.into_inner());
        let idle = locks
            .get(server_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2);
        if idle && self.config(server_id).is_none() {
            locks.remove(server_id);
        }
        drop(guard);
    }

    fn commit_configs(&self, next: ConfigMap) {
        *self.configs.write().unwrap_or_else(|e| e.into_inner()) = next;
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Load the registry and connect every enabled server.
    ///
    /// Returns the servers that failed to connect (partial startup is OK).
    pub async fn initialize(&self) -> Result<BulkErrors, McpError> {
        let configs = self.registry.load()?;
        tracing::info!(
            path = %self.registry.path().display(),
            servers = configs.len(),
            enabled = configs.values().filter(|c| c.enabled).count(),
            "initializing client manager"
        );
        self.commit_configs(configs);
        Ok(self.connect_all().await)
    }

    /// Connect one server. An existing connection is torn down first.
    ///
    /// Works for disabled servers too; `enabled` only governs automatic
    /// connection.
    pub async fn connect_server(&self, server_id: &str) -> Result<(), McpError> {
        let _guard = self.lock_server(server_id).await;
        self.reset_reconnect_attempts(server_id);
        self.connect_locked(server_id).await
    }

    async fn connect_locked(&self, server_id: &str) -> Result<(), McpError> {
        let config = self.config(server_id).ok_or_else(|| McpError::ServerNotFound {
            server_id: server_id.to_string(),
        })?;

        self.disconnect_locked(server_id).await;

        let connection =
            Arc::new(Connection::new(config).with_shutdown_grace(self.shutdown_grace));
        self.connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(server_id.to_string(), Arc::clone(&connection));

        connection.connect().await
    }

    /// Disconnect one server and drop its connection entry. Idempotent.
    pub async fn disconnect_server(&self, server_id: &str) -> Result<(), McpError> {
        let _guard = self.lock_server(server_id).await;
        if self.config(server_id).is_none() && self.connection(server_id).is_none() {
            return Err(McpError::ServerNotFound {
                server_id: server_id.to_string(),
            });
        }
        self.disconnect_locked(server_id).await;
        Ok(())
    }

    async fn disconnect_locked(&self, server_id: &str) {
        let existing = self
            .connections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(server_id);
        if let Some(connection) = existing {
            connection.disconnect().await;
        }
    }

    /// Connect every enabled server concurrently.
    pub async fn connect_all(&self) -> BulkErrors {
        let ids: Vec<String> = self
            .configs()
            .into_values()
            .filter(|c| c.enabled)
            .map(|c| c.server_id)
            .collect();

        let results = join_all(ids.iter().map(|id| self.connect_server(id))).await;

        let errors: BulkErrors = ids
            .into_iter()
            .zip(results)
            .filter_map(|(id, r)| r.err().map(|e| (id, e)))
            .collect();
        for (id, e) in &errors {
            tracing::warn!(server = %id, error = %e, "server failed to connect");
        }
        errors
    }

    /// Disconnect every server that has a connection entry.
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();

        join_all(ids.iter().map(|id| async move {
            let _guard = self.lock_server(id).await;
            self.disconnect_locked(id).await;
        }))
        .await;
    }

    /// Disconnect everything, re-read the registry and reconnect.
    pub async fn reload(&self) -> Result<BulkErrors, McpError> {
        tracing::info!(path = %self.registry.path().display(), "reloading server registry");
        self.disconnect_all().await;
        let configs = {
            let _registry = self.registry_lock.lock().await;
            self.registry.load()?
        };
        self.commit_configs(configs);
        Ok(self.connect_all().await)
    }

    /// Tear down every connection. Call before the process exits.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down all servers");
        self.disconnect_all().await;
    }

    // ─── Registry Mutations ──────────────────────────────────────────────────

    /// Persist a new server and connect it if enabled.
    ///
    /// A failed follow-up connect is reported through status, not here.
    pub async fn add_server(&self, config: ServerConfig) -> Result<(), McpError> {
        let server_id = config.server_id.clone();
        let _guard = self.lock_server(&server_id).await;
        {
            let _registry = self.registry_lock.lock().await;
            let next = self.registry.add(&self.configs(), config)?;
            self.commit_configs(next);
        }
        tracing::info!(server = %server_id, "server added");

        if self.config(&server_id).is_some_and(|c| c.enabled) {
            if let Err(e) = self.connect_locked(&server_id).await {
                tracing::warn!(server = %server_id, error = %e, "added server failed to connect");
            }
        }
        Ok(())
    }

    /// Replace a server's config, then reconnect it if enabled.
    pub async fn update_server(&self, server_id: &str, config: ServerConfig) -> Result<(), McpError> {
        let _guard = self.lock_server(server_id).await;
        {
            let _registry = self.registry_lock.lock().await;
            let next = self.registry.update(&self.configs(), server_id, config)?;
            self.commit_configs(next);
        }
        tracing::info!(server = %server_id, "server updated");

        self.disconnect_locked(server_id).await;
        if self.config(server_id).is_some_and(|c| c.enabled) {
            if let Err(e) = self.connect_locked(server_id).await {
                tracing::warn!(server = %server_id, error = %e, "updated server failed to connect");
            }
        }
        Ok(())
    }

    /// Disconnect and delete a server. `Ok(false)` if it did not exist.
    pub async fn remove_server(&self, server_id: &str) -> Result<bool, McpError> {
        let guard = self.lock_server(server_id).await;
        let removed = self.remove_locked(server_id).await;
        self.release_server_lock(server_id, guard);
        removed
    }

    async fn remove_locked(&self, server_id: &str) -> Result<bool, McpError> {
        if self.config(server_id).is_none() {
            return Ok(false);
        }

        self.disconnect_locked(server_id).await;
        {
            let _registry = self.registry_lock.lock().await;
            match self.registry.remove(&self.configs(), server_id)? {
                Some(next) => self.commit_configs(next),
                None => return Ok(false),
            }
        }
        self.reset_reconnect_attempts(server_id);
        tracing::info!(server = %server_id, "server removed");
        Ok(true)
    }

    // ─── Aggregated Catalog ──────────────────────────────────────────────────

    /// Tools of every connected server, in routing order.
    pub fn get_all_tools(&self) -> Vec<ToolDescriptor> {
        self.connected()
            .flat_map(|c| c.catalog().tools().to_vec())
            .collect()
    }

    pub fn get_all_resources(&self) -> Vec<ResourceDescriptor> {
        self.connected()
            .flat_map(|c| c.catalog().resources().to_vec())
            .collect()
    }

    pub fn get_all_prompts(&self) -> Vec<PromptDescriptor> {
        self.connected()
            .flat_map(|c| c.catalog().prompts().to_vec())
            .collect()
    }

    // ─── Routing ─────────────────────────────────────────────────────────────

    /// The connected connection for a pinned server id.
    fn pinned(&self, server_id: &str) -> Result<Arc<Connection>, McpError> {
        match self.connection(server_id) {
            // A server found dead is handed on so the call reports the exit.
            Some(c) if c.is_connected() || c.has_lost_peer() => Ok(c),
            Some(_) => Err(McpError::NotConnected {
                server_id: server_id.to_string(),
            }),
            None if self.config(server_id).is_some() => Err(McpError::NotConnected {
                server_id: server_id.to_string(),
            }),
            None => Err(McpError::ServerNotFound {
                server_id: server_id.to_string(),
            }),
        }
    }

    /// Pinned server if given, else the first connected server matching.
    fn route(
        &self,
        server_id: Option<&str>,
        matches: impl Fn(&Connection) -> bool,
        not_found: impl FnOnce() -> McpError,
    ) -> Result<Arc<Connection>, McpError> {
        match server_id {
            Some(id) => self.pinned(id),
            None => self
                .connected()
                .find(|c| matches(c.as_ref()))
                .ok_or_else(not_found),
        }
    }

    /// Invoke a tool, pinned to `server_id` or routed by first match.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        server_id: Option<&str>,
    ) -> Result<Routed<CallToolResult>, McpError> {
        let connection = self.route(
            server_id,
            |c| c.catalog().has_tool(name),
            || McpError::UnknownTool {
                name: name.to_string(),
            },
        )?;
        let result = connection.call_tool(name, arguments).await?;
        Ok(Routed {
            server_id: connection.server_id().to_string(),
            result,
        })
    }

    /// Like [`call_tool`](Self::call_tool) with an explicit timeout.
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        server_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Routed<CallToolResult>, McpError> {
        let connection = self.route(
            server_id,
            |c| c.catalog().has_tool(name),
            || McpError::UnknownTool {
                name: name.to_string(),
            },
        )?;
        let result = connection
            .call_tool_with_timeout(name, arguments, timeout)
            .await?;
        Ok(Routed {
            server_id: connection.server_id().to_string(),
            result,
        })
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        server_id: Option<&str>,
    ) -> Result<Routed<ReadResourceResult>, McpError> {
        let connection = self.route(
            server_id,
            |c| c.catalog().has_resource(uri),
            || McpError::UnknownResource {
                uri: uri.to_string(),
            },
        )?;
        let result = connection.read_resource(uri).await?;
        Ok(Routed {
            server_id: connection.server_id().to_string(),
            result,
        })
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        server_id: Option<&str>,
    ) -> Result<Routed<GetPromptResult>, McpError> {
        let connection = self.route(
            server_id,
            |c| c.catalog().has_prompt(name),
            || McpError::UnknownPrompt {
                name: name.to_string(),
            },
        )?;
        let result = connection.get_prompt(name, arguments).await?;
        Ok(Routed {
            server_id: connection.server_id().to_string(),
            result,
        })
    }

    // ─── Status ──────────────────────────────────────────────────────────────

    /// One row per configured server, connected or not.
    pub fn get_server_status(&self) -> Vec<ServerStatus> {
        self.configs()
            .values()
            .map(|config| self.status_for(config))
            .collect()
    }

    pub fn server_status(&self, server_id: &str) -> Option<ServerStatus> {
        self.config(server_id).map(|config| self.status_for(&config))
    }

    fn status_for(&self, config: &ServerConfig) -> ServerStatus {
        let base = status_without_connection(config);
        match self.connection(&config.server_id) {
            Some(connection) => ServerStatus {
                // Config fields come from the registry, live fields from the connection.
                server_id: base.server_id,
                name: base.name,
                description: base.description,
                transport: base.transport,
                enabled: base.enabled,
                ..connection.status()
            },
            None => base,
        }
    }

    // ─── Reconnect Bookkeeping ───────────────────────────────────────────────

    pub(crate) fn reconnect_attempts(&self, server_id: &str) -> u32 {
        self.reconnect_attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(server_id)
            .copied()
            .unwrap_or(0)
    }

    fn reset_reconnect_attempts(&self, server_id: &str) {
        self.reconnect_attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(server_id);
    }

    /// Servers the supervisor should try to bring back.
    ///
    /// Enabled, opted in, not explicitly disconnected, and currently down.
    pub(crate) fn reconnect_candidates(&self) -> Vec<String> {
        let configs = self.configs();
        self.connection_snapshot()
            .into_iter()
            .filter(|c| {
                let state = c.state().status;
                (state == ConnectionStatus::Error || state == ConnectionStatus::Disconnected)
                    && configs
                        .get(c.server_id())
                        .is_some_and(|cfg| cfg.enabled && cfg.auto_reconnect)
            })
            .map(|c| c.server_id().to_string())
            .collect()
    }

    /// One supervised reconnect attempt. `None` if the server is busy with
    /// another lifecycle operation.
    pub(crate) async fn supervised_reconnect(&self, server_id: &str) -> Option<Result<(), McpError>> {
        let Ok(_guard) = self.server_lock(server_id).try_lock_owned() else {
            return None;
        };
        // Re-check under the lock: an explicit disconnect may have raced us.
        let still_down = self
            .connection(server_id)
            .is_some_and(|c| !c.is_connected() && c.state().status != ConnectionStatus::Connecting);
        if !still_down {
            return None;
        }

        {
            let mut attempts = self.reconnect_attempts.lock().unwrap_or_else(|e| e.into_inner());
            *attempts.entry(server_id.to_string()).or_insert(0) += 1;
        }
        let result = self.connect_locked(server_id).await;
        if result.is_ok() {
            self.reset_reconnect_attempts(server_id);
        }
        Some(result)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
