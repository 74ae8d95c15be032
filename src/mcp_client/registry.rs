//! Server registry — durable store of server configurations.
//!
//! The registry is a versioned JSON document:
//!
//! ```json
//! { "version": 1, "servers": [ { "server_id": "fs", "type": "stdio", ... } ] }
//! ```
//!
//! Mutations are computed on a copy of the in-memory map, written to disk
//! (tmp file + rename), and only then handed back to the caller to commit.
//! A failed save therefore never leaves memory ahead of what is on disk.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::McpError;
use super::types::ServerConfig;

/// Current document version.
pub const REGISTRY_VERSION: u32 = 1;

/// File name inside the data directory.
pub const REGISTRY_FILE: &str = "mcp_servers.json";

/// Configs keyed by `server_id`. Iteration order is the routing order.
pub type ConfigMap = BTreeMap<String, ServerConfig>;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryDocument<T> {
    version: u32,
    #[serde(default = "Vec::new")]
    servers: Vec<T>,
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerRegistry {
    path: PathBuf,
}

impl ServerRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/mcp_servers.json`.
    pub fn default_path() -> PathBuf {
        crate::data_dir().join(REGISTRY_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted set.
    ///
    /// A missing file is seeded with disabled example entries and saved.
    /// Invalid or repeated entries are skipped with a warning. A document
    /// that is not JSON is an error; it is never overwritten.
    pub fn load(&self) -> Result<ConfigMap, McpError> {
        if !self.path.exists() {
            let defaults = default_servers();
            tracing::info!(
                path = %self.path.display(),
                count = defaults.len(),
                "no server registry found, writing defaults"
            );
            self.save(&defaults)?;
            return Ok(defaults);
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        let doc: RegistryDocument<Value> =
            serde_json::from_str(&content).map_err(|e| McpError::Persistence {
                path: self.path.display().to_string(),
                reason: format!("malformed registry: {e}"),
            })?;

        if doc.version > REGISTRY_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                version = doc.version,
                supported = REGISTRY_VERSION,
                "registry written by a newer version, loading best-effort"
            );
        }

        let mut configs = ConfigMap::new();
        for (index, raw) in doc.servers.into_iter().enumerate() {
            let config: ServerConfig = match serde_json::from_value(raw) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(index, error = %e, "skipping unreadable server entry");
                    continue;
                }
            };
            if let Err(e) = config.validate() {
                tracing::warn!(server = %config.server_id, error = %e, "skipping invalid server entry");
                continue;
            }
            if configs.contains_key(&config.server_id) {
                tracing::warn!(server = %config.server_id, "skipping duplicate server entry");
                continue;
            }
            configs.insert(config.server_id.clone(), config);
        }

        tracing::debug!(path = %self.path.display(), count = configs.len(), "loaded server registry");
        Ok(configs)
    }

    /// Write the full set atomically.
    pub fn save(&self, configs: &ConfigMap) -> Result<(), McpError> {
        let doc = RegistryDocument {
            version: REGISTRY_VERSION,
            servers: configs.values().collect::<Vec<_>>(),
        };
        let content = serde_json::to_string_pretty(&doc).map_err(|e| McpError::Persistence {
            path: self.path.display().to_string(),
            reason: format!("failed to serialize registry: {e}"),
        })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        // Write to temp file, then rename for atomicity
        let tmp_path = self.path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &self.path)
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(self.io_error(e));
        }

        tracing::debug!(path = %self.path.display(), count = configs.len(), "saved server registry");
        Ok(())
    }

    // ─── Mutations ───────────────────────────────────────────────────────────

    /// Persist `current` plus `config` and return the new map.
    pub fn add(&self, current: &ConfigMap, config: ServerConfig) -> Result<ConfigMap, McpError> {
        config.validate()?;
        if current.contains_key(&config.server_id) {
            return Err(McpError::DuplicateServer {
                server_id: config.server_id,
            });
        }
        let mut next = current.clone();
        next.insert(config.server_id.clone(), config);
        self.save(&next)?;
        Ok(next)
    }

    /// Persist `current` with `server_id` replaced by `config`.
    ///
    /// The id itself cannot change.
    pub fn update(
        &self,
        current: &ConfigMap,
        server_id: &str,
        config: ServerConfig,
    ) -> Result<ConfigMap, McpError> {
        if !current.contains_key(server_id) {
            return Err(McpError::ServerNotFound {
                server_id: server_id.to_string(),
            });
        }
        if config.server_id != server_id {
            return Err(McpError::InvalidConfig {
                server_id: server_id.to_string(),
                reason: format!("server_id is immutable (got '{}')", config.server_id),
            });
        }
        config.validate()?;
        let mut next = current.clone();
        next.insert(server_id.to_string(), config);
        self.save(&next)?;
        Ok(next)
    }

    /// Persist `current` without `server_id`. `None` if it was not present.
    pub fn remove(&self, current: &ConfigMap, server_id: &str) -> Result<Option<ConfigMap>, McpError> {
        if !current.contains_key(server_id) {
            return Ok(None);
        }
        let mut next = current.clone();
        next.remove(server_id);
        self.save(&next)?;
        Ok(Some(next))
    }

    fn io_error(&self, e: std::io::Error) -> McpError {
        McpError::Persistence {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

/// Disabled example entries written on first run.
pub fn default_servers() -> ConfigMap {
    let examples = [
        ServerConfig::stdio(
            "filesystem",
            "npx",
            vec![
                "-y".into(),
                "@modelcontextprotocol/server-filesystem".into(),
                "${HOME:-.}".into(),
            ],
        )
        .with_description("Read and write files under the home directory"),
        ServerConfig::stdio(
            "fetch",
            "uvx",
            vec!["mcp-server-fetch".into()],
        )
        .with_description("Fetch web pages as markdown"),
        ServerConfig::http("remote-example", "http://localhost:8000")
            .with_description("Example streamable-HTTP server"),
    ];
    examples
        .into_iter()
        .map(|c| (c.server_id.clone(), c))
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
