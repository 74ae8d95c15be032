//! Application settings loading.
//!
//! Reads `settings.yaml` from `MCP_HUB_SETTINGS` or the data directory and
//! resolves environment variables. A missing file yields the defaults.
//!
//! ```yaml
//! registry_path: ${MCP_HUB_REGISTRY:-~/.config/mcp-hub/mcp_servers.json}
//! tool_prefix: mcp
//! call_timeout_secs: 60
//! log_filter: mcp_hub=debug,warn
//! log_dir: ~/.local/state/mcp-hub
//! auto_reconnect: true
//! supervisor:
//!   interval_secs: 10
//!   max_attempts: 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::dispatch::DEFAULT_PREFIX;
use crate::mcp_client::{ServerRegistry, SupervisorConfig};

/// Env var pointing at an explicit settings file.
pub const SETTINGS_ENV: &str = "MCP_HUB_SETTINGS";

/// Default log filter when neither `RUST_LOG` nor settings provide one.
pub const DEFAULT_LOG_FILTER: &str = "mcp_hub=info,warn";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

// ─── HubSettings ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Server registry location. Defaults to `<data dir>/mcp_servers.json`.
    pub registry_path: Option<String>,
    /// Prefix of composite tool names shown to the model.
    pub tool_prefix: String,
    /// Overrides every server's own timeout for tool calls.
    pub call_timeout_secs: Option<u64>,
    pub log_filter: String,
    /// Write logs to `<log_dir>/mcp-hub.log` instead of stderr.
    pub log_dir: Option<String>,
    /// Start the reconnect supervisor.
    pub auto_reconnect: bool,
    pub supervisor: SupervisorConfig,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            registry_path: None,
            tool_prefix: DEFAULT_PREFIX.to_string(),
            call_timeout_secs: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_dir: None,
            auto_reconnect: false,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl HubSettings {
    /// `MCP_HUB_SETTINGS`, else `<data dir>/settings.yaml`.
    pub fn default_path() -> PathBuf {
        match std::env::var(SETTINGS_ENV) {
            Ok(p) if !p.trim().is_empty() => PathBuf::from(expand_tilde(&p)),
            _ => crate::data_dir().join("settings.yaml"),
        }
    }

    /// Load and parse a settings file. A missing file means defaults.
    ///
    /// Performs environment-variable interpolation on the raw text before
    /// parsing, so `${VAR}` works in any value.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|e| SettingsError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::parse(&raw).map_err(|reason| SettingsError::Parse {
            path: path.display().to_string(),
            reason,
        })
    }

    fn parse(raw: &str) -> Result<Self, String> {
        let interpolated = interpolate_env_vars(raw);
        if interpolated.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&interpolated).map_err(|e| e.to_string())
    }

    pub fn registry_path(&self) -> PathBuf {
        match &self.registry_path {
            Some(p) if !p.trim().is_empty() => PathBuf::from(expand_tilde(p)),
            _ => ServerRegistry::default_path(),
        }
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(|s| Duration::from_secs(s.max(1)))
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log_dir
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .map(|d| PathBuf::from(expand_tilde(d)))
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
///
/// Unset variables without a default become empty. Server `env` values go
/// through this at spawn time.
pub fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => match std::env::var(var_name) {
            Ok(v) if !v.is_empty() => v,
            _ => expand_tilde(default),
        },
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__MCP_HUB_TEST_UNSET__");
        let result = interpolate_env_vars("${__MCP_HUB_TEST_UNSET__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__MCP_HUB_TEST_SET__", "/custom/path");
        let result = interpolate_env_vars("prefix ${__MCP_HUB_TEST_SET__:-/fallback} suffix");
        assert_eq!(result, "prefix /custom/path suffix");
        std::env::remove_var("__MCP_HUB_TEST_SET__");
    }

    #[test]
    fn test_interpolate_unset_without_default_is_empty() {
        std::env::remove_var("__MCP_HUB_TEST_MISSING__");
        assert_eq!(interpolate_env_vars("a${__MCP_HUB_TEST_MISSING__}b"), "ab");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with $dollar but no braces";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/logs");
        assert!(!expanded.starts_with('~'));
        assert!(expanded.ends_with("/logs"));
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = HubSettings::load(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(settings, HubSettings::default());
        assert_eq!(settings.tool_prefix, "mcp");
        assert!(settings.call_timeout().is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(
            &path,
            "tool_prefix: tools\ncall_timeout_secs: 5\nsupervisor:\n  max_attempts: 9\n",
        )
        .unwrap();
        let settings = HubSettings::load(&path).unwrap();
        assert_eq!(settings.tool_prefix, "tools");
        assert_eq!(settings.call_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(settings.supervisor.max_attempts, 9);
        assert_eq!(settings.log_filter, DEFAULT_LOG_FILTER);
        assert!(!settings.auto_reconnect);
    }

    #[test]
    fn test_registry_path_from_env() {
        std::env::set_var("__MCP_HUB_TEST_REG__", "/tmp/custom/servers.json");
        let settings = HubSettings::parse("registry_path: ${__MCP_HUB_TEST_REG__}").unwrap();
        assert_eq!(
            settings.registry_path(),
            PathBuf::from("/tmp/custom/servers.json")
        );
        std::env::remove_var("__MCP_HUB_TEST_REG__");
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "tool_prefix: [unclosed").unwrap();
        assert!(matches!(
            HubSettings::load(&path),
            Err(SettingsError::Parse { .. })
        ));
    }
}
