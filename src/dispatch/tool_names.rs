//! Globally unique tool names for the LLM-facing tool list.
//!
//! A tool is exposed as `<prefix>_<server>_<tool>`, where `<server>` is the
//! server id with `-` written as `--` and `_` written as `-u`. The escaped
//! server part never contains a bare `_`, so the first `_` after the prefix
//! always ends it and the tool name is the untouched remainder, even when
//! the tool name itself contains underscores.

use std::fmt;

use crate::mcp_client::McpError;

/// Default prefix for composite tool names.
pub const DEFAULT_PREFIX: &str = "mcp";

/// A tool addressed by owning server and local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolRef {
    pub server_id: String,
    pub tool_name: String,
}

impl ToolRef {
    pub fn new(server_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            tool_name: tool_name.into(),
        }
    }

    /// `<prefix>_<escaped server>_<tool>`.
    pub fn encode(&self, prefix: &str) -> String {
        format!("{prefix}_{}_{}", escape_server_id(&self.server_id), self.tool_name)
    }

    /// Inverse of [`encode`](Self::encode).
    ///
    /// Fails with [`McpError::UnknownTool`] when `name` does not carry the
    /// prefix or is otherwise not a composite name.
    pub fn parse(prefix: &str, name: &str) -> Result<Self, McpError> {
        let malformed = || McpError::UnknownTool {
            name: name.to_string(),
        };

        let rest = name
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('_'))
            .ok_or_else(malformed)?;

        let mut server_id = String::new();
        let mut chars = rest.char_indices();
        while let Some((idx, ch)) = chars.next() {
            match ch {
                '_' => {
                    let tool_name = &rest[idx + 1..];
                    if server_id.is_empty() || tool_name.is_empty() {
                        return Err(malformed());
                    }
                    return Ok(Self::new(server_id, tool_name));
                }
                '-' => match chars.next() {
                    Some((_, '-')) => server_id.push('-'),
                    Some((_, 'u')) => server_id.push('_'),
                    _ => return Err(malformed()),
                },
                other => server_id.push(other),
            }
        }
        Err(malformed())
    }
}

impl fmt::Display for ToolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_id, self.tool_name)
    }
}

fn escape_server_id(server_id: &str) -> String {
    let mut out = String::with_capacity(server_id.len() + 4);
    for ch in server_id.chars() {
        match ch {
            '-' => out.push_str("--"),
            '_' => out.push_str("-u"),
            other => out.push(other),
        }
    }
    out
}
