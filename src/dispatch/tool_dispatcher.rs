//! ToolDispatcher — the boundary between LLM tool calls and tool servers.
//!
//! Exposes the aggregated catalog as a flat list of globally named tools and
//! turns an inbound `(name, arguments)` call into a [`ToolEnvelope`]. Nothing
//! escapes this boundary as an error or a panic: every outcome, including a
//! server that vanished between listing and call, becomes an envelope the
//! conversation layer can render.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::mcp_client::protocol::CallToolResult;
use crate::mcp_client::{ClientManager, ErrorKind, McpError, Routed};

use super::tool_names::{ToolRef, DEFAULT_PREFIX};

// ─── Types ───────────────────────────────────────────────────────────────────

/// A tool as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmTool {
    /// Composite, globally unique name.
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub server_id: String,
    pub tool_name: String,
}

/// Normalized outcome of one tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// The server that handled (or was asked to handle) the call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub tool_name: String,
    pub execution_time_ms: u64,
}

impl ToolEnvelope {
    fn failure(
        error: impl Into<String>,
        error_kind: Option<ErrorKind>,
        server_id: Option<String>,
        tool_name: impl Into<String>,
        started: Instant,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            error_kind,
            server_id,
            tool_name: tool_name.into(),
            execution_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

// ─── ToolDispatcher ──────────────────────────────────────────────────────────

pub struct ToolDispatcher {
    manager: Arc<ClientManager>,
    prefix: String,
    call_timeout: Option<Duration>,
}

impl ToolDispatcher {
    pub fn new(manager: Arc<ClientManager>) -> Self {
        Self {
            manager,
            prefix: DEFAULT_PREFIX.to_string(),
            call_timeout: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Cap every call at `timeout` instead of the per-server timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn manager(&self) -> &Arc<ClientManager> {
        &self.manager
    }

    /// The aggregated tool catalog under composite names.
    pub fn list_tools(&self) -> Vec<LlmTool> {
        self.manager
            .get_all_tools()
            .into_iter()
            .map(|t| LlmTool {
                name: ToolRef::new(&t.server_id, &t.name).encode(&self.prefix),
                description: t.description,
                parameters: t.input_schema,
                server_id: t.server_id,
                tool_name: t.name,
            })
            .collect()
    }

    /// Tool list in OpenAI function-calling format.
    pub fn to_openai_tools(&self) -> Vec<Value> {
        self.list_tools()
            .into_iter()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect()
    }

    pub fn resolve(&self, name: &str) -> Result<ToolRef, McpError> {
        ToolRef::parse(&self.prefix, name)
    }

    /// Invoke a tool by composite name.
    pub async fn invoke(&self, name: &str, arguments: Value) -> ToolEnvelope {
        let started = Instant::now();
        match self.resolve(name) {
            Ok(tool) => self.invoke_ref(&tool, arguments).await,
            Err(e) => {
                tracing::warn!(tool = name, "unrecognized tool name");
                ToolEnvelope::failure(e.to_string(), Some(e.kind()), None, name, started)
            }
        }
    }

    /// Invoke a tool on a known server.
    pub async fn invoke_ref(&self, tool: &ToolRef, arguments: Value) -> ToolEnvelope {
        let started = Instant::now();
        let call_id = uuid::Uuid::new_v4();
        tracing::debug!(%call_id, server = %tool.server_id, tool = %tool.tool_name, "dispatching tool call");

        let call = async {
            match self.call_timeout {
                Some(timeout) => {
                    self.manager
                        .call_tool_with_timeout(
                            &tool.tool_name,
                            arguments,
                            Some(&tool.server_id),
                            timeout,
                        )
                        .await
                }
                None => {
                    self.manager
                        .call_tool(&tool.tool_name, arguments, Some(&tool.server_id))
                        .await
                }
            }
        };

        let outcome = AssertUnwindSafe(call).catch_unwind().await;
        let envelope = match outcome {
            Ok(Ok(routed)) => self.normalize(routed, &tool.tool_name, started),
            Ok(Err(e)) => ToolEnvelope::failure(
                e.to_string(),
                Some(e.kind()),
                Some(tool.server_id.clone()),
                &tool.tool_name,
                started,
            ),
            Err(panic) => ToolEnvelope::failure(
                format!("tool call panicked: {}", panic_message(panic.as_ref())),
                None,
                Some(tool.server_id.clone()),
                &tool.tool_name,
                started,
            ),
        };

        if envelope.success {
            tracing::info!(
                %call_id,
                server = %tool.server_id,
                tool = %tool.tool_name,
                elapsed_ms = envelope.execution_time_ms,
                "tool call succeeded"
            );
        } else {
            tracing::warn!(
                %call_id,
                server = %tool.server_id,
                tool = %tool.tool_name,
                elapsed_ms = envelope.execution_time_ms,
                error = envelope.error.as_deref().unwrap_or_default(),
                "tool call failed"
            );
        }
        envelope
    }

    fn normalize(&self, routed: Routed<CallToolResult>, tool_name: &str, started: Instant) -> ToolEnvelope {
        let execution_time_ms = started.elapsed().as_millis() as u64;
        let is_error = routed.result.is_error;
        let text = routed.result.text();
        let result = serde_json::to_value(&routed.result).ok();

        if is_error {
            let error = if text.is_empty() {
                "tool reported an error".to_string()
            } else {
                text
            };
            return ToolEnvelope {
                success: false,
                result,
                error: Some(error),
                error_kind: None,
                server_id: Some(routed.server_id),
                tool_name: tool_name.to_string(),
                execution_time_ms,
            };
        }

        ToolEnvelope {
            success: true,
            result,
            error: None,
            error_kind: None,
            server_id: Some(routed.server_id),
            tool_name: tool_name.to_string(),
            execution_time_ms,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
