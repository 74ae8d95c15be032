//! JSON-RPC 2.0 envelopes and typed MCP method shapes.
//!
//! Outgoing requests are a [`ClientRequest`] tagged by method name; each
//! variant carries its own params type. Result types keep unknown fields in
//! a flattened `extra` map so peer extensions survive a round trip.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::McpError;

/// Protocol revision sent in the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client identity sent in the handshake.
pub const CLIENT_NAME: &str = "mcp-hub";

const JSONRPC_VERSION: &str = "2.0";

// ─── Requests ────────────────────────────────────────────────────────────────

/// A client → server request, keyed by method.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "params")]
pub enum ClientRequest {
    #[serde(rename = "initialize")]
    Initialize(InitializeParams),
    #[serde(rename = "tools/list")]
    ListTools(PageParams),
    #[serde(rename = "resources/list")]
    ListResources(PageParams),
    #[serde(rename = "prompts/list")]
    ListPrompts(PageParams),
    #[serde(rename = "tools/call")]
    CallTool(CallToolParams),
    #[serde(rename = "resources/read")]
    ReadResource(ReadResourceParams),
    #[serde(rename = "prompts/get")]
    GetPrompt(GetPromptParams),
}

impl ClientRequest {
    /// The JSON-RPC method name.
    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::Initialize(_) => "initialize",
            ClientRequest::ListTools(_) => "tools/list",
            ClientRequest::ListResources(_) => "resources/list",
            ClientRequest::ListPrompts(_) => "prompts/list",
            ClientRequest::CallTool(_) => "tools/call",
            ClientRequest::ReadResource(_) => "resources/read",
            ClientRequest::GetPrompt(_) => "prompts/get",
        }
    }
}

/// A client → server notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "params")]
pub enum ClientNotification {
    #[serde(rename = "notifications/initialized")]
    Initialized,
}

impl ClientNotification {
    pub fn method(&self) -> &'static str {
        match self {
            ClientNotification::Initialized => "notifications/initialized",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo {
                name: CLIENT_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Params for the `*/list` methods.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PageParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadResourceParams {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetPromptParams {
    pub name: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub arguments: Map<String, Value>,
}

// ─── Envelopes ───────────────────────────────────────────────────────────────

/// JSON-RPC request envelope wrapping a typed request.
#[derive(Debug, Serialize)]
pub struct RequestEnvelope<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    #[serde(flatten)]
    pub request: &'a ClientRequest,
}

impl<'a> RequestEnvelope<'a> {
    pub fn new(id: u64, request: &'a ClientRequest) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            request,
        }
    }
}

/// JSON-RPC notification envelope.
#[derive(Debug, Serialize)]
pub struct NotificationEnvelope<'a> {
    pub jsonrpc: &'static str,
    #[serde(flatten)]
    pub notification: &'a ClientNotification,
}

impl<'a> NotificationEnvelope<'a> {
    pub fn new(notification: &'a ClientNotification) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            notification,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any message a peer may send: a response, a request, or a notification.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// How an incoming message should be treated.
#[derive(Debug, PartialEq)]
pub enum MessageKind {
    /// A response correlated by numeric id.
    Response(u64),
    /// A server-initiated request that expects an answer.
    Request,
    /// A one-way notification.
    Notification,
    /// Neither shape (missing id and method, or a non-numeric response id).
    Unknown,
}

impl IncomingMessage {
    pub fn kind(&self) -> MessageKind {
        match (&self.method, &self.id) {
            (Some(_), Some(_)) => MessageKind::Request,
            (Some(_), None) => MessageKind::Notification,
            (None, Some(id)) => match id.as_u64() {
                Some(n) => MessageKind::Response(n),
                None => MessageKind::Unknown,
            },
            (None, None) => MessageKind::Unknown,
        }
    }

    /// Convert a response into its `result`, mapping an `error` member to
    /// [`McpError::ServerError`].
    pub fn into_result(self) -> Result<Value, McpError> {
        if let Some(err) = self.error {
            return Err(McpError::ServerError {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }

        self.result.ok_or(McpError::ServerError {
            code: error_codes::INTERNAL_ERROR,
            message: "response missing both result and error".into(),
            data: None,
        })
    }
}

/// Build the reply to a server-initiated request.
///
/// `ping` gets an empty result; anything else is answered with
/// method-not-found, since this client exposes no server-side features.
pub fn reply_to_peer_request(id: &Value, method: &str) -> Value {
    if method == "ping" {
        serde_json::json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": {} })
    } else {
        serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("method '{method}' is not supported by this client"),
            }
        })
    }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// `initialize` result.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Map<String, Value>,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InitializeResult {
    /// Whether the server advertised a capability category (`tools`, …).
    pub fn advertises(&self, category: &str) -> bool {
        self.capabilities.contains_key(category)
    }
}

/// Server identity returned in the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A resource as advertised by `resources/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A prompt as advertised by `prompts/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResult {
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPromptsResult {
    #[serde(default)]
    pub prompts: Vec<Prompt>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// `tools/call` result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallToolResult {
    /// Concatenate the `text` items of the content list.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// `resources/read` result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadResourceResult {
    #[serde(default)]
    pub contents: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `prompts/get` result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPromptResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Decode a result value into its typed shape.
pub fn decode_result<T: serde::de::DeserializeOwned>(
    server: &str,
    method: &str,
    value: Value,
) -> Result<T, McpError> {
    serde_json::from_value(value).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("malformed '{method}' result: {e}"),
    })
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_envelope_serialization() {
        let req = ClientRequest::Initialize(InitializeParams::default());
        let json = serde_json::to_value(RequestEnvelope::new(1, &req)).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "initialize");
        assert_eq!(json["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(json["params"]["clientInfo"]["name"], CLIENT_NAME);
    }

    #[test]
    fn test_call_tool_envelope() {
        let req = ClientRequest::CallTool(CallToolParams {
            name: "search".into(),
            arguments: serde_json::json!({"q": "rust"}),
        });
        let json = serde_json::to_value(RequestEnvelope::new(42, &req)).unwrap();
        assert_eq!(json["method"], "tools/call");
        assert_eq!(json["params"]["name"], "search");
        assert_eq!(json["params"]["arguments"]["q"], "rust");
        assert_eq!(req.method(), "tools/call");
    }

    #[test]
    fn test_list_params_omit_empty_cursor() {
        let req = ClientRequest::ListTools(PageParams::default());
        let json = serde_json::to_string(&RequestEnvelope::new(3, &req)).unwrap();
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(json.contains("\"params\":{}"));
        assert!(!json.contains("cursor"));
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = ClientNotification::Initialized;
        let json = serde_json::to_value(NotificationEnvelope::new(&note)).unwrap();
        assert_eq!(json["method"], "notifications/initialized");
        assert!(json.get("id").is_none());
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_incoming_message_kinds() {
        let resp: IncomingMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#).unwrap();
        assert_eq!(resp.kind(), MessageKind::Response(7));

        let req: IncomingMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"a","method":"ping"}"#).unwrap();
        assert_eq!(req.kind(), MessageKind::Request);

        let note: IncomingMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#,
        )
        .unwrap();
        assert_eq!(note.kind(), MessageKind::Notification);
    }

    #[test]
    fn test_into_result_error_member() {
        let msg: IncomingMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        match msg.into_result().unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_into_result_missing_both() {
        let msg: IncomingMessage = serde_json::from_str(r#"{"jsonrpc":"2.0","id":2}"#).unwrap();
        assert!(matches!(msg.into_result(), Err(McpError::ServerError { .. })));
    }

    #[test]
    fn test_reply_to_ping_and_unknown() {
        let id = serde_json::json!(5);
        let pong = reply_to_peer_request(&id, "ping");
        assert_eq!(pong["id"], 5);
        assert!(pong.get("result").is_some());

        let refused = reply_to_peer_request(&id, "sampling/createMessage");
        assert_eq!(refused["error"]["code"], error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_tool_keeps_unknown_fields() {
        let json = r#"{"name":"search","inputSchema":{"type":"object"},"annotations":{"readOnlyHint":true}}"#;
        let tool: Tool = serde_json::from_str(json).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.description.is_none());
        assert!(tool.extra.contains_key("annotations"));
    }

    #[test]
    fn test_call_tool_result_text() {
        let json = r#"{"content":[{"type":"text","text":"a"},{"type":"image","data":"x"},{"type":"text","text":"b"}],"isError":true}"#;
        let result: CallToolResult = serde_json::from_str(json).unwrap();
        assert!(result.is_error);
        assert_eq!(result.text(), "a\nb");
    }

    #[test]
    fn test_initialize_result_capabilities() {
        let json = r#"{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"demo","version":"1.0"}}"#;
        let init: InitializeResult = serde_json::from_str(json).unwrap();
        assert!(init.advertises("tools"));
        assert!(!init.advertises("prompts"));
        assert_eq!(init.server_info.unwrap().name.as_deref(), Some("demo"));
    }
}
