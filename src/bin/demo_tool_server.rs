//! Minimal stdio MCP server used by the integration tests and for manual
//! experiments (`mcp-hub` can register it like any other server).
//!
//! Environment:
//! - `DEMO_SERVER_NAME`: reported in `serverInfo` and in tool output (default `demo`)
//! - `DEMO_PAGE_SIZE`: split `tools/list` into pages of this size
//! - `DEMO_NOISY=1`: emit a log line and a notification before every response
//!
//! Tools: `echo`, `search`, `slow`, `fail`, `crash`, `ping_client`, `pid`.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use serde_json::{json, Value};

struct Server {
    name: String,
    page_size: usize,
    noisy: bool,
}

fn tools() -> Vec<Value> {
    let object = |props: Value| json!({"type": "object", "properties": props});
    vec![
        json!({"name": "echo", "description": "Echo the message back",
               "inputSchema": object(json!({"message": {"type": "string"}}))}),
        json!({"name": "search", "description": "Pretend to search",
               "inputSchema": object(json!({"query": {"type": "string"}}))}),
        json!({"name": "slow", "description": "Sleep before answering",
               "inputSchema": object(json!({"ms": {"type": "integer"}}))}),
        json!({"name": "fail", "description": "Always reports a tool error",
               "inputSchema": object(json!({}))}),
        json!({"name": "crash", "description": "Exit without answering",
               "inputSchema": object(json!({}))}),
        json!({"name": "ping_client", "description": "Ping the client before answering",
               "inputSchema": object(json!({}))}),
        json!({"name": "pid", "description": "Report the server's process id",
               "inputSchema": object(json!({}))}),
    ]
}

fn text_result(text: impl Into<String>, is_error: bool) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}], "isError": is_error})
}

impl Server {
    fn from_env() -> Self {
        Self {
            name: std::env::var("DEMO_SERVER_NAME").unwrap_or_else(|_| "demo".into()),
            page_size: std::env::var("DEMO_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            noisy: std::env::var("DEMO_NOISY").is_ok_and(|v| v == "1"),
        }
    }

    fn list_tools(&self, params: &Value) -> Value {
        let all = tools();
        if self.page_size == 0 {
            return json!({"tools": all});
        }
        let start: usize = params
            .get("cursor")
            .and_then(Value::as_str)
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let end = (start + self.page_size).min(all.len());
        let page: Vec<Value> = all[start.min(end)..end].to_vec();
        if end < all.len() {
            json!({"tools": page, "nextCursor": end.to_string()})
        } else {
            json!({"tools": page})
        }
    }

    fn call_tool<R: BufRead, W: Write>(
        &self,
        params: &Value,
        input: &mut R,
        out: &mut W,
    ) -> io::Result<Result<Value, (i64, String)>> {
        let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

        let result = match name {
            "echo" => text_result(arg("message"), false),
            "search" => text_result(format!("{} results for '{}'", self.name, arg("query")), false),
            "slow" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(1000);
                std::thread::sleep(Duration::from_millis(ms));
                text_result(format!("slept {ms}ms"), false)
            }
            "fail" => text_result("the tool failed on purpose", true),
            "crash" => std::process::exit(3),
            "pid" => text_result(std::process::id().to_string(), false),
            "ping_client" => {
                send(out, &json!({"jsonrpc": "2.0", "id": "srv-ping", "method": "ping"}))?;
                let mut line = String::new();
                input.read_line(&mut line)?;
                let reply: Value = serde_json::from_str(line.trim()).unwrap_or(Value::Null);
                let ok = reply.get("id") == Some(&json!("srv-ping")) && reply.get("result").is_some();
                text_result(if ok { "pong received" } else { "no pong" }, !ok)
            }
            other => return Ok(Err((-32602, format!("unknown tool: {other}")))),
        };
        Ok(Ok(result))
    }

    fn handle<R: BufRead, W: Write>(
        &self,
        method: &str,
        params: &Value,
        input: &mut R,
        out: &mut W,
    ) -> io::Result<Result<Value, (i64, String)>> {
        let result = match method {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
                "serverInfo": {"name": self.name, "version": env!("CARGO_PKG_VERSION")}
            }),
            "tools/list" => self.list_tools(params),
            "tools/call" => return self.call_tool(params, input, out),
            "resources/list" => json!({"resources": [{
                "uri": format!("demo://{}/readme", self.name),
                "name": "readme",
                "mimeType": "text/plain"
            }]}),
            "resources/read" => {
                let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
                json!({"contents": [{"uri": uri, "mimeType": "text/plain",
                                     "text": format!("hello from {}", self.name)}]})
            }
            "prompts/list" => json!({"prompts": [{
                "name": "greet",
                "description": "Greet someone",
                "arguments": [{"name": "who", "required": true}]
            }]}),
            "prompts/get" => {
                let who = params
                    .pointer("/arguments/who")
                    .and_then(Value::as_str)
                    .unwrap_or("world");
                json!({"description": "Greet someone", "messages": [{
                    "role": "user",
                    "content": {"type": "text", "text": format!("Say hello to {who}")}
                }]})
            }
            other => return Ok(Err((-32601, format!("Method not found: {other}")))),
        };
        Ok(Ok(result))
    }
}

fn send<W: Write>(out: &mut W, message: &Value) -> io::Result<()> {
    writeln!(out, "{message}")?;
    out.flush()
}

fn main() -> io::Result<()> {
    let server = Server::from_env();
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    eprintln!("{} demo server ready", server.name);

    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let Ok(message) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        // Notifications get no reply.
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

        if server.noisy {
            writeln!(out, "[{}] handling {method}", server.name)?;
            send(&mut out, &json!({"jsonrpc": "2.0", "method": "notifications/message",
                                   "params": {"level": "info", "data": method}}))?;
        }

        let reply = match server.handle(method, &params, &mut input, &mut out)? {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, msg)) => json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": msg}}),
        };
        send(&mut out, &reply)?;
    }
}
