//! JSON-RPC transports: spawned-process stdio and HTTP POST.
//!
//! stdio framing is one JSON document per line, flushed after every write.
//! A stdio channel carries at most one request at a time: the channel mutex
//! is held from the write of a request until its correlated response is
//! read. HTTP exchanges are independent and may run concurrently.
//!
//! A stdio child is owned by a watcher task that reaps it the moment it
//! exits, so a peer that dies between calls is visible through
//! [`StdioTransport::exit_status`] without any traffic.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex};

use super::errors::McpError;
use super::protocol::{
    reply_to_peer_request, ClientNotification, ClientRequest, IncomingMessage, MessageKind,
    NotificationEnvelope, RequestEnvelope,
};
use super::types::{ServerConfig, TransportKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Number of peer stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Fixed JSON-RPC path appended to an HTTP server's base url.
const HTTP_RPC_PATH: &str = "/mcp";

/// Session header used by streamable-HTTP servers.
const SESSION_HEADER: &str = "mcp-session-id";

/// How long to wait for the watcher to reap a child after a forced kill.
const KILL_WAIT: Duration = Duration::from_secs(2);

// ─── Transport ───────────────────────────────────────────────────────────────

/// A live channel to one server.
pub enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

impl Transport {
    /// Establish the channel described by `config` (spawn or build a client).
    ///
    /// No protocol traffic happens here; the handshake is the caller's job.
    pub async fn open(config: &ServerConfig) -> Result<Self, McpError> {
        match config.transport {
            TransportKind::Stdio => Ok(Transport::Stdio(StdioTransport::spawn(config)?)),
            TransportKind::Http => Ok(Transport::Http(HttpTransport::new(config)?)),
            TransportKind::Websocket => Err(McpError::UnsupportedTransport {
                name: config.server_id.clone(),
                transport: TransportKind::Websocket.to_string(),
            }),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Stdio(_) => TransportKind::Stdio,
            Transport::Http(_) => TransportKind::Http,
        }
    }

    /// Send one request and wait for its correlated response's `result`.
    ///
    /// `timeout` bounds an HTTP exchange end to end. A stdio exchange has no
    /// bound of its own; the caller wraps it.
    pub async fn request(&self, request: &ClientRequest, timeout: Duration) -> Result<Value, McpError> {
        match self {
            Transport::Stdio(t) => t.request(request).await,
            Transport::Http(t) => t.request(request, timeout).await,
        }
    }

    /// Send a one-way notification.
    pub async fn notify(&self, notification: &ClientNotification) -> Result<(), McpError> {
        match self {
            Transport::Stdio(t) => t.notify(notification).await,
            Transport::Http(t) => t.notify(notification).await,
        }
    }

    /// Release the channel. Safe to call more than once.
    pub async fn shutdown(&self, grace: Duration) {
        match self {
            Transport::Stdio(t) => t.shutdown(grace).await,
            Transport::Http(t) => t.shutdown().await,
        }
    }

    /// Exit status of a stdio peer that is no longer running.
    pub fn exit_watch(&self) -> Option<watch::Receiver<Option<String>>> {
        match self {
            Transport::Stdio(t) => Some(t.exit_watch()),
            Transport::Http(_) => None,
        }
    }

    /// Extra context for error messages (captured stderr for stdio).
    pub fn diagnostics(&self) -> String {
        match self {
            Transport::Stdio(t) => t.stderr_tail(),
            Transport::Http(_) => String::new(),
        }
    }
}

// ─── Command Resolution ──────────────────────────────────────────────────────

/// Resolve a command to an executable path.
///
/// Commands containing a path separator are checked as-is; bare names are
/// searched on `path_var` (the value of `PATH`). Returns `None` when nothing
/// executable is found.
pub fn resolve_command(command: &str, path_var: Option<&str>) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path_var = path_var?;
    for dir in std::env::split_paths(path_var) {
        for name in executable_names(command) {
            let full = dir.join(&name);
            if is_executable(&full) {
                return Some(full);
            }
        }
    }
    None
}

#[cfg(windows)]
fn executable_names(command: &str) -> Vec<String> {
    let mut names = vec![command.to_string()];
    let exts = std::env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    for ext in exts.split(';').filter(|e| !e.is_empty()) {
        names.push(format!("{command}{}", ext.to_ascii_lowercase()));
    }
    names
}

#[cfg(not(windows))]
fn executable_names(command: &str) -> Vec<String> {
    vec![command.to_string()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ─── Stdio ───────────────────────────────────────────────────────────────────

struct StdioChannel {
    /// `None` once stdin has been closed for shutdown.
    writer: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    channel: Mutex<StdioChannel>,
    pid: Option<u32>,
    /// `Some(status)` once the watcher has reaped the child.
    exit: watch::Receiver<Option<String>>,
    /// Asks the watcher to kill the child. Dropping it does the same.
    kill: StdMutex<Option<oneshot::Sender<()>>>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    next_id: AtomicU64,
}

impl StdioTransport {
    /// Resolve the command, spawn the process and wire its pipes.
    pub fn spawn(config: &ServerConfig) -> Result<Self, McpError> {
        let name = config.server_id.as_str();
        let env = resolve_env(&config.env);

        // An env override of PATH also governs where the command is looked up.
        let path_var = env
            .get("PATH")
            .cloned()
            .or_else(|| std::env::var("PATH").ok());
        let program = resolve_command(&config.command, path_var.as_deref()).ok_or_else(|| {
            McpError::CommandNotFound {
                name: name.to_string(),
                command: config.command.clone(),
            }
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(&config.args);
        cmd.envs(&env);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_pump(name.to_string(), stderr, Arc::clone(&stderr_tail));
        }

        let pid = child.id();
        tracing::debug!(
            server = name,
            program = %program.display(),
            pid,
            "spawned stdio server"
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        spawn_exit_watcher(name.to_string(), child, kill_rx, exit_tx);

        Ok(Self {
            server_name: name.to_string(),
            channel: Mutex::new(StdioChannel {
                writer: Some(stdin),
                reader: BufReader::new(stdout),
            }),
            pid,
            exit: exit_rx,
            kill: StdMutex::new(Some(kill_tx)),
            stderr_tail,
            next_id: AtomicU64::new(1),
        })
    }

    /// Send a request and wait for the response with the matching id.
    ///
    /// The channel stays locked for the whole exchange. Peer notifications
    /// and non-JSON lines are skipped; peer requests are answered inline.
    pub async fn request(&self, request: &ClientRequest) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&RequestEnvelope::new(id, request)).map_err(|e| {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize request: {e}"),
            }
        })?;

        let mut channel = self.channel.lock().await;
        self.write_line(&mut channel, &line).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = channel
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| McpError::TransportError {
                    server: self.server_name.clone(),
                    reason: format!("failed to read from stdout: {e}"),
                })?;

            if bytes_read == 0 {
                return Err(McpError::PeerClosed {
                    name: self.server_name.clone(),
                    reason: self.with_stderr("stdout closed (process may have exited)"),
                });
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            let message = match serde_json::from_str::<IncomingMessage>(trimmed) {
                Ok(message) => message,
                Err(_) => {
                    tracing::debug!(server = %self.server_name, line = trimmed, "skipping non-JSON line");
                    continue;
                }
            };

            match message.kind() {
                MessageKind::Response(resp_id) if resp_id == id => return message.into_result(),
                MessageKind::Response(resp_id) => {
                    tracing::warn!(
                        server = %self.server_name,
                        expected = id,
                        got = resp_id,
                        "discarding response for a different request"
                    );
                }
                MessageKind::Request => {
                    let method = message.method.clone().unwrap_or_default();
                    let peer_id = message.id.clone().unwrap_or(Value::Null);
                    tracing::debug!(server = %self.server_name, method = %method, "answering peer request");
                    let reply = reply_to_peer_request(&peer_id, &method).to_string();
                    self.write_line(&mut channel, &reply).await?;
                }
                MessageKind::Notification => {
                    tracing::debug!(
                        server = %self.server_name,
                        method = message.method.as_deref().unwrap_or_default(),
                        "peer notification"
                    );
                }
                MessageKind::Unknown => {}
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, notification: &ClientNotification) -> Result<(), McpError> {
        let line = serde_json::to_string(&NotificationEnvelope::new(notification)).map_err(|e| {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        let mut channel = self.channel.lock().await;
        self.write_line(&mut channel, &line).await
    }

    async fn write_line(&self, channel: &mut StdioChannel, line: &str) -> Result<(), McpError> {
        let writer = channel.writer.as_mut().ok_or_else(|| McpError::PeerClosed {
            name: self.server_name.clone(),
            reason: "stdin already closed".into(),
        })?;

        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');

        let write = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        };
        write.await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                McpError::PeerClosed {
                    name: self.server_name.clone(),
                    reason: self.with_stderr("stdin pipe broken (process exited)"),
                }
            } else {
                McpError::TransportError {
                    server: self.server_name.clone(),
                    reason: format!("failed to write to stdin: {e}"),
                }
            }
        })
    }

    /// Terminate the process: close stdin, SIGTERM, wait `grace`, then kill.
    pub async fn shutdown(&self, grace: Duration) {
        // An in-flight call holds the channel; the signal below unblocks it.
        if let Ok(mut channel) = self.channel.try_lock() {
            channel.writer = None;
        }

        if let Some(status) = self.exit_status() {
            tracing::debug!(server = %self.server_name, %status, "server already exited");
            return;
        }

        send_terminate(self.pid);
        if self.wait_exit(grace).await {
            return;
        }

        tracing::warn!(
            server = %self.server_name,
            grace_ms = grace.as_millis() as u64,
            "server did not exit in time, killing"
        );
        let kill = self.kill.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        if !self.wait_exit(KILL_WAIT).await {
            tracing::warn!(server = %self.server_name, "server still running after kill");
        }
    }

    async fn wait_exit(&self, limit: Duration) -> bool {
        let mut exit = self.exit.clone();
        let observed = tokio::time::timeout(limit, exit.wait_for(Option::is_some))
            .await
            .is_ok_and(|r| r.is_ok());
        observed
    }

    /// The child's exit status, once it has exited.
    pub fn exit_status(&self) -> Option<String> {
        self.exit.borrow().clone()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<String>> {
        self.exit.clone()
    }

    /// Recent stderr output, oldest first.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    fn with_stderr(&self, reason: &str) -> String {
        let tail = self.stderr_tail();
        if tail.is_empty() {
            reason.to_string()
        } else {
            format!("{reason} | stderr: {}", tail.trim())
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: Option<u32>) {
    // No graceful signal on this platform; closing stdin is the request to exit.
}

/// Own the child until it exits, killing it on request, and publish its
/// exit status.
fn spawn_exit_watcher(
    server: String,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<String>>,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill => {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(server = %server, error = %e, "failed to kill server");
                }
                child.wait().await
            }
        };
        let status = match status {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        };
        tracing::debug!(server = %server, %status, "server process exited");
        let _ = exit.send(Some(status));
    });
}

/// Forward peer stderr to the log and keep the last few lines.
fn spawn_stderr_pump(server: String, stderr: ChildStderr, tail: Arc<StdMutex<VecDeque<String>>>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, "stderr: {line}");
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    });
}

/// Interpolate `${VAR}` references in env overrides against the host env.
fn resolve_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| (k.clone(), crate::settings::interpolate_env_vars(v)))
        .collect()
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

/// JSON-RPC over HTTP POST to a single endpoint per server.
pub struct HttpTransport {
    server_name: String,
    endpoint: String,
    client: reqwest::Client,
    /// Bound for notifications and session teardown.
    timeout: Duration,
    session_id: StdRwLock<Option<String>>,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(config: &ServerConfig) -> Result<Self, McpError> {
        let endpoint = rpc_endpoint(&config.url);
        reqwest::Url::parse(&endpoint).map_err(|e| McpError::InvalidConfig {
            server_id: config.server_id.clone(),
            reason: format!("invalid url '{}': {e}", config.url),
        })?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json, text/event-stream"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| McpError::TransportError {
                server: config.server_id.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_name: config.server_id.clone(),
            endpoint,
            client,
            timeout: config.request_timeout(),
            session_id: StdRwLock::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn request(&self, request: &ClientRequest, timeout: Duration) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_value(RequestEnvelope::new(id, request)).map_err(|e| {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize request: {e}"),
            }
        })?;

        let response = self.post(&body, request.method(), timeout).await?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut guard) = self.session_id.write() {
                *guard = Some(session.to_string());
            }
        }

        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let text = response
            .text()
            .await
            .map_err(|e| self.map_reqwest(e, request.method(), timeout))?;

        let message = if is_sse {
            parse_sse_body(&text, id).ok_or_else(|| McpError::TransportError {
                server: self.server_name.clone(),
                reason: "event stream carried no matching response".into(),
            })?
        } else {
            serde_json::from_str::<IncomingMessage>(&text).map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("invalid JSON-RPC response: {e}"),
            })?
        };

        message.into_result()
    }

    pub async fn notify(&self, notification: &ClientNotification) -> Result<(), McpError> {
        let body = serde_json::to_value(NotificationEnvelope::new(notification)).map_err(|e| {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        self.post(&body, notification.method(), self.timeout)
            .await
            .map(|_| ())
    }

    /// Best-effort session termination.
    pub async fn shutdown(&self) {
        let session = self.session_id.write().ok().and_then(|mut guard| guard.take());
        if let Some(session) = session {
            let result = self
                .client
                .delete(&self.endpoint)
                .header(SESSION_HEADER, session)
                .timeout(self.timeout)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(server = %self.server_name, error = %e, "session delete failed");
            }
        }
    }

    async fn post(
        &self,
        body: &Value,
        method: &str,
        timeout: Duration,
    ) -> Result<reqwest::Response, McpError> {
        tracing::trace!(server = %self.server_name, endpoint = %self.endpoint, method, "POST");
        let mut req = self.client.post(&self.endpoint).json(body).timeout(timeout);
        let session = self.session_id.read().ok().and_then(|guard| guard.clone());
        if let Some(session) = session {
            req = req.header(SESSION_HEADER, session);
        }

        let response = req.send().await.map_err(|e| self.map_reqwest(e, method, timeout))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("HTTP {status} for '{method}': {}", truncate(&body, 500)),
            });
        }
        Ok(response)
    }

    fn map_reqwest(&self, e: reqwest::Error, method: &str, timeout: Duration) -> McpError {
        if e.is_timeout() {
            McpError::Timeout {
                server: self.server_name.clone(),
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("HTTP request failed: {e}"),
            }
        }
    }
}

/// Append the fixed RPC path unless the url already ends with it.
pub fn rpc_endpoint(url: &str) -> String {
    let base = url.trim().trim_end_matches('/');
    if base.ends_with(HTTP_RPC_PATH) {
        base.to_string()
    } else {
        format!("{base}{HTTP_RPC_PATH}")
    }
}

/// Pick the response with `id` out of a `text/event-stream` body.
fn parse_sse_body(body: &str, id: u64) -> Option<IncomingMessage> {
    for event in body.split("\n\n") {
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(str::trim_start)
            .collect();
        if data.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<IncomingMessage>(&data.join("\n")) else {
            continue;
        };
        if message.kind() == MessageKind::Response(id) {
            return Some(message);
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Tests ───────────────────────────────────────────────────────────────────
