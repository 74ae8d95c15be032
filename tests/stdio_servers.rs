//! End-to-end tests against the `demo_tool_server` binary over stdio.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map};

use mcp_hub::mcp_client::{ConnectionStatus, ErrorKind};
use mcp_hub::{ClientManager, ServerConfig, ServerRegistry, ToolDispatcher, ToolRef};

const DEMO_SERVER: &str = env!("CARGO_BIN_EXE_demo_tool_server");
const DEMO_TOOL_COUNT: usize = 7;

fn demo(server_id: &str) -> ServerConfig {
    ServerConfig::stdio(server_id, DEMO_SERVER, vec![])
        .with_env("DEMO_SERVER_NAME", server_id)
        .with_timeout_secs(5)
        .with_enabled(true)
}

fn manager(dir: &tempfile::TempDir) -> Arc<ClientManager> {
    let registry = ServerRegistry::new(dir.path().join("mcp_servers.json"));
    Arc::new(ClientManager::new(registry).with_shutdown_grace(Duration::from_millis(500)))
}

fn tools_of(manager: &ClientManager, server_id: &str) -> Vec<String> {
    manager
        .get_all_tools()
        .into_iter()
        .filter(|t| t.server_id == server_id)
        .map(|t| t.name)
        .collect()
}

// ─── Connect / Status ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_reports_catalog_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("alpha")).await.unwrap();

    let status = manager.server_status("alpha").unwrap();
    assert_eq!(status.status, ConnectionStatus::Connected);
    assert_eq!(status.error, None);
    assert_eq!(status.tool_count, DEMO_TOOL_COUNT);
    assert_eq!(status.tool_count, tools_of(&manager, "alpha").len());
    assert_eq!(status.resource_count, 1);
    assert_eq!(status.prompt_count, 1);
    assert_eq!(status.server_info.unwrap().name.as_deref(), Some("alpha"));
    assert_eq!(status.protocol_version.as_deref(), Some("2024-11-05"));
    assert!(status.connected_at.is_some());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_missing_command_leaves_error_state() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    let config = ServerConfig::stdio("ghost", "no-such-binary-for-mcp-hub", vec![]).with_enabled(true);

    // The add itself succeeds; the failure shows up in status.
    manager.add_server(config).await.unwrap();

    let status = manager.server_status("ghost").unwrap();
    assert_eq!(status.status, ConnectionStatus::Error);
    assert!(status.error.unwrap().contains("no-such-binary-for-mcp-hub"));
    assert!(tools_of(&manager, "ghost").is_empty());

    let err = manager.connect_server("ghost").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn test_disabled_server_is_not_started() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager
        .add_server(demo("lazy").with_enabled(false))
        .await
        .unwrap();

    let status = manager.server_status("lazy").unwrap();
    assert_eq!(status.status, ConnectionStatus::Disconnected);
    assert!(manager.get_all_tools().is_empty());

    // Explicit connect ignores `enabled`.
    manager.connect_server("lazy").await.unwrap();
    assert_eq!(tools_of(&manager, "lazy").len(), DEMO_TOOL_COUNT);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_add_keeps_original() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager
        .add_server(demo("dup").with_enabled(false).with_description("first"))
        .await
        .unwrap();

    let err = manager
        .add_server(demo("dup").with_description("second"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(manager.config("dup").unwrap().description, "first");

    let on_disk = manager.registry().load().unwrap();
    assert_eq!(on_disk["dup"].description, "first");
}

// ─── Routing ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_match_routing_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    // Added out of order on purpose: routing follows id order, not insertion.
    manager.add_server(demo("beta")).await.unwrap();
    manager.add_server(demo("alpha")).await.unwrap();

    for _ in 0..3 {
        let routed = manager
            .call_tool("search", json!({"query": "rust"}), None)
            .await
            .unwrap();
        assert_eq!(routed.server_id, "alpha");
        assert_eq!(routed.result.text(), "alpha results for 'rust'");
    }

    let pinned = manager
        .call_tool("search", json!({"query": "rust"}), Some("beta"))
        .await
        .unwrap();
    assert_eq!(pinned.server_id, "beta");
    assert_eq!(pinned.result.text(), "beta results for 'rust'");

    // Both copies are listed; nothing is deduplicated across servers.
    let searches = manager
        .get_all_tools()
        .into_iter()
        .filter(|t| t.name == "search")
        .count();
    assert_eq!(searches, 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_unknown_tool_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("alpha")).await.unwrap();

    let err = manager.call_tool("nope", json!({}), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = manager
        .call_tool("nope", json!({}), Some("alpha"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = manager
        .call_tool("echo", json!({}), Some("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_removes_descriptors() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("alpha")).await.unwrap();
    manager.add_server(demo("beta")).await.unwrap();

    manager.disconnect_server("alpha").await.unwrap();
    assert!(tools_of(&manager, "alpha").is_empty());
    assert_eq!(tools_of(&manager, "beta").len(), DEMO_TOOL_COUNT);
    assert_eq!(
        manager.server_status("alpha").unwrap().status,
        ConnectionStatus::Disconnected
    );

    let err = manager
        .call_tool("echo", json!({"message": "hi"}), Some("alpha"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Unpinned calls fall through to the remaining server.
    let routed = manager
        .call_tool("echo", json!({"message": "hi"}), None)
        .await
        .unwrap();
    assert_eq!(routed.server_id, "beta");

    // Disconnecting twice is fine.
    manager.disconnect_server("alpha").await.unwrap();
    manager.shutdown().await;
}

// ─── Failures ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_exit_mid_call() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("alpha")).await.unwrap();

    let started = Instant::now();
    let err = manager
        .call_tool("crash", json!({}), Some("alpha"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(started.elapsed() < Duration::from_secs(5));

    let status = manager.server_status("alpha").unwrap();
    assert_ne!(status.status, ConnectionStatus::Connected);
    assert!(status.error.is_some());
    assert!(tools_of(&manager, "alpha").is_empty());

    // A fresh connect brings it back.
    manager.connect_server("alpha").await.unwrap();
    let routed = manager
        .call_tool("echo", json!({"message": "back"}), Some("alpha"))
        .await
        .unwrap();
    assert_eq!(routed.result.text(), "back");
    manager.shutdown().await;
}

async fn server_pid(manager: &ClientManager, server_id: &str) -> i32 {
    manager
        .call_tool("pid", json!({}), Some(server_id))
        .await
        .unwrap()
        .result
        .text()
        .parse()
        .unwrap()
}

#[cfg(unix)]
#[tokio::test]
async fn test_externally_killed_server() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("alpha")).await.unwrap();

    let pid = server_pid(&manager, "alpha").await;
    kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let err = manager
        .call_tool("echo", json!({"message": "hi"}), Some("alpha"))
        .await
        .unwrap_err();
    assert!(
        matches!(err.kind(), ErrorKind::Connection | ErrorKind::Timeout),
        "unexpected error: {err}"
    );
    assert!(started.elapsed() <= Duration::from_secs(6));
    assert_ne!(
        manager.server_status("alpha").unwrap().status,
        ConnectionStatus::Connected
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_idle_server_death_is_detected_without_a_call() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("alpha")).await.unwrap();
    manager.add_server(demo("beta")).await.unwrap();
    assert_eq!(tools_of(&manager, "alpha").len(), DEMO_TOOL_COUNT);

    let pid = server_pid(&manager, "alpha").await;
    kill(Pid::from_raw(pid), Signal::SIGKILL).unwrap();

    let mut status = manager.server_status("alpha").unwrap();
    for _ in 0..50 {
        if status.status != ConnectionStatus::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        status = manager.server_status("alpha").unwrap();
    }
    assert_eq!(status.status, ConnectionStatus::Disconnected);
    assert!(status.error.unwrap().contains("exited"));
    assert_eq!(status.tool_count, 0);
    assert!(tools_of(&manager, "alpha").is_empty());
    assert_eq!(tools_of(&manager, "beta").len(), DEMO_TOOL_COUNT);

    // Unpinned routing skips the dead server; `echo` resolves to beta.
    let routed = manager
        .call_tool("echo", json!({"message": "still here"}), None)
        .await
        .unwrap();
    assert_eq!(routed.server_id, "beta");

    manager.connect_server("alpha").await.unwrap();
    assert_eq!(tools_of(&manager, "alpha").len(), DEMO_TOOL_COUNT);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_timeout_tears_down_stdio_server() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("alpha")).await.unwrap();

    let started = Instant::now();
    let err = manager
        .call_tool_with_timeout(
            "slow",
            json!({"ms": 3000}),
            Some("alpha"),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(3));

    let status = manager.server_status("alpha").unwrap();
    assert_eq!(status.status, ConnectionStatus::Error);
    assert!(status.error.unwrap().contains("timed out"));

    manager.connect_server("alpha").await.unwrap();
    let routed = manager
        .call_tool("slow", json!({"ms": 10}), Some("alpha"))
        .await
        .unwrap();
    assert_eq!(routed.result.text(), "slept 10ms");
    manager.shutdown().await;
}

// ─── Protocol Details ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_noisy_paginated_server() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager
        .add_server(
            demo("noisy")
                .with_env("DEMO_NOISY", "1")
                .with_env("DEMO_PAGE_SIZE", "2"),
        )
        .await
        .unwrap();

    let mut names = tools_of(&manager, "noisy");
    assert_eq!(names.len(), DEMO_TOOL_COUNT);
    names.dedup();
    assert_eq!(names.len(), DEMO_TOOL_COUNT);

    let routed = manager
        .call_tool("echo", json!({"message": "through the noise"}), None)
        .await
        .unwrap();
    assert_eq!(routed.result.text(), "through the noise");

    // The server pings us mid-call; the reply must not be mistaken for ours.
    let routed = manager
        .call_tool("ping_client", json!({}), None)
        .await
        .unwrap();
    assert!(!routed.result.is_error);
    assert_eq!(routed.result.text(), "pong received");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_share_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("alpha")).await.unwrap();

    let calls = (0..8).map(|i| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let message = format!("message {i}");
            let routed = manager
                .call_tool("echo", json!({"message": message}), Some("alpha"))
                .await
                .unwrap();
            assert_eq!(routed.result.text(), message);
        })
    });
    for handle in futures::future::join_all(calls).await {
        handle.unwrap();
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn test_resources_and_prompts() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("alpha")).await.unwrap();

    let resources = manager.get_all_resources();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].uri, "demo://alpha/readme");
    assert_eq!(resources[0].mime_type.as_deref(), Some("text/plain"));

    let read = manager
        .read_resource("demo://alpha/readme", None)
        .await
        .unwrap();
    assert_eq!(read.server_id, "alpha");
    assert_eq!(read.result.contents[0]["text"], "hello from alpha");

    let err = manager
        .read_resource("demo://alpha/missing", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let mut args = Map::new();
    args.insert("who".into(), json!("Ferris"));
    let prompt = manager.get_prompt("greet", args, None).await.unwrap();
    assert_eq!(prompt.result.messages.len(), 1);
    assert_eq!(
        prompt.result.messages[0]["content"]["text"],
        "Say hello to Ferris"
    );

    manager.shutdown().await;
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_dispatcher_composite_names() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("demo-a")).await.unwrap();
    let dispatcher = ToolDispatcher::new(Arc::clone(&manager));

    let composite = ToolRef::new("demo-a", "echo").encode("mcp");
    let listed = dispatcher.list_tools();
    assert!(listed.iter().any(|t| t.name == composite && t.tool_name == "echo"));

    let envelope = dispatcher.invoke(&composite, json!({"message": "hi"})).await;
    assert!(envelope.success, "{envelope:?}");
    assert_eq!(envelope.server_id.as_deref(), Some("demo-a"));
    assert_eq!(envelope.tool_name, "echo");

    let failed = dispatcher
        .invoke(&ToolRef::new("demo-a", "fail").encode("mcp"), json!({}))
        .await;
    assert!(!failed.success);
    assert_eq!(failed.error.as_deref(), Some("the tool failed on purpose"));
    assert_eq!(failed.error_kind, None);

    let garbage = dispatcher.invoke("not-a-composite", json!({})).await;
    assert!(!garbage.success);
    assert_eq!(garbage.error_kind, Some(ErrorKind::NotFound));

    manager.shutdown().await;
}

// ─── Registry Mutations ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_update_reconnects_with_new_config() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("alpha")).await.unwrap();

    let updated = demo("alpha").with_env("DEMO_SERVER_NAME", "renamed");
    manager.update_server("alpha", updated).await.unwrap();

    let status = manager.server_status("alpha").unwrap();
    assert_eq!(status.status, ConnectionStatus::Connected);
    assert_eq!(status.server_info.unwrap().name.as_deref(), Some("renamed"));

    let err = manager
        .update_server("alpha", demo("other"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    let err = manager
        .update_server("missing", demo("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_remove_disconnects_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.add_server(demo("alpha")).await.unwrap();

    assert!(manager.remove_server("alpha").await.unwrap());
    assert!(manager.server_status("alpha").is_none());
    assert!(manager.get_all_tools().is_empty());
    assert!(!manager.registry().load().unwrap().contains_key("alpha"));

    assert!(!manager.remove_server("alpha").await.unwrap());
}

#[tokio::test]
async fn test_reload_picks_up_external_edits() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    manager.initialize().await.unwrap();
    manager.add_server(demo("alpha")).await.unwrap();

    // Another process rewrites the registry.
    let mut edited = manager.registry().load().unwrap();
    edited.remove("alpha");
    edited.insert("beta".into(), demo("beta"));
    manager.registry().save(&edited).unwrap();

    let errors = manager.reload().await.unwrap();
    assert!(errors.is_empty(), "{errors:?}");
    assert!(manager.server_status("alpha").is_none());
    assert_eq!(tools_of(&manager, "beta").len(), DEMO_TOOL_COUNT);
    assert!(tools_of(&manager, "alpha").is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_configs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let manager = manager(&dir);
        manager.initialize().await.unwrap();
        manager
            .add_server(demo("alpha").with_description("kept"))
            .await
            .unwrap();
        manager.shutdown().await;
    }

    let manager = manager(&dir);
    let errors = manager.initialize().await.unwrap();
    assert!(errors.is_empty(), "{errors:?}");
    assert_eq!(manager.config("alpha").unwrap().description, "kept");
    assert_eq!(
        manager.server_status("alpha").unwrap().status,
        ConnectionStatus::Connected
    );
    manager.shutdown().await;
}
