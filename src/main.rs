//! `mcp-hub` command-line entry point.
//!
//! Every command prints a JSON envelope on stdout. Logs go to stderr or to
//! the configured log directory.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};

use mcp_hub::logging::init_tracing;
use mcp_hub::{HubSettings, McpHub};

#[derive(Parser, Debug)]
#[command(author, version, about = "Connect to MCP servers and route tool calls", long_about = None)]
struct Cli {
    /// Settings file (defaults to settings.yaml in the data directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Show every configured server and its connection state
    Status,
    /// List the aggregated tool catalog
    Tools,
    /// Call a tool by its composite name
    Call {
        name: String,
        /// Tool arguments as a JSON value
        #[arg(value_parser = parse_json, default_value = "{}")]
        arguments: Value,
    },
    /// Read a resource by URI
    Read { uri: String },
    /// Render a prompt
    Prompt {
        name: String,
        /// Prompt arguments as a JSON object
        #[arg(value_parser = parse_json_object, default_value = "{}")]
        arguments: Map<String, Value>,
    },
    /// Reload the registry and reconcile connections
    Reload,
}

fn parse_json(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON arguments: {e}"))
}

fn parse_json_object(raw: &str) -> Result<Map<String, Value>, String> {
    match parse_json(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err("arguments must be a JSON object".into()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli.settings.clone().unwrap_or_else(HubSettings::default_path);
    let settings = HubSettings::load(&settings_path)
        .with_context(|| format!("loading settings from {}", settings_path.display()))?;

    init_tracing(&settings.log_filter, settings.log_dir().as_deref())
        .context("initializing logging")?;

    let hub = McpHub::new(settings);
    let started = hub.start().await;
    if !started.success {
        print_json(&started)?;
        bail!(
            "startup failed: {}",
            started.error.unwrap_or_else(|| "unknown error".into())
        );
    }

    let result = match cli.command {
        Command::Status => print_json(&hub.list_servers()),
        Command::Tools => print_json(&hub.list_tools()),
        Command::Call { name, arguments } => print_json(&hub.call_tool(&name, arguments).await),
        Command::Read { uri } => print_json(&hub.read_resource(&uri, None).await),
        Command::Prompt { name, arguments } => {
            print_json(&hub.get_prompt(&name, arguments, None).await)
        }
        Command::Reload => print_json(&hub.reload().await),
    };

    hub.shutdown().await;
    result
}
