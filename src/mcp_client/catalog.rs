//! Capability catalog — the tools, resources and prompts one server advertised.
//!
//! Built once after the handshake and replaced wholesale on reconnect. Names
//! are unique within a catalog, not across servers; each descriptor carries
//! the owning server id as a plain back-reference.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use super::protocol::{Prompt, PromptArgument, Resource, Tool};

// ─── Descriptors ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDescriptor {
    pub server_id: String,
    pub uri: String,
    pub name: String,
    pub description: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptDescriptor {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub arguments: Vec<PromptArgument>,
}

// ─── CapabilityCatalog ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct CapabilityCatalog {
    tools: Vec<ToolDescriptor>,
    resources: Vec<ResourceDescriptor>,
    prompts: Vec<PromptDescriptor>,
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from raw listings, dropping repeated names.
    ///
    /// Listing order is preserved; the first occurrence of a name wins.
    pub fn from_listings(
        server_id: &str,
        tools: Vec<Tool>,
        resources: Vec<Resource>,
        prompts: Vec<Prompt>,
    ) -> Self {
        let mut seen = HashSet::new();
        let tools = tools
            .into_iter()
            .filter(|t| keep_first(server_id, "tool", &mut seen, &t.name))
            .map(|t| ToolDescriptor {
                server_id: server_id.to_string(),
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: normalize_schema(t.input_schema),
            })
            .collect();

        let mut seen = HashSet::new();
        let resources = resources
            .into_iter()
            .filter(|r| keep_first(server_id, "resource", &mut seen, &r.uri))
            .map(|r| ResourceDescriptor {
                server_id: server_id.to_string(),
                name: r.name.unwrap_or_else(|| r.uri.clone()),
                uri: r.uri,
                description: r.description.unwrap_or_default(),
                mime_type: r.mime_type,
            })
            .collect();

        let mut seen = HashSet::new();
        let prompts = prompts
            .into_iter()
            .filter(|p| keep_first(server_id, "prompt", &mut seen, &p.name))
            .map(|p| PromptDescriptor {
                server_id: server_id.to_string(),
                name: p.name,
                description: p.description.unwrap_or_default(),
                arguments: p.arguments,
            })
            .collect();

        Self {
            tools,
            resources,
            prompts,
        }
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn resources(&self) -> &[ResourceDescriptor] {
        &self.resources
    }

    pub fn prompts(&self) -> &[PromptDescriptor] {
        &self.prompts
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn resource(&self, uri: &str) -> Option<&ResourceDescriptor> {
        self.resources.iter().find(|r| r.uri == uri)
    }

    pub fn prompt(&self, name: &str) -> Option<&PromptDescriptor> {
        self.prompts.iter().find(|p| p.name == name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tool(name).is_some()
    }

    pub fn has_resource(&self, uri: &str) -> bool {
        self.resource(uri).is_some()
    }

    pub fn has_prompt(&self, name: &str) -> bool {
        self.prompt(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.resources.is_empty() && self.prompts.is_empty()
    }
}

fn keep_first(server_id: &str, kind: &str, seen: &mut HashSet<String>, key: &str) -> bool {
    if seen.insert(key.to_string()) {
        true
    } else {
        tracing::warn!(
            server = server_id,
            kind,
            name = key,
            "duplicate name in listing, keeping first"
        );
        false
    }
}

/// LLM function-calling APIs reject a missing or non-object schema.
fn normalize_schema(schema: Value) -> Value {
    if schema.is_object() {
        schema
    } else {
        serde_json::json!({ "type": "object", "properties": {} })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> Tool {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "description": format!("{name} tool"),
            "inputSchema": {"type": "object"}
        }))
        .unwrap()
    }

    #[test]
    fn test_from_listings_tags_owner() {
        let catalog = CapabilityCatalog::from_listings("fs", vec![tool("read")], vec![], vec![]);
        let t = catalog.tool("read").unwrap();
        assert_eq!(t.server_id, "fs");
        assert_eq!(t.description, "read tool");
        assert!(catalog.has_tool("read"));
        assert!(!catalog.has_tool("write"));
    }

    #[test]
    fn test_duplicate_names_keep_first() {
        let mut second = tool("read");
        second.description = Some("shadowed".into());
        let catalog =
            CapabilityCatalog::from_listings("fs", vec![tool("read"), second], vec![], vec![]);
        assert_eq!(catalog.tools().len(), 1);
        assert_eq!(catalog.tools()[0].description, "read tool");
    }

    #[test]
    fn test_missing_schema_normalized() {
        let raw: Tool = serde_json::from_value(serde_json::json!({"name": "noop"})).unwrap();
        let catalog = CapabilityCatalog::from_listings("s", vec![raw], vec![], vec![]);
        assert_eq!(catalog.tools()[0].input_schema["type"], "object");
    }

    #[test]
    fn test_resource_name_defaults_to_uri() {
        let raw: Resource =
            serde_json::from_value(serde_json::json!({"uri": "file:///tmp/a.txt"})).unwrap();
        let catalog = CapabilityCatalog::from_listings("s", vec![], vec![raw], vec![]);
        let r = catalog.resource("file:///tmp/a.txt").unwrap();
        assert_eq!(r.name, "file:///tmp/a.txt");
        assert!(r.mime_type.is_none());
    }

    #[test]
    fn test_empty_catalog() {
        let catalog = CapabilityCatalog::new();
        assert!(catalog.is_empty());
        assert!(catalog.prompt("x").is_none());
    }
}
