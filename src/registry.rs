// SPF Tool Gateway - Tool Registry
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Every tool the gateway can dispatch, keyed by unique name.
// Name collisions resolve by source precedence: remote < native < bridge.
// Bridge tools win ties: they are the more capable code-intelligence
// implementations of the same operations.

use crate::bridge::BridgeClient;
use crate::native::NativeExecutor;
use crate::remote::RemoteService;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    Native,
    Bridge,
    Remote,
}

impl ToolSource {
    /// Higher wins a name collision
    fn precedence(self) -> u8 {
        match self {
            Self::Remote => 0,
            Self::Native => 1,
            Self::Bridge => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub source: ToolSource,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolSpec {
    /// Object schema from a property map and required keys
    pub fn new(name: &str, description: &str, source: ToolSource, properties: Value, required: Vec<&str>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            source,
            input_schema: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    /// Listing form for `tools/list`
    pub fn to_listing(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
            "source": self.source,
        })
    }
}

/// Per-source tool lists plus the merged, precedence-resolved view
#[derive(Debug, Default, Clone)]
pub struct ToolRegistry {
    by_source: BTreeMap<u8, Vec<ToolSpec>>,
    merged: BTreeMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every tool of `source`, then re-resolve collisions
    pub fn set_source(&mut self, source: ToolSource, tools: Vec<ToolSpec>) {
        let tools = tools
            .into_iter()
            .map(|mut t| {
                t.source = source;
                t
            })
            .collect();
        self.by_source.insert(source.precedence(), tools);
        self.rebuild();
    }

    fn rebuild(&mut self) {
        self.merged.clear();
        // ascending precedence: later inserts overwrite
        for tools in self.by_source.values() {
            for tool in tools {
                if let Some(previous) = self.merged.insert(tool.name.clone(), tool.clone()) {
                    log::debug!("tool '{}' from {:?} shadowed by {:?}", tool.name, previous.source, tool.source);
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.merged.get(name)
    }

    /// Sorted by name
    pub fn list(&self) -> Vec<ToolSpec> {
        self.merged.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    pub fn count_from(&self, source: ToolSource) -> usize {
        self.merged.values().filter(|t| t.source == source).count()
    }
}

/// Native tools in executor order. Names without a spec get an open schema.
pub fn native_specs(native: &dyn NativeExecutor) -> Vec<ToolSpec> {
    native
        .list_tools()
        .iter()
        .map(|name| {
            native
                .tool_spec(name)
                .unwrap_or_else(|| ToolSpec::new(name, "", ToolSource::Native, json!({}), vec![]))
        })
        .collect()
}

/// Query the bridge. Unreachable bridge yields an error the caller may downgrade.
pub async fn bridge_specs(bridge: &BridgeClient) -> Result<Vec<ToolSpec>, crate::error::GatewayError> {
    let tools = bridge.list_tools().await?;
    Ok(tools
        .into_iter()
        .map(|t| ToolSpec {
            name: t.name,
            description: t.description,
            source: ToolSource::Bridge,
            input_schema: t.input_schema,
        })
        .collect())
}

/// Build the startup registry from all three sources.
/// A bridge that can't be reached leaves native and remote tools with a warning.
pub async fn discover(native: &dyn NativeExecutor, bridge: &BridgeClient, remote: &dyn RemoteService) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.set_source(ToolSource::Remote, remote.list_tools());
    registry.set_source(ToolSource::Native, native_specs(native));
    match bridge_specs(bridge).await {
        Ok(tools) => registry.set_source(ToolSource::Bridge, tools),
        Err(e) => log::warn!("Bridge tool discovery failed at {}: {}", bridge.base_url(), e),
    }
    log::info!(
        "Tool registry: {} tools ({} native, {} bridge, {} remote)",
        registry.len(),
        registry.count_from(ToolSource::Native),
        registry.count_from(ToolSource::Bridge),
        registry.count_from(ToolSource::Remote),
    );
    registry
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, source: ToolSource) -> ToolSpec {
        ToolSpec::new(name, &format!("{:?} {}", source, name), source, json!({}), vec![])
    }

    #[test]
    fn bridge_wins_ties_regardless_of_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.set_source(ToolSource::Bridge, vec![spec("find_symbol", ToolSource::Bridge)]);
        registry.set_source(ToolSource::Native, vec![spec("find_symbol", ToolSource::Native), spec("read_file", ToolSource::Native)]);
        registry.set_source(ToolSource::Remote, vec![spec("read_file", ToolSource::Remote), spec("ask_agent", ToolSource::Remote)]);

        assert_eq!(registry.get("find_symbol").map(|t| t.source), Some(ToolSource::Bridge));
        assert_eq!(registry.get("read_file").map(|t| t.source), Some(ToolSource::Native));
        assert_eq!(registry.get("ask_agent").map(|t| t.source), Some(ToolSource::Remote));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn replacing_bridge_tools_restores_shadowed_native() {
        let mut registry = ToolRegistry::new();
        registry.set_source(ToolSource::Native, vec![spec("list_dir", ToolSource::Native)]);
        registry.set_source(ToolSource::Bridge, vec![spec("list_dir", ToolSource::Bridge)]);
        assert_eq!(registry.get("list_dir").map(|t| t.source), Some(ToolSource::Bridge));

        registry.set_source(ToolSource::Bridge, vec![]);
        assert_eq!(registry.get("list_dir").map(|t| t.source), Some(ToolSource::Native));
    }

    #[test]
    fn source_is_forced_to_registering_source() {
        let mut registry = ToolRegistry::new();
        registry.set_source(ToolSource::Remote, vec![spec("x", ToolSource::Native)]);
        assert_eq!(registry.get("x").map(|t| t.source), Some(ToolSource::Remote));
    }

    #[test]
    fn listing_is_sorted_and_carries_schema() {
        let mut registry = ToolRegistry::new();
        registry.set_source(ToolSource::Native, vec![spec("b", ToolSource::Native), spec("a", ToolSource::Native)]);
        let names: Vec<String> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        let listing = registry.list()[0].to_listing();
        assert_eq!(listing["inputSchema"]["type"], "object");
        assert_eq!(listing["source"], "native");
    }
}
