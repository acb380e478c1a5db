// SPF Tool Gateway - Remote Agent Service
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Tools served by an external agent backend. Only the call contract
// lives here; the default implementation advertises the configured
// names and refuses to run them.

use crate::error::GatewayError;
use crate::registry::{ToolSource, ToolSpec};
use async_trait::async_trait;
use serde_json::{json, Value};

#[async_trait]
pub trait RemoteService: Send + Sync {
    fn list_tools(&self) -> Vec<ToolSpec>;
    async fn call(&self, session_id: &str, name: &str, args: &Value) -> Result<Value, GatewayError>;
}

pub struct UnconfiguredRemote {
    names: Vec<String>,
}

impl UnconfiguredRemote {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }
}

#[async_trait]
impl RemoteService for UnconfiguredRemote {
    fn list_tools(&self) -> Vec<ToolSpec> {
        self.names
            .iter()
            .map(|name| ToolSpec::new(name, "Remote agent tool", ToolSource::Remote, json!({}), vec![]))
            .collect()
    }

    async fn call(&self, session_id: &str, name: &str, _args: &Value) -> Result<Value, GatewayError> {
        log::warn!("remote tool {} called for session {} with no remote service", name, session_id);
        Err(GatewayError::Upstream("remote service not configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_remote_advertises_but_refuses() {
        let remote = UnconfiguredRemote::new(vec!["ask_agent".to_string()]);
        let tools = remote.list_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].source, ToolSource::Remote);
        let err = remote.call("s1", "ask_agent", &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "upstream_error");
    }
}
