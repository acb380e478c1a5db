// SPF Tool Gateway - Code-Intelligence Bridge Client
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// HTTP client for the local code-intelligence bridge process.
//   POST {base}/execute_job  {project_root, tool_name, tool_kwargs}
//   GET  {base}/list_tools
// Base URL and timeout are live settings: the gateway can rebind to a
// respawned bridge on a new port without restarting.
// Timeout drops the in-flight request future, which aborts the connection.

use crate::error::GatewayError;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(120_000);

/// Tool advertised by the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Wire response of /execute_job
#[derive(Debug, Deserialize)]
struct JobResponse {
    status: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct BridgeSettings {
    base_url: String,
    timeout: Duration,
    project_root: String,
}

/// Validate scheme and trim trailing slashes
pub fn normalize_base_url(url: &str) -> Result<String, GatewayError> {
    let trimmed = url.trim();
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(GatewayError::InvalidConfig(format!(
            "bridge URL must start with http:// or https://: {}", url
        )));
    }
    let normalized = trimmed.trim_end_matches('/');
    if normalized.ends_with(':') || normalized.ends_with("//") {
        return Err(GatewayError::InvalidConfig(format!("bridge URL has no host: {}", url)));
    }
    Ok(normalized.to_string())
}

pub struct BridgeClient {
    client: Client,
    settings: RwLock<BridgeSettings>,
}

impl BridgeClient {
    pub fn new(base_url: &str, timeout: Duration, project_root: &str) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .user_agent("SPF-ToolGateway/2.1 (bridge)")
            .build()
            .map_err(|e| GatewayError::InvalidConfig(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            settings: RwLock::new(BridgeSettings {
                base_url: normalize_base_url(base_url)?,
                timeout,
                project_root: project_root.to_string(),
            }),
        })
    }

    pub fn base_url(&self) -> String {
        self.settings.read().base_url.clone()
    }

    /// Rebind to a different bridge. Rejected URLs leave the old one in place.
    pub fn set_base_url(&self, url: &str) -> Result<(), GatewayError> {
        let normalized = normalize_base_url(url)?;
        log::info!("Bridge rebound to {}", normalized);
        self.settings.write().base_url = normalized;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        self.settings.read().timeout
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.settings.write().timeout = timeout;
    }

    pub fn set_project_root(&self, root: &str) {
        self.settings.write().project_root = root.to_string();
    }

    /// Run a tool against the configured project root
    pub async fn call_tool(&self, name: &str, kwargs: &Value) -> Result<Value, GatewayError> {
        let root = self.settings.read().project_root.clone();
        self.call_tool_in(&root, name, kwargs).await
    }

    /// Run a tool against an explicit project root (the calling session's)
    pub async fn call_tool_in(&self, project_root: &str, name: &str, kwargs: &Value) -> Result<Value, GatewayError> {
        let BridgeSettings { base_url, timeout, .. } = self.settings.read().clone();
        let url = format!("{}/execute_job", base_url);
        let body = json!({
            "project_root": project_root,
            "tool_name": name,
            "tool_kwargs": kwargs,
        });

        log::debug!("bridge POST {} tool={}", url, name);
        let request = async {
            let resp = self.client.post(&url).json(&body).send().await.map_err(network_error)?;
            let status = resp.status();
            let text = resp.text().await.map_err(network_error)?;
            if !status.is_success() {
                return Err(GatewayError::Upstream(format!(
                    "bridge HTTP {}: {}", status.as_u16(), truncate(&text, 300)
                )));
            }
            parse_job_response(&text)
        };

        with_timeout(timeout, request).await
    }

    /// Tools the bridge advertises
    pub async fn list_tools(&self) -> Result<Vec<BridgeTool>, GatewayError> {
        let BridgeSettings { base_url, timeout, .. } = self.settings.read().clone();
        let url = format!("{}/list_tools", base_url);
        let request = async {
            let resp = self.client.get(&url).send().await.map_err(network_error)?;
            let status = resp.status();
            if !status.is_success() {
                return Err(GatewayError::Upstream(format!("bridge HTTP {} on list_tools", status.as_u16())));
            }
            let text = resp.text().await.map_err(network_error)?;
            serde_json::from_str::<Vec<BridgeTool>>(&text)
                .map_err(|e| GatewayError::Upstream(format!("malformed list_tools body: {}", e)))
        };
        with_timeout(timeout, request).await
    }
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, GatewayError>
where
    F: std::future::Future<Output = Result<T, GatewayError>>,
{
    // Elapsed drops `fut`, and with it the connection: abort, not ignore
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("bridge call timed out after {:?}", timeout);
            Err(GatewayError::Timeout { after_ms: timeout.as_millis() as u64 })
        }
    }
}

fn network_error(e: reqwest::Error) -> GatewayError {
    GatewayError::Network(e.to_string())
}

fn parse_job_response(text: &str) -> Result<Value, GatewayError> {
    let parsed: JobResponse = serde_json::from_str(text)
        .map_err(|e| GatewayError::Upstream(format!("malformed bridge response: {}", e)))?;
    match parsed.status.as_str() {
        "success" => Ok(parsed.result.unwrap_or(Value::Null)),
        "error" => Err(GatewayError::Upstream(
            parsed.error.unwrap_or_else(|| "bridge reported an error".to_string()),
        )),
        other => Err(GatewayError::Upstream(format!("unknown bridge status '{}'", other))),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}…", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

// ============================================================================
// TESTS
// ============================================================================
