// SPF Tool Gateway - Configuration
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Sensitive tools, approval timeout, fallback policy, dedupe bounds,
// bridge endpoint. JSON file under the gateway root, env overrides on top.

use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Master gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub version: String,
    /// Exact tool names or single-wildcard patterns (`delete_*`)
    pub sensitive_tools: Vec<String>,
    pub approval_timeout_ms: u64,
    /// Outcome when the approval subsystem is unreachable:
    /// true -> auto_approved, false -> denied
    pub fallback_auto_approve: bool,
    pub dedupe_ttl_secs: u64,
    pub dedupe_capacity: usize,
    pub bridge_base_url: String,
    pub bridge_timeout_ms: u64,
    /// Customized session policies are kept this long across restarts
    pub policy_retention_days: i64,
    pub max_write_size: usize,
    pub shell_timeout_secs: u64,
    /// Tool names served by the remote agent backend
    pub remote_tools: Vec<String>,
    /// Default working directory for sessions that don't announce one
    pub default_working_dir: Option<String>,
    /// Sessions idle this long are forgotten; 0 keeps them until closed
    pub session_idle_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            sensitive_tools: vec![
                "str_replace_editor".to_string(),
                "create_file".to_string(),
                "write_file".to_string(),
                "execute_shell_command".to_string(),
                "delete_*".to_string(),
            ],
            approval_timeout_ms: 10 * 60 * 1000,
            fallback_auto_approve: false,
            dedupe_ttl_secs: 30,
            dedupe_capacity: 2000,
            bridge_base_url: "http://127.0.0.1:8765".to_string(),
            bridge_timeout_ms: 120_000,
            policy_retention_days: 7,
            max_write_size: 100_000,
            shell_timeout_secs: 120,
            remote_tools: Vec::new(),
            default_working_dir: None,
            session_idle_secs: 24 * 60 * 60,
        }
    }
}

impl GatewayConfig {
    /// Load config from JSON file, falling back to defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            log::warn!("Config not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save config to JSON file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply SPF_* environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        if let Some(raw) = var("SPF_FALLBACK_AUTO_APPROVE") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "true" => self.fallback_auto_approve = true,
                "false" => self.fallback_auto_approve = false,
                other => log::warn!(
                    "SPF_FALLBACK_AUTO_APPROVE={:?} not recognized (true|false), keeping {}",
                    other, self.fallback_auto_approve
                ),
            }
        }
        if let Some(url) = var("SPF_BRIDGE_URL") {
            self.bridge_base_url = url;
        }
        if let Some(ms) = var("SPF_BRIDGE_TIMEOUT_MS") {
            match ms.trim().parse() {
                Ok(v) => self.bridge_timeout_ms = v,
                Err(_) => log::warn!("SPF_BRIDGE_TIMEOUT_MS={:?} is not a number, ignored", ms),
            }
        }
        if let Some(ms) = var("SPF_APPROVAL_TIMEOUT_MS") {
            match ms.trim().parse() {
                Ok(v) => self.approval_timeout_ms = v,
                Err(_) => log::warn!("SPF_APPROVAL_TIMEOUT_MS={:?} is not a number, ignored", ms),
            }
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        crate::bridge::normalize_base_url(&self.bridge_base_url)?;
        if self.approval_timeout_ms == 0 {
            return Err(GatewayError::InvalidConfig("approval_timeout_ms must be > 0".into()));
        }
        if self.bridge_timeout_ms == 0 {
            return Err(GatewayError::InvalidConfig("bridge_timeout_ms must be > 0".into()));
        }
        if self.dedupe_capacity == 0 {
            return Err(GatewayError::InvalidConfig("dedupe_capacity must be > 0".into()));
        }
        crate::approval::SensitiveToolMatcher::compile(&self.sensitive_tools)?;
        Ok(())
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    pub fn bridge_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_timeout_ms)
    }

    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_secs(self.dedupe_ttl_secs)
    }

    pub fn policy_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.policy_retention_days)
    }

    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }

    /// None when idle sessions are kept
    pub fn session_idle(&self) -> Option<chrono::Duration> {
        match self.session_idle_secs {
            0 => None,
            secs => chrono::Duration::from_std(Duration::from_secs(secs)).ok(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
