// SPF Tool Gateway - Error Taxonomy
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Every failure a dispatch can produce. Returned as typed results,
// reported to subscribers as tool_error events. Never thrown across
// the event-delivery boundary.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Access policy denied the call. `reason` names the matched pattern.
    #[error("policy denied: {reason}")]
    PolicyDenied { reason: String },

    /// A policy pattern could not be evaluated (malformed glob).
    /// Neither allow nor deny.
    #[error("policy evaluation failed: {0}")]
    PolicyEvaluation(String),

    #[error("approval denied for {tool} (request {request_id})")]
    ApprovalDenied { tool: String, request_id: String },

    #[error("approval expired for {tool} (request {request_id})")]
    ApprovalExpired { tool: String, request_id: String },

    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    /// Backend answered with a failure (non-2xx, status "error", malformed body)
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Structured error from the native executor
    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl GatewayError {
    /// Stable machine-readable code carried in failure events
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::PolicyEvaluation(_) => "policy_evaluation_error",
            Self::ApprovalDenied { .. } => "approval_denied",
            Self::ApprovalExpired { .. } => "approval_expired",
            Self::Timeout { .. } => "timeout",
            Self::Network(_) => "network_error",
            Self::Upstream(_) => "upstream_error",
            Self::ToolFailed { .. } => "tool_failed",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Channel(_) => "channel_error",
            Self::Storage(_) => "storage_error",
        }
    }
}
