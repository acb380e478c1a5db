// SPF Tool Gateway - Tool Router
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Dispatch pipeline, in order:
//   1. registry lookup      unknown -> UnknownTool, nothing else runs
//   2. access policy        every path / shell target; first deny wins
//   3. approval             sensitive tools only; denied / expired short-circuit
//   4. backend              native | bridge | remote
//   5. outcome event        tool_result | tool_error on the session channel
//
// Every failure is a typed result for the caller and a tool_error event
// for subscribers. Nothing is thrown across the event boundary.

use crate::approval::{ApprovalGateway, ApprovalOutcome, ApprovalState};
use crate::bridge::BridgeClient;
use crate::error::GatewayError;
use crate::events::{Event, EventMultiplexer, Subscription};
use crate::native::{ExecContext, NativeExecutor, PATH_KEYS};
use crate::paths::resolve_path;
use crate::policy::{check_path, check_shell_command, AccessDecision};
use crate::policy_store::PolicyStore;
use crate::registry::{self, ToolRegistry, ToolSource, ToolSpec};
use crate::remote::RemoteService;
use crate::session::{Session, SessionTable};
use chrono::Local;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Inbound event type that requests a dispatch
pub const TOOL_CALL_EVENT: &str = "tool_call";

pub struct ToolRouter {
    registry: RwLock<ToolRegistry>,
    policies: Arc<PolicyStore>,
    approvals: Arc<ApprovalGateway>,
    events: Arc<EventMultiplexer>,
    native: Arc<dyn NativeExecutor>,
    bridge: Arc<BridgeClient>,
    remote: Arc<dyn RemoteService>,
    sessions: SessionTable,
    command_log: Option<PathBuf>,
}

impl ToolRouter {
    pub fn new(
        policies: Arc<PolicyStore>,
        approvals: Arc<ApprovalGateway>,
        events: Arc<EventMultiplexer>,
        native: Arc<dyn NativeExecutor>,
        bridge: Arc<BridgeClient>,
        remote: Arc<dyn RemoteService>,
    ) -> Self {
        Self {
            registry: RwLock::new(ToolRegistry::new()),
            policies,
            approvals,
            events,
            native,
            bridge,
            remote,
            sessions: SessionTable::new(),
            command_log: None,
        }
    }

    /// Append CALL / FAIL lines to this file
    pub fn with_command_log(mut self, path: PathBuf) -> Self {
        self.command_log = Some(path);
        self
    }

    // ========================================================================
    // DISCOVERY
    // ========================================================================

    /// Build the registry from native, bridge and remote sources
    pub async fn discover_tools(&self) -> usize {
        let registry = registry::discover(self.native.as_ref(), &self.bridge, self.remote.as_ref()).await;
        let count = registry.len();
        *self.registry.write() = registry;
        count
    }

    /// Re-query the bridge, e.g. after rebinding it to a new port.
    /// On failure the previous bridge tools stay registered.
    pub async fn refresh_bridge_tools(&self) -> Result<usize, GatewayError> {
        let tools = registry::bridge_specs(&self.bridge).await?;
        let count = tools.len();
        self.registry.write().set_source(ToolSource::Bridge, tools);
        log::info!("Bridge tools refreshed: {}", count);
        Ok(count)
    }

    pub fn tools(&self) -> Vec<ToolSpec> {
        self.registry.read().list()
    }

    pub fn tool(&self, name: &str) -> Option<ToolSpec> {
        self.registry.read().get(name).cloned()
    }

    pub fn bridge(&self) -> &BridgeClient {
        &self.bridge
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.sessions.snapshot(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.ids()
    }

    /// Forget a session's audit trail and uncustomized policy
    pub fn close_session(&self, session_id: &str) -> bool {
        let audit = self.sessions.remove(session_id);
        let policy = self.policies.close_session(session_id);
        if audit || policy {
            log::info!("Session {} closed", session_id);
        }
        audit || policy
    }

    /// Forget sessions idle past `max_idle`. Returns how many ids were dropped.
    pub fn purge_idle_sessions(&self, max_idle: chrono::Duration) -> usize {
        let now = chrono::Utc::now();
        let mut ids = self.sessions.purge_idle(max_idle, now);
        ids.extend(self.policies.purge_idle(max_idle, now));
        ids.sort();
        ids.dedup();
        ids.len()
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    pub async fn dispatch(&self, session_id: &str, tool_name: &str, args: &Value) -> Result<Value, GatewayError> {
        let call_id = uuid::Uuid::new_v4().to_string();
        self.dispatch_call(&call_id, session_id, tool_name, args).await
    }

    /// Dispatch under a caller-supplied call id. Outcome goes to the caller
    /// and, once, to the session's subscribers.
    pub async fn dispatch_call(&self, call_id: &str, session_id: &str, tool_name: &str, args: &Value) -> Result<Value, GatewayError> {
        self.cmd_log(&format!("CALL {} | {}", tool_name, param_summary(args)));

        let result = self.run(call_id, session_id, tool_name, args).await;
        match &result {
            Ok(value) => {
                self.sessions.with(session_id, |s| s.record_action(tool_name, "success"));
                self.emit(session_id, "tool_result", json!({
                    "call_id": call_id,
                    "tool_name": tool_name,
                    "result": value,
                }));
            }
            Err(e) => {
                self.sessions.with(session_id, |s| {
                    s.record_action(tool_name, "failed");
                    s.record_failure(tool_name, e.kind(), &e.to_string());
                });
                let snippet: String = e.to_string().chars().take(200).collect();
                self.cmd_log(&format!("FAIL {} | {}", tool_name, snippet));
                self.emit(session_id, "tool_error", json!({
                    "call_id": call_id,
                    "tool_name": tool_name,
                    "error": {"kind": e.kind(), "message": e.to_string()},
                }));
            }
        }
        result
    }

    async fn run(&self, call_id: &str, session_id: &str, tool_name: &str, args: &Value) -> Result<Value, GatewayError> {
        let spec = self
            .registry
            .read()
            .get(tool_name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownTool(tool_name.to_string()))?;

        let policy = self.policies.policy_for(session_id);
        let targets = AccessTargets::from_args(&policy.working_dir, args);

        for path in &targets.paths {
            if let AccessDecision::Deny { reason } = check_path(&policy, &path.to_string_lossy())? {
                return Err(self.blocked(session_id, tool_name, reason));
            }
        }
        if let Some(command) = &targets.command {
            if let AccessDecision::Deny { reason } = check_shell_command(&policy, command)? {
                return Err(self.blocked(session_id, tool_name, reason));
            }
        }

        if let ApprovalOutcome::Decided { request_id, state } =
            self.approvals.request_approval(session_id, tool_name, args).await
        {
            self.emit(session_id, "approval_resolved", json!({
                "call_id": call_id,
                "request_id": request_id,
                "tool_name": tool_name,
                "state": state,
            }));
            let tool = tool_name.to_string();
            match state {
                ApprovalState::Denied => {
                    self.sessions.with(session_id, |s| s.record_manifest(tool_name, "BLOCKED", Some("approval denied")));
                    return Err(GatewayError::ApprovalDenied { tool, request_id });
                }
                ApprovalState::Expired => {
                    self.sessions.with(session_id, |s| s.record_manifest(tool_name, "BLOCKED", Some("approval expired")));
                    return Err(GatewayError::ApprovalExpired { tool, request_id });
                }
                _ => {}
            }
        }

        self.sessions.with(session_id, |s| s.record_manifest(tool_name, "ALLOWED", None));
        let result = match spec.source {
            ToolSource::Native => {
                let ctx = ExecContext { session_id: session_id.to_string(), working_dir: policy.working_dir.clone() };
                self.native.execute(tool_name, args, &ctx).await
            }
            ToolSource::Bridge => {
                self.bridge
                    .call_tool_in(&policy.working_dir.to_string_lossy(), tool_name, args)
                    .await
            }
            ToolSource::Remote => self.remote.call(session_id, tool_name, args).await,
        }?;

        self.sessions.with(session_id, |s| {
            for path in &targets.paths {
                let path = path.to_string_lossy();
                if is_write_tool(tool_name) {
                    s.track_write(&path);
                } else {
                    s.track_read(&path);
                }
            }
        });
        Ok(result)
    }

    fn blocked(&self, session_id: &str, tool_name: &str, reason: String) -> GatewayError {
        log::info!("BLOCKED {} for session {}: {}", tool_name, session_id, reason);
        self.sessions.with(session_id, |s| s.record_manifest(tool_name, "BLOCKED", Some(&reason)));
        GatewayError::PolicyDenied { reason }
    }

    fn emit(&self, session_id: &str, event_type: &str, data: Value) {
        let delivered = self.events.publish(Event::new(session_id, event_type, data));
        log::debug!("{} for session {} reached {} listeners", event_type, session_id, delivered);
    }

    fn cmd_log(&self, msg: &str) {
        let Some(path) = &self.command_log else { return };
        if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
            let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(f, "[{}] {}", ts, msg);
        }
    }

    // ========================================================================
    // INBOUND EVENTS
    // ========================================================================

    /// Dispatch every inbound `tool_call` event on the current runtime.
    /// Holds the router weakly so the multiplexer doesn't keep it alive.
    pub fn attach(self: &Arc<Self>, events: &EventMultiplexer) -> Result<Subscription, GatewayError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| GatewayError::Channel(format!("attach needs a tokio runtime: {}", e)))?;
        let router = Arc::downgrade(self);

        Ok(events.subscribe_all(move |event| {
            if event.event_type != TOOL_CALL_EVENT {
                return;
            }
            let Some(router) = router.upgrade() else { return };
            let Some(tool_name) = event.data.get("tool_name").and_then(|v| v.as_str()) else {
                log::warn!("tool_call event {} has no tool_name", event.id);
                return;
            };
            let tool_name = tool_name.to_string();
            let call_id = event
                .data
                .get("call_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| event.id.clone());
            let args = event.data.get("arguments").cloned().unwrap_or_else(|| json!({}));
            let session_id = event.session_id.clone();

            handle.spawn(async move {
                // outcome already reported as an event
                let _ = router.dispatch_call(&call_id, &session_id, &tool_name, &args).await;
            });
        }))
    }
}

/// Policy targets derived from tool arguments
#[derive(Debug, Default, PartialEq)]
pub struct AccessTargets {
    pub paths: Vec<PathBuf>,
    pub command: Option<String>,
}

impl AccessTargets {
    pub fn from_args(working_dir: &Path, args: &Value) -> Self {
        let paths = PATH_KEYS
            .iter()
            .filter_map(|k| args.get(*k).and_then(|v| v.as_str()))
            .map(|raw| resolve_path(working_dir, raw))
            .collect();
        let command = args.get("command").and_then(|v| v.as_str()).map(str::to_string);
        Self { paths, command }
    }
}

fn is_write_tool(name: &str) -> bool {
    ["create", "write", "replace", "edit", "delete"].iter().any(|w| name.contains(w))
}

/// Summarize tool params for logging (truncate large values)
fn param_summary(args: &Value) -> String {
    if let Some(cmd) = args.get("command").and_then(|v| v.as_str()) {
        return format!("cmd={}", truncate(cmd, 200));
    }
    if let Some(path) = PATH_KEYS.iter().find_map(|k| args.get(*k).and_then(|v| v.as_str())) {
        return match args.get("content").and_then(|v| v.as_str()) {
            Some(content) => format!("path={} content_len={}", path, content.len()),
            None => format!("path={}", path),
        };
    }
    truncate(&args.to_string(), 300)
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
