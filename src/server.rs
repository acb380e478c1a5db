// SPF Tool Gateway - JSON-RPC stdio Server
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// One JSON-RPC 2.0 message per line on stdin, one per line on stdout.
// stdout belongs to the protocol; logging goes to stderr.
// Tool calls run as their own tasks, so a call waiting on approval never
// stalls the loop that delivers the approval decision.
// Every multiplexed event is forwarded as a `notifications/event` message.
// The peer sees `approval_requested` only after declaring itself an
// approval presenter in `initialize`; until then the fallback decides.

use crate::approval::{ApprovalGateway, MultiplexerNotifier, SensitiveToolMatcher, UserDecision};
use crate::bridge::BridgeClient;
use crate::config::GatewayConfig;
use crate::dedupe::DedupeCache;
use crate::error::GatewayError;
use crate::events::{
    ChannelKey, ChannelKind, Event, EventMultiplexer, Scope, Subscription, Transport, UpstreamConnection,
    UpstreamSink, APPROVAL_REQUESTED,
};
use crate::native::LocalExecutor;
use crate::policy::AccessPolicy;
use crate::policy_store::PolicyStore;
use crate::remote::UnconfiguredRemote;
use crate::router::ToolRouter;
use crate::storage::GatewayStorage;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const PROTOCOL_VERSION: &str = "2024-11-05";
const SERVER_NAME: &str = "spf-tool-gateway";
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Session used when a request doesn't name one
const DEFAULT_SESSION: &str = "default";

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

// JSON-RPC error codes
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const GATEWAY_ERROR: i64 = -32000;

// ============================================================================
// STDIO TRANSPORT: upstream events arrive through `events/ingest`
// ============================================================================

/// Transport whose upstream is the stdio peer. Connecting registers a sink;
/// `events/ingest` pushes events into it.
#[derive(Default)]
pub struct StdioTransport {
    sinks: Arc<Mutex<HashMap<ChannelKey, UpstreamSink>>>,
}

struct StdioConnection {
    key: ChannelKey,
    sinks: Arc<Mutex<HashMap<ChannelKey, UpstreamSink>>>,
}

impl UpstreamConnection for StdioConnection {
    fn close(&mut self) {
        self.sinks.lock().remove(&self.key);
    }
}

impl Transport for StdioTransport {
    fn connect(
        &self,
        key: &ChannelKey,
        _credentials: Option<&str>,
        sink: UpstreamSink,
    ) -> Result<Box<dyn UpstreamConnection>, GatewayError> {
        self.sinks.lock().insert(key.clone(), sink);
        Ok(Box::new(StdioConnection { key: key.clone(), sinks: Arc::clone(&self.sinks) }))
    }
}

impl StdioTransport {
    fn sink(&self, key: &ChannelKey) -> Result<UpstreamSink, GatewayError> {
        self.sinks
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| GatewayError::Channel(format!("channel {} is not connected", key)))
    }

    /// Deliver an upstream event. Returns listeners reached.
    pub fn ingest(&self, key: &ChannelKey, event: Event) -> Result<usize, GatewayError> {
        Ok(self.sink(key)?.deliver(event))
    }

    pub fn report_degraded(&self, key: &ChannelKey, reason: &str) -> Result<(), GatewayError> {
        self.sink(key)?.degraded(reason);
        Ok(())
    }
}

// ============================================================================
// GATEWAY: one instance per process, passed by handle
// ============================================================================

pub struct Gateway {
    pub config: GatewayConfig,
    pub router: Arc<ToolRouter>,
    pub approvals: Arc<ApprovalGateway>,
    pub events: Arc<EventMultiplexer>,
    pub policies: Arc<PolicyStore>,
    pub transport: Arc<StdioTransport>,
    /// Set while the stdio peer presents approvals
    presenter: Mutex<Option<Subscription>>,
}

impl Gateway {
    /// Wire every component and run tool discovery
    pub async fn build(
        config: GatewayConfig,
        storage: Option<Arc<GatewayStorage>>,
        command_log: Option<PathBuf>,
    ) -> Result<Self, GatewayError> {
        config.validate()?;

        let working_dir = config
            .default_working_dir
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let transport = Arc::new(StdioTransport::default());
        let dedupe = DedupeCache::new(config.dedupe_ttl(), config.dedupe_capacity);
        let events = Arc::new(EventMultiplexer::new(transport.clone(), dedupe));

        let policies = Arc::new(PolicyStore::new(storage, config.policy_retention(), working_dir.clone()));
        if let Err(e) = policies.restore() {
            log::warn!("Could not restore customized policies: {}", e);
        }

        let matcher = SensitiveToolMatcher::compile(&config.sensitive_tools)?;
        let approvals = Arc::new(ApprovalGateway::new(matcher, config.approval_timeout(), config.fallback_auto_approve));
        approvals.set_notifier(Arc::new(MultiplexerNotifier::new(events.clone())));

        let bridge = Arc::new(BridgeClient::new(
            &config.bridge_base_url,
            config.bridge_timeout(),
            &working_dir.to_string_lossy(),
        )?);
        let native = Arc::new(LocalExecutor::new(config.max_write_size, config.shell_timeout()));
        let remote = Arc::new(UnconfiguredRemote::new(config.remote_tools.clone()));

        let mut router = ToolRouter::new(policies.clone(), approvals.clone(), events.clone(), native, bridge, remote);
        if let Some(path) = command_log {
            router = router.with_command_log(path);
        }
        let router = Arc::new(router);
        router.discover_tools().await;

        Ok(Self {
            config,
            router,
            approvals,
            events,
            policies,
            transport,
            presenter: Mutex::new(None),
        })
    }

    /// Make the stdio peer the approval presenter for every session.
    /// Returns false if it already is.
    pub fn present_approvals(&self, out: &Outbox) -> bool {
        let mut slot = self.presenter.lock();
        if slot.is_some() {
            return false;
        }
        let out = out.clone();
        *slot = Some(self.events.subscribe_approvals(Scope::All, move |event| {
            out.notify("notifications/event", json!(event));
        }));
        log::info!("stdio peer presents approvals");
        true
    }

    /// The peer can no longer answer; new requests take the fallback
    pub fn withdraw_approvals(&self) {
        if let Some(sub) = self.presenter.lock().take() {
            sub.unsubscribe();
            log::warn!("Approval presenter withdrawn, fallback applies to new requests");
        }
    }

    pub fn presents_approvals(&self) -> bool {
        self.presenter.lock().is_some()
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

/// Queue in front of the single stdout writer
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Value>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { tx }
    }

    fn send(&self, msg: Value) {
        if self.tx.send(msg).is_err() {
            log::debug!("stdout writer gone, message dropped");
        }
    }

    /// Send JSON-RPC response
    fn respond(&self, id: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }

    /// Send JSON-RPC error response
    fn error(&self, id: &Value, code: i64, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }));
    }

    fn gateway_error(&self, id: &Value, e: &GatewayError) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": GATEWAY_ERROR, "message": e.to_string(), "data": {"kind": e.kind()}},
        }));
    }

    fn notify(&self, method: &str, params: Value) {
        self.send(json!({"jsonrpc": "2.0", "method": method, "params": params}));
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

fn session_param(params: &Value) -> String {
    params
        .get("session_id")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_SESSION)
        .to_string()
}

fn channel_param(params: &Value) -> Result<ChannelKey, String> {
    let kind: ChannelKind = serde_json::from_value(params.get("kind").cloned().unwrap_or(Value::Null))
        .map_err(|_| "kind must be one of global, private, session".to_string())?;
    let identity = params.get("identity").and_then(|v| v.as_str()).unwrap_or("");
    if kind != ChannelKind::Global && identity.is_empty() {
        return Err("identity is required for private and session channels".to_string());
    }
    Ok(ChannelKey::new(kind, identity))
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Handle one inbound message. Tool calls and bridge discovery are
/// spawned; everything else answers before returning.
pub async fn handle_message(gw: &Arc<Gateway>, out: &Outbox, msg: Value) {
    let method = msg["method"].as_str().unwrap_or("").to_string();
    let id = msg["id"].clone();
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    log::debug!("Received: {}", method);

    match method.as_str() {
        "initialize" => {
            if params["capabilities"]["approvals"].as_bool().unwrap_or(false) {
                gw.present_approvals(out);
            }
            out.respond(&id, json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {},
                    "approvals": { "presenter": gw.presents_approvals() },
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": SERVER_VERSION,
                }
            }));
        }

        "notifications/initialized" => {
            // No response needed
        }

        "ping" => out.respond(&id, json!({})),

        "tools/list" => {
            let tools: Vec<Value> = gw.router.tools().iter().map(|t| t.to_listing()).collect();
            out.respond(&id, json!({ "tools": tools }));
        }

        "tools/call" => {
            let Some(name) = params["name"].as_str().map(str::to_string) else {
                out.error(&id, INVALID_PARAMS, "missing tool name");
                return;
            };
            let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            let session_id = session_param(&params);
            let call_id = params
                .get("call_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let gw = Arc::clone(gw);
            let out = out.clone();
            tokio::spawn(async move {
                match gw.router.dispatch_call(&call_id, &session_id, &name, &args).await {
                    Ok(result) => out.respond(&id, json!({
                        "content": [{"type": "text", "text": pretty(&result)}],
                        "isError": false,
                        "callId": call_id,
                    })),
                    Err(e) => out.respond(&id, json!({
                        "content": [{"type": "text", "text": format!("{}: {}", e.kind(), e)}],
                        "isError": true,
                        "callId": call_id,
                        "error": {"kind": e.kind(), "message": e.to_string()},
                    })),
                }
            });
        }

        "approvals/resolve" => {
            let request_id = params["request_id"].as_str().unwrap_or("");
            let decision = match params["decision"].as_str().unwrap_or("").parse::<UserDecision>() {
                Ok(d) => d,
                Err(e) => {
                    out.error(&id, INVALID_PARAMS, &e.to_string());
                    return;
                }
            };
            let applied = gw.approvals.resolve(request_id, decision);
            out.respond(&id, json!({
                "applied": applied,
                "state": gw.approvals.outcome(request_id),
            }));
        }

        "approvals/pending" => {
            out.respond(&id, json!({ "requests": gw.approvals.pending() }));
        }

        "sessions/open" => {
            let session_id = session_param(&params);
            let Some(dir) = params["working_dir"].as_str() else {
                out.error(&id, INVALID_PARAMS, "missing working_dir");
                return;
            };
            let policy = gw.policies.open_session(&session_id, Path::new(dir));
            out.respond(&id, json!({ "session_id": session_id, "policy": policy }));
        }

        "sessions/close" => {
            let Some(session_id) = params.get("session_id").and_then(|v| v.as_str()) else {
                out.error(&id, INVALID_PARAMS, "missing session_id");
                return;
            };
            out.respond(&id, json!({ "closed": gw.router.close_session(session_id) }));
        }

        "sessions/status" => {
            match params.get("session_id").and_then(|v| v.as_str()) {
                Some(session_id) => match gw.router.session(session_id) {
                    Some(session) => out.respond(&id, json!({
                        "session_id": session_id,
                        "summary": session.status_summary(),
                        "session": session,
                    })),
                    None => out.error(&id, INVALID_PARAMS, &format!("unknown session: {}", session_id)),
                },
                None => out.respond(&id, json!({ "sessions": gw.router.session_ids() })),
            }
        }

        "policy/get" => {
            let session_id = session_param(&params);
            out.respond(&id, json!({ "policy": gw.policies.policy_for(&session_id) }));
        }

        "policy/set" => {
            let session_id = session_param(&params);
            let result = if params["reset"].as_bool().unwrap_or(false) {
                gw.policies.reset(&session_id)
            } else {
                match serde_json::from_value::<AccessPolicy>(params["policy"].clone()) {
                    Ok(policy) => gw.policies.customize(&session_id, policy),
                    Err(e) => {
                        out.error(&id, INVALID_PARAMS, &format!("invalid policy: {}", e));
                        return;
                    }
                }
            };
            match result {
                Ok(policy) => out.respond(&id, json!({ "policy": policy })),
                Err(e) => out.gateway_error(&id, &e),
            }
        }

        "channels/connect" => {
            let key = match channel_param(&params) {
                Ok(k) => k,
                Err(msg) => return out.error(&id, INVALID_PARAMS, &msg),
            };
            let credentials = params["credentials"].as_str();
            match gw.events.connect_channel(key.kind, &key.identity, credentials) {
                Ok(()) => out.respond(&id, json!({
                    "channel": key.to_string(),
                    "state": gw.events.channel_state(key.kind, &key.identity),
                })),
                Err(e) => out.gateway_error(&id, &e),
            }
        }

        "channels/disconnect" => {
            let key = match channel_param(&params) {
                Ok(k) => k,
                Err(msg) => return out.error(&id, INVALID_PARAMS, &msg),
            };
            let disconnected = gw.events.disconnect(key.kind, &key.identity);
            out.respond(&id, json!({ "disconnected": disconnected }));
        }

        "channels/list" => {
            let channels: Vec<Value> = gw
                .events
                .channels()
                .into_iter()
                .map(|(key, state)| json!({"channel": key.to_string(), "state": state}))
                .collect();
            out.respond(&id, json!({ "channels": channels }));
        }

        "events/ingest" => {
            let key = match channel_param(&params) {
                Ok(k) => k,
                Err(msg) => return out.error(&id, INVALID_PARAMS, &msg),
            };
            let result = if let Some(reason) = params["degraded"].as_str() {
                gw.transport.report_degraded(&key, reason).map(|()| 0)
            } else {
                match serde_json::from_value::<Event>(params["event"].clone()) {
                    Ok(event) => gw.transport.ingest(&key, event),
                    Err(e) => return out.error(&id, INVALID_PARAMS, &format!("invalid event: {}", e)),
                }
            };
            match result {
                Ok(delivered) => out.respond(&id, json!({ "delivered": delivered })),
                Err(e) => out.gateway_error(&id, &e),
            }
        }

        "bridge/configure" => {
            let bridge = gw.router.bridge();
            if let Some(url) = params["base_url"].as_str() {
                if let Err(e) = bridge.set_base_url(url) {
                    return out.gateway_error(&id, &e);
                }
            }
            if let Some(ms) = params["timeout_ms"].as_u64() {
                if ms == 0 {
                    return out.error(&id, INVALID_PARAMS, "timeout_ms must be positive");
                }
                bridge.set_timeout(Duration::from_millis(ms));
            }
            // discovery can take the full bridge timeout; answer from a task
            let gw = Arc::clone(gw);
            let out = out.clone();
            tokio::spawn(async move {
                let tools = match gw.router.refresh_bridge_tools().await {
                    Ok(n) => json!(n),
                    Err(e) => {
                        log::warn!("Bridge refresh failed: {}", e);
                        Value::Null
                    }
                };
                let bridge = gw.router.bridge();
                out.respond(&id, json!({
                    "base_url": bridge.base_url(),
                    "timeout_ms": bridge.timeout().as_millis() as u64,
                    "bridge_tools": tools,
                }));
            });
        }

        _ => {
            if !id.is_null() {
                out.error(&id, METHOD_NOT_FOUND, &format!("Unknown method: {}", method));
            }
        }
    }
}

// ============================================================================
// MAIN LOOP
// ============================================================================

/// Serve JSON-RPC on stdio until stdin closes
pub async fn run(gw: Arc<Gateway>) -> anyhow::Result<()> {
    log::info!("Starting {} v{}", SERVER_NAME, SERVER_VERSION);
    log::info!(
        "Bridge: {} | approval timeout: {:?} | fallback_auto_approve: {}",
        gw.config.bridge_base_url,
        gw.config.approval_timeout(),
        gw.config.fallback_auto_approve,
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let out = Outbox::new(tx);

    let writer = {
        let gw = Arc::clone(&gw);
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(msg) = rx.recv().await {
                let mut line = msg.to_string();
                line.push('\n');
                if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                    log::warn!("stdout closed");
                    break;
                }
            }
            gw.withdraw_approvals();
        })
    };

    // approval requests go out through the presenter subscription only
    let forward = out.clone();
    let forwarder = gw.events.subscribe_all(move |event| {
        if event.event_type != APPROVAL_REQUESTED {
            forward.notify("notifications/event", json!(event));
        }
    });
    let inbound = gw.router.attach(&gw.events)?;

    let maintenance = {
        let gw = Arc::clone(&gw);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tick.tick().await;
                let purged = gw.events.purge_dedupe();
                if purged > 0 {
                    log::debug!("Purged {} dedupe entries", purged);
                }
                if let Err(e) = gw.policies.purge_expired() {
                    log::warn!("Policy purge failed: {}", e);
                }
                if let Some(idle) = gw.config.session_idle() {
                    let dropped = gw.router.purge_idle_sessions(idle);
                    if dropped > 0 {
                        log::info!("Forgot {} idle sessions", dropped);
                    }
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                log::warn!("stdin read error: {}", e);
                continue;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let msg: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("JSON parse error: {}", e);
                continue;
            }
        };

        handle_message(&gw, &out, msg).await;
    }

    log::info!("stdin closed, shutting down");
    maintenance.abort();
    forwarder.unsubscribe();
    inbound.unsubscribe();
    gw.withdraw_approvals();
    drop(out);
    // in-flight tool calls still hold outbox clones; don't wait on them
    writer.abort();
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn refused_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    async fn gateway(dir: &Path) -> Arc<Gateway> {
        gateway_with_fallback(dir, false).await
    }

    async fn gateway_with_fallback(dir: &Path, fallback_auto_approve: bool) -> Arc<Gateway> {
        let config = GatewayConfig {
            bridge_base_url: refused_url(),
            bridge_timeout_ms: 2_000,
            default_working_dir: Some(dir.to_string_lossy().to_string()),
            fallback_auto_approve,
            ..GatewayConfig::default()
        };
        Arc::new(Gateway::build(config, None, None).await.unwrap())
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    /// Accepts connections and never answers
    async fn silent_bridge() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{}", addr)
    }

    fn outbox() -> (Outbox, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Outbox::new(tx), rx)
    }

    async fn call(gw: &Arc<Gateway>, method: &str, params: Value) -> Value {
        let (out, mut rx) = outbox();
        handle_message(gw, &out, json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params})).await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn initialize_and_tools_list() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path()).await;

        let init = call(&gw, "initialize", json!({})).await;
        assert_eq!(init["result"]["serverInfo"]["name"], SERVER_NAME);

        let list = call(&gw, "tools/list", json!({})).await;
        let names: Vec<&str> = list["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(names.contains(&"read_file"));
        assert!(names.contains(&"execute_shell_command"));
    }

    #[tokio::test]
    async fn unknown_method_gets_error_but_notifications_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path()).await;
        let resp = call(&gw, "nope", json!({})).await;
        assert_eq!(resp["error"]["code"], METHOD_NOT_FOUND);

        let (out, mut rx) = outbox();
        handle_message(&gw, &out, json!({"jsonrpc": "2.0", "method": "notifications/initialized"})).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn tool_call_runs_and_reports_errors_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello\n").unwrap();
        let gw = gateway(dir.path()).await;

        let ok = call(&gw, "tools/call", json!({"name": "read_file", "arguments": {"file_path": "notes.txt"}})).await;
        assert_eq!(ok["result"]["isError"], false);
        assert!(ok["result"]["content"][0]["text"].as_str().unwrap().contains("hello"));

        let unknown = call(&gw, "tools/call", json!({"name": "nope", "arguments": {}})).await;
        assert_eq!(unknown["result"]["isError"], true);
        assert_eq!(unknown["result"]["error"]["kind"], "unknown_tool");

        let denied = call(&gw, "tools/call", json!({"name": "read_file", "arguments": {"file_path": ".env"}})).await;
        assert_eq!(denied["result"]["error"]["kind"], "policy_denied");
    }

    #[tokio::test]
    async fn ingested_events_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path()).await;

        let not_connected = call(&gw, "events/ingest", json!({
            "kind": "session", "identity": "s1",
            "event": {"id": "e1", "session_id": "s1", "event_type": "note", "timestamp": "2026-01-01T00:00:00Z"},
        }))
        .await;
        assert_eq!(not_connected["error"]["data"]["kind"], "channel_error");

        let connected = call(&gw, "channels/connect", json!({"kind": "session", "identity": "s1"})).await;
        assert_eq!(connected["result"]["state"], "connected");

        gw.events.subscribe_session("s1", |_| {});
        let event = json!({"id": "e2", "session_id": "s1", "event_type": "note", "timestamp": "2026-01-01T00:00:00Z"});
        let first = call(&gw, "events/ingest", json!({"kind": "session", "identity": "s1", "event": event})).await;
        let replay = call(&gw, "events/ingest", json!({"kind": "session", "identity": "s1", "event": event})).await;
        assert_eq!(first["result"]["delivered"], 1);
        assert_eq!(replay["result"]["delivered"], 0);

        let degraded = call(&gw, "events/ingest", json!({"kind": "session", "identity": "s1", "degraded": "socket reset"})).await;
        assert!(degraded.get("result").is_some());
        assert_eq!(gw.events.channel_state(ChannelKind::Session, "s1"), Some(crate::events::ChannelState::Degraded));

        let closed = call(&gw, "channels/disconnect", json!({"kind": "session", "identity": "s1"})).await;
        assert_eq!(closed["result"]["disconnected"], true);
    }

    #[tokio::test]
    async fn approval_can_be_resolved_over_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path()).await;

        let (out, mut rx) = outbox();
        handle_message(&gw, &out, json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {"capabilities": {"approvals": true}},
        }))
        .await;
        let init = recv(&mut rx).await;
        assert_eq!(init["result"]["capabilities"]["approvals"]["presenter"], true);

        handle_message(&gw, &out, json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": {"name": "create_file", "session_id": "s1", "arguments": {"file_path": "new.txt", "content": "hi"}},
        }))
        .await;

        let ask = recv(&mut rx).await;
        assert_eq!(ask["method"], "notifications/event");
        assert_eq!(ask["params"]["event_type"], APPROVAL_REQUESTED);
        let request_id = ask["params"]["data"]["id"].as_str().unwrap().to_string();

        let pending = call(&gw, "approvals/pending", json!({})).await;
        assert_eq!(pending["result"]["requests"].as_array().unwrap().len(), 1);

        let resolved = call(&gw, "approvals/resolve", json!({"request_id": request_id, "decision": "approved"})).await;
        assert_eq!(resolved["result"]["applied"], true);
        assert_eq!(resolved["result"]["state"], "approved");
        let again = call(&gw, "approvals/resolve", json!({"request_id": request_id, "decision": "denied"})).await;
        assert_eq!(again["result"]["applied"], false);
        assert_eq!(again["result"]["state"], "approved");

        let done = recv(&mut rx).await;
        assert_eq!(done["id"], 7);
        assert_eq!(done["result"]["isError"], false);
        assert_eq!(std::fs::read_to_string(dir.path().join("new.txt")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn without_a_presenter_the_fallback_decides() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway_with_fallback(dir.path(), true).await;
        // the same plain listeners `run` wires up
        let _inbound = gw.router.attach(&gw.events).unwrap();
        gw.events.subscribe_all(|_| {});

        let init = call(&gw, "initialize", json!({})).await;
        assert_eq!(init["result"]["capabilities"]["approvals"]["presenter"], false);

        let done = call(&gw, "tools/call", json!({
            "name": "create_file", "session_id": "s1", "arguments": {"file_path": "auto.txt", "content": "ok"},
        }))
        .await;
        assert_eq!(done["result"]["isError"], false);
        assert_eq!(std::fs::read_to_string(dir.path().join("auto.txt")).unwrap(), "ok");

        // a presenter that went away hands decisions back to the fallback
        let (out, _rx) = outbox();
        assert!(gw.present_approvals(&out));
        gw.withdraw_approvals();
        let done = call(&gw, "tools/call", json!({
            "name": "create_file", "session_id": "s1", "arguments": {"file_path": "again.txt", "content": "ok"},
        }))
        .await;
        assert_eq!(done["result"]["isError"], false);
    }

    #[tokio::test]
    async fn bridge_refresh_does_not_hold_up_other_requests() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path()).await;
        let url = silent_bridge().await;

        let (out, mut rx) = outbox();
        let configure = handle_message(&gw, &out, json!({
            "jsonrpc": "2.0", "id": 9, "method": "bridge/configure",
            "params": {"base_url": url, "timeout_ms": 60_000},
        }));
        tokio::time::timeout(Duration::from_secs(1), configure).await.unwrap();

        let resolved = call(&gw, "approvals/resolve", json!({"request_id": "missing", "decision": "approved"})).await;
        assert_eq!(resolved["result"]["applied"], false);
        // discovery against the silent bridge is still in flight
        assert!(rx.try_recv().is_err());
        assert_eq!(gw.router.bridge().timeout(), Duration::from_millis(60_000));
    }

    #[tokio::test]
    async fn sessions_can_be_closed() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path()).await;
        let opened = call(&gw, "sessions/open", json!({"session_id": "s9", "working_dir": dir.path()})).await;
        assert_eq!(opened["result"]["session_id"], "s9");

        let closed = call(&gw, "sessions/close", json!({"session_id": "s9"})).await;
        assert_eq!(closed["result"]["closed"], true);
        let again = call(&gw, "sessions/close", json!({"session_id": "s9"})).await;
        assert_eq!(again["result"]["closed"], false);

        let missing = call(&gw, "sessions/close", json!({})).await;
        assert_eq!(missing["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn policy_set_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let gw = gateway(dir.path()).await;
        let current = call(&gw, "policy/get", json!({"session_id": "s1"})).await;
        let mut policy = current["result"]["policy"].clone();
        policy["blacklist"] = json!(["**/*.txt"]);

        let set = call(&gw, "policy/set", json!({"session_id": "s1", "policy": policy})).await;
        assert_eq!(set["result"]["policy"]["is_customized"], true);

        let denied = call(&gw, "tools/call", json!({"name": "read_file", "session_id": "s1", "arguments": {"file_path": "a.txt"}})).await;
        assert_eq!(denied["result"]["error"]["kind"], "policy_denied");

        let reset = call(&gw, "policy/set", json!({"session_id": "s1", "reset": true})).await;
        assert_eq!(reset["result"]["policy"]["is_customized"], false);
    }
}
