// SPF Tool Gateway - Approval Gateway
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Holds sensitive tool calls for a human decision.
//   pending -> approved | denied        (explicit resolve)
//   pending -> expired                  (timer)
//   pending -> auto_approved | denied   (approval subsystem unreachable,
//                                        per fallback_auto_approve)
// Terminal states are final. Requests are keyed by id, never serialized
// globally. First writer wins: a resolve that lands before the timer
// clears it; a timer that lands first makes `expired` sticky.

use crate::error::GatewayError;
use crate::events::{Event, EventMultiplexer, APPROVAL_REQUESTED};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Resolved outcomes kept for `outcome()` lookups
const HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Expired,
    AutoApproved,
}

impl ApprovalState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether the tool call may proceed
    pub fn permits(self) -> bool {
        matches!(self, Self::Approved | Self::AutoApproved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
            Self::AutoApproved => "auto_approved",
        }
    }
}

/// What a human can answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDecision {
    Approved,
    Denied,
}

impl FromStr for UserDecision {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" | "approve" => Ok(Self::Approved),
            "denied" | "deny" => Ok(Self::Denied),
            other => Err(GatewayError::InvalidConfig(format!("unknown decision '{}'", other))),
        }
    }
}

impl From<UserDecision> for ApprovalState {
    fn from(d: UserDecision) -> Self {
        match d {
            UserDecision::Approved => Self::Approved,
            UserDecision::Denied => Self::Denied,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub state: ApprovalState,
}

/// Result of `request_approval`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Tool is not sensitive, no request was opened
    NotRequired,
    Decided { request_id: String, state: ApprovalState },
}

// ============================================================================
// SENSITIVE TOOL MATCHER
// ============================================================================

/// Compiled once at startup: exact names + wildcard patterns
#[derive(Debug, Clone, Default)]
pub struct SensitiveToolMatcher {
    exact: HashSet<String>,
    patterns: Vec<Regex>,
}

impl SensitiveToolMatcher {
    /// Entries without `*` are exact names. `delete_*` style entries allow
    /// one wildcard. Entries containing `.*` are taken as anchored regexes.
    pub fn compile(entries: &[String]) -> Result<Self, GatewayError> {
        let mut matcher = Self::default();
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if !entry.contains('*') {
                matcher.exact.insert(entry.to_string());
                continue;
            }
            let source = if entry.contains(".*") {
                entry.to_string()
            } else {
                let parts: Vec<&str> = entry.split('*').collect();
                if parts.len() != 2 {
                    return Err(GatewayError::InvalidConfig(format!(
                        "sensitive tool pattern '{}' may contain only one wildcard", entry
                    )));
                }
                format!("{}.*{}", regex::escape(parts[0]), regex::escape(parts[1]))
            };
            let anchored = format!("^(?:{})$", source.trim_start_matches('^').trim_end_matches('$'));
            let re = Regex::new(&anchored).map_err(|e| {
                GatewayError::InvalidConfig(format!("sensitive tool pattern '{}': {}", entry, e))
            })?;
            matcher.patterns.push(re);
        }
        Ok(matcher)
    }

    pub fn is_sensitive(&self, tool_name: &str) -> bool {
        self.exact.contains(tool_name) || self.patterns.iter().any(|re| re.is_match(tool_name))
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

/// Presents a request to whoever decides (a UI). An Err means the approval
/// subsystem is unreachable and the fallback policy applies.
pub trait ApprovalNotifier: Send + Sync {
    fn present(&self, request: &ApprovalRequest) -> Result<(), GatewayError>;
}

/// Publishes `approval_requested` on the request's session channel.
/// Unreachable when no approval presenter covers the session; plain
/// subscribers (loggers, forwarders, the router itself) don't count.
pub struct MultiplexerNotifier {
    events: Arc<EventMultiplexer>,
}

impl MultiplexerNotifier {
    pub fn new(events: Arc<EventMultiplexer>) -> Self {
        Self { events }
    }
}

impl ApprovalNotifier for MultiplexerNotifier {
    fn present(&self, request: &ApprovalRequest) -> Result<(), GatewayError> {
        if self.events.approval_presenters(&request.session_id) == 0 {
            return Err(GatewayError::Channel(format!(
                "no approval presenter for session {}", request.session_id
            )));
        }
        let data = serde_json::to_value(request)
            .map_err(|e| GatewayError::Channel(format!("approval request encode: {}", e)))?;
        self.events.publish(Event::new(&request.session_id, APPROVAL_REQUESTED, data));
        Ok(())
    }
}

// ============================================================================
// GATEWAY
// ============================================================================

struct PendingApproval {
    request: ApprovalRequest,
    responder: Option<oneshot::Sender<ApprovalState>>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ApprovalTable {
    pending: HashMap<String, PendingApproval>,
    history: VecDeque<(String, ApprovalState)>,
}

pub struct ApprovalGateway {
    matcher: SensitiveToolMatcher,
    timeout: Duration,
    fallback_auto_approve: bool,
    notifier: RwLock<Option<Arc<dyn ApprovalNotifier>>>,
    table: Arc<Mutex<ApprovalTable>>,
}

impl ApprovalGateway {
    pub fn new(matcher: SensitiveToolMatcher, timeout: Duration, fallback_auto_approve: bool) -> Self {
        Self {
            matcher,
            timeout,
            fallback_auto_approve,
            notifier: RwLock::new(None),
            table: Arc::new(Mutex::new(ApprovalTable::default())),
        }
    }

    pub fn set_notifier(&self, notifier: Arc<dyn ApprovalNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    pub fn is_sensitive(&self, tool_name: &str) -> bool {
        self.matcher.is_sensitive(tool_name)
    }

    /// Open a request for a sensitive tool and wait for its resolution.
    /// Only this caller is suspended; other requests proceed independently.
    pub async fn request_approval(&self, session_id: &str, tool_name: &str, arguments: &Value) -> ApprovalOutcome {
        if !self.matcher.is_sensitive(tool_name) {
            return ApprovalOutcome::NotRequired;
        }

        let now = Utc::now();
        let timeout_at = now
            + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            created_at: now,
            timeout_at,
            state: ApprovalState::Pending,
        };
        let id = request.id.clone();

        let (tx, rx) = oneshot::channel();
        self.table.lock().pending.insert(
            id.clone(),
            PendingApproval { request: request.clone(), responder: Some(tx), timer: None },
        );

        let timer = {
            let table = Arc::clone(&self.table);
            let id = id.clone();
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                finish(&table, &id, ApprovalState::Expired);
            })
        };
        {
            let mut table = self.table.lock();
            match table.pending.get_mut(&id) {
                Some(entry) => entry.timer = Some(timer),
                None => timer.abort(),
            }
        }

        log::info!("Approval {} opened: {} (session {}, timeout {:?})", id, tool_name, session_id, self.timeout);

        let notifier = self.notifier.read().clone();
        let presented = match notifier {
            Some(n) => n.present(&request),
            None => Err(GatewayError::Channel("no approval notifier attached".to_string())),
        };
        if let Err(e) = presented {
            let fallback = if self.fallback_auto_approve {
                ApprovalState::AutoApproved
            } else {
                ApprovalState::Denied
            };
            log::warn!("Approval subsystem unreachable ({}), fallback -> {}", e, fallback.as_str());
            finish(&self.table, &id, fallback);
        }

        // A dropped sender without an outcome fails closed
        let state = rx.await.unwrap_or(ApprovalState::Denied);
        ApprovalOutcome::Decided { request_id: id, state }
    }

    /// Record a human decision. Returns false (and changes nothing) when the
    /// request is unknown or already terminal.
    pub fn resolve(&self, request_id: &str, decision: UserDecision) -> bool {
        let applied = finish(&self.table, request_id, decision.into());
        if !applied {
            log::debug!("Approval {} resolve ignored: not pending", request_id);
        }
        applied
    }

    /// Live requests, oldest first
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut list: Vec<ApprovalRequest> = self
            .table
            .lock()
            .pending
            .values()
            .map(|p| p.request.clone())
            .collect();
        list.sort_by_key(|r| r.created_at);
        list
    }

    /// Current state of a live or recently resolved request
    pub fn outcome(&self, request_id: &str) -> Option<ApprovalState> {
        let table = self.table.lock();
        if table.pending.contains_key(request_id) {
            return Some(ApprovalState::Pending);
        }
        table
            .history
            .iter()
            .rev()
            .find(|(id, _)| id == request_id)
            .map(|(_, state)| *state)
    }
}

/// Single transition out of `pending`. The table lock makes the first
/// caller win; later callers see no pending entry and return false.
fn finish(table: &Mutex<ApprovalTable>, request_id: &str, state: ApprovalState) -> bool {
    let entry = {
        let mut table = table.lock();
        let Some(entry) = table.pending.remove(request_id) else {
            return false;
        };
        table.history.push_back((request_id.to_string(), state));
        while table.history.len() > HISTORY_LIMIT {
            table.history.pop_front();
        }
        entry
    };

    if state != ApprovalState::Expired {
        if let Some(timer) = entry.timer {
            timer.abort();
        }
    }
    if let Some(tx) = entry.responder {
        // Caller may have gone away; the outcome stays in history
        let _ = tx.send(state);
    }
    log::info!("Approval {} ({}) -> {}", request_id, entry.request.tool_name, state.as_str());
    true
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AcceptingNotifier;
    impl ApprovalNotifier for AcceptingNotifier {
        fn present(&self, _request: &ApprovalRequest) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    struct UnreachableNotifier;
    impl ApprovalNotifier for UnreachableNotifier {
        fn present(&self, _request: &ApprovalRequest) -> Result<(), GatewayError> {
            Err(GatewayError::Channel("ui offline".into()))
        }
    }

    fn gateway(timeout_ms: u64, fallback: bool) -> Arc<ApprovalGateway> {
        let matcher = SensitiveToolMatcher::compile(&["str_replace_editor".to_string(), "delete_*".to_string()]).unwrap();
        let gw = ApprovalGateway::new(matcher, Duration::from_millis(timeout_ms), fallback);
        gw.set_notifier(Arc::new(AcceptingNotifier));
        Arc::new(gw)
    }

    fn spawn_request(gw: &Arc<ApprovalGateway>, tool: &str) -> JoinHandle<ApprovalOutcome> {
        let gw = Arc::clone(gw);
        let tool = tool.to_string();
        tokio::spawn(async move { gw.request_approval("s1", &tool, &json!({"path": "/repo/a.rs"})).await })
    }

    async fn wait_pending(gw: &ApprovalGateway, count: usize) -> Vec<ApprovalRequest> {
        for _ in 0..100 {
            let pending = gw.pending();
            if pending.len() >= count {
                return pending;
            }
            tokio::task::yield_now().await;
        }
        panic!("requests never became pending");
    }

    fn state_of(outcome: ApprovalOutcome) -> ApprovalState {
        match outcome {
            ApprovalOutcome::Decided { state, .. } => state,
            ApprovalOutcome::NotRequired => panic!("expected a decision"),
        }
    }

    #[test]
    fn matcher_exact_and_wildcard() {
        let m = SensitiveToolMatcher::compile(&[
            "str_replace_editor".to_string(),
            "delete_*".to_string(),
            "^exec.*shell$".to_string(),
        ])
        .unwrap();
        assert!(m.is_sensitive("str_replace_editor"));
        assert!(!m.is_sensitive("str_replace_editor_v2"));
        assert!(m.is_sensitive("delete_file"));
        assert!(m.is_sensitive("delete_"));
        assert!(!m.is_sensitive("undelete_file"));
        assert!(m.is_sensitive("execute_shell"));
        assert!(!m.is_sensitive("read_file"));
    }

    #[test]
    fn matcher_rejects_multiple_wildcards() {
        assert!(SensitiveToolMatcher::compile(&["*_file_*".to_string()]).is_err());
    }

    #[tokio::test]
    async fn non_sensitive_tool_bypasses() {
        let gw = gateway(1000, false);
        assert_eq!(gw.request_approval("s1", "read_file", &json!({})).await, ApprovalOutcome::NotRequired);
        assert!(gw.pending().is_empty());
    }

    struct OfflineTransport;
    impl crate::events::Transport for OfflineTransport {
        fn connect(
            &self,
            _key: &crate::events::ChannelKey,
            _credentials: Option<&str>,
            _sink: crate::events::UpstreamSink,
        ) -> Result<Box<dyn crate::events::UpstreamConnection>, GatewayError> {
            Err(GatewayError::Channel("offline".into()))
        }
    }

    #[tokio::test]
    async fn plain_subscribers_do_not_make_approvals_reachable() {
        use crate::events::{ChannelKey, Scope};

        let events = Arc::new(EventMultiplexer::new(Arc::new(OfflineTransport), crate::dedupe::DedupeCache::default()));
        events.subscribe_all(|_| {});
        let gw = gateway(60_000, true);
        gw.set_notifier(Arc::new(MultiplexerNotifier::new(events.clone())));
        let outcome = gw.request_approval("s1", "str_replace_editor", &json!({})).await;
        assert_eq!(state_of(outcome), ApprovalState::AutoApproved);

        // a presenter for the session decides instead of the fallback
        let decider = Arc::clone(&gw);
        events.subscribe_approvals(Scope::Channel(ChannelKey::session("s1")), move |e| {
            if let Some(id) = e.data["id"].as_str() {
                decider.resolve(id, UserDecision::Denied);
            }
        });
        let outcome = gw.request_approval("s1", "str_replace_editor", &json!({})).await;
        assert_eq!(state_of(outcome), ApprovalState::Denied);

        // other sessions still fall back
        let outcome = gw.request_approval("s2", "delete_file", &json!({})).await;
        assert_eq!(state_of(outcome), ApprovalState::AutoApproved);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_expires_at_timeout_not_before() {
        let gw = gateway(1000, false);
        let handle = spawn_request(&gw, "str_replace_editor");
        wait_pending(&gw, 1).await;

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(!handle.is_finished(), "expired before the timeout");

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(state_of(handle.await.unwrap()), ApprovalState::Expired);
        assert!(gw.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_approval_wins_and_resolve_is_idempotent() {
        let gw = gateway(1000, false);
        let handle = spawn_request(&gw, "str_replace_editor");
        let id = wait_pending(&gw, 1).await[0].id.clone();

        assert!(gw.resolve(&id, UserDecision::Approved));
        assert!(!gw.resolve(&id, UserDecision::Denied));
        assert_eq!(state_of(handle.await.unwrap()), ApprovalState::Approved);

        // Timer was cleared: nothing changes after the deadline
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(gw.outcome(&id), Some(ApprovalState::Approved));
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_just_before_deadline_wins() {
        let gw = gateway(1000, false);
        let handle = spawn_request(&gw, "delete_branch");
        let id = wait_pending(&gw, 1).await[0].id.clone();

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(gw.resolve(&id, UserDecision::Denied));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state_of(handle.await.unwrap()), ApprovalState::Denied);
        assert_eq!(gw.outcome(&id), Some(ApprovalState::Denied));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_is_sticky() {
        let gw = gateway(1000, false);
        let handle = spawn_request(&gw, "str_replace_editor");
        let id = wait_pending(&gw, 1).await[0].id.clone();

        assert_eq!(state_of(handle.await.unwrap()), ApprovalState::Expired);
        assert!(!gw.resolve(&id, UserDecision::Approved));
        assert_eq!(gw.outcome(&id), Some(ApprovalState::Expired));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_resolve_out_of_order() {
        let gw = gateway(60_000, false);
        let first = spawn_request(&gw, "str_replace_editor");
        let second = spawn_request(&gw, "delete_file");
        let pending = wait_pending(&gw, 2).await;
        let id_of = |tool: &str| pending.iter().find(|r| r.tool_name == tool).unwrap().id.clone();

        assert!(gw.resolve(&id_of("delete_file"), UserDecision::Denied));
        assert_eq!(state_of(second.await.unwrap()), ApprovalState::Denied);
        assert!(!first.is_finished());

        assert!(gw.resolve(&id_of("str_replace_editor"), UserDecision::Approved));
        assert_eq!(state_of(first.await.unwrap()), ApprovalState::Approved);
    }

    #[tokio::test]
    async fn unreachable_subsystem_uses_fallback() {
        let matcher = SensitiveToolMatcher::compile(&["str_replace_editor".to_string()]).unwrap();

        let auto = ApprovalGateway::new(matcher.clone(), Duration::from_secs(60), true);
        auto.set_notifier(Arc::new(UnreachableNotifier));
        assert_eq!(
            state_of(auto.request_approval("s1", "str_replace_editor", &json!({})).await),
            ApprovalState::AutoApproved
        );

        let strict = ApprovalGateway::new(matcher, Duration::from_secs(60), false);
        // no notifier at all counts as unreachable too
        assert_eq!(
            state_of(strict.request_approval("s1", "str_replace_editor", &json!({})).await),
            ApprovalState::Denied
        );
        assert!(strict.pending().is_empty());
    }

    #[test]
    fn decision_parsing() {
        assert_eq!("approved".parse::<UserDecision>().unwrap(), UserDecision::Approved);
        assert_eq!("denied".parse::<UserDecision>().unwrap(), UserDecision::Denied);
        assert!("maybe".parse::<UserDecision>().is_err());
        assert!(ApprovalState::AutoApproved.permits());
        assert!(!ApprovalState::Expired.permits());
        assert!(ApprovalState::Expired.is_terminal());
    }
}
