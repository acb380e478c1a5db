// SPF Tool Gateway - Event Multiplexer
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// One upstream connection per (channel kind, identity). Any number of
// local subscribers per channel. Every event passes the dedupe cache by
// id before fan-out, so a transport that silently reconnects and replays
// never double-delivers.
//
// Subscription lifecycle is decoupled from transport lifecycle: dropping
// the last listener keeps the connection; only disconnect() closes it.

use crate::dedupe::DedupeCache;
use crate::error::GatewayError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Synthetic event type sent to subscribers when an upstream degrades
pub const CHANNEL_DEGRADED: &str = "channel_degraded";

/// Event type that asks a human to approve a sensitive tool call
pub const APPROVAL_REQUESTED: &str = "approval_requested";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Global,
    /// Per-user
    Private,
    /// Per-session
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub kind: ChannelKind,
    pub identity: String,
}

impl ChannelKey {
    pub fn new(kind: ChannelKind, identity: &str) -> Self {
        match kind {
            ChannelKind::Global => Self::global(),
            _ => Self { kind, identity: identity.to_string() },
        }
    }

    pub fn global() -> Self {
        Self { kind: ChannelKind::Global, identity: String::new() }
    }

    pub fn private(user_id: &str) -> Self {
        Self { kind: ChannelKind::Private, identity: user_id.to_string() }
    }

    pub fn session(session_id: &str) -> Self {
        Self { kind: ChannelKind::Session, identity: session_id.to_string() }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ChannelKind::Global => write!(f, "global"),
            ChannelKind::Private => write!(f, "private:{}", self.identity),
            ChannelKind::Session => write!(f, "session:{}", self.identity),
        }
    }
}

/// Upstream event record. Never mutated here, only forwarded or dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub session_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl Event {
    /// Locally produced event with a fresh id
    pub fn new(session_id: &str, event_type: &str, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// What a subscriber listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every event from every channel
    All,
    Channel(ChannelKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Connected,
    Degraded,
}

// ============================================================================
// TRANSPORT CONTRACT
// ============================================================================

/// Live upstream connection. Reconnect after failure is the transport's job.
pub trait UpstreamConnection: Send {
    fn close(&mut self);
}

pub trait Transport: Send + Sync {
    /// Open the upstream for `key`. Events go into `sink`; the sink may be
    /// used from any thread, before or after this call returns.
    fn connect(
        &self,
        key: &ChannelKey,
        credentials: Option<&str>,
        sink: UpstreamSink,
    ) -> Result<Box<dyn UpstreamConnection>, GatewayError>;
}

/// Transport-side handle into the multiplexer. Inert once its connection
/// has been disconnected.
#[derive(Clone)]
pub struct UpstreamSink {
    key: ChannelKey,
    connection_id: u64,
    hub: Weak<Hub>,
}

impl UpstreamSink {
    pub fn channel(&self) -> &ChannelKey {
        &self.key
    }

    /// Hand an upstream event to the multiplexer. Returns the number of
    /// listeners reached (0 for duplicates and stale connections).
    pub fn deliver(&self, event: Event) -> usize {
        let Some(hub) = self.hub.upgrade() else { return 0 };
        if !hub.mark_live(&self.key, self.connection_id) {
            log::debug!("{}: dropping event {} from stale connection", self.key, event.id);
            return 0;
        }
        hub.dispatch(&self.key, &event)
    }

    /// Report an upstream failure. Subscribers get a channel_degraded event.
    pub fn degraded(&self, reason: &str) {
        let Some(hub) = self.hub.upgrade() else { return };
        if !hub.mark_degraded(&self.key, self.connection_id) {
            return;
        }
        log::warn!("{}: upstream degraded: {}", self.key, reason);
        let session_id = match self.key.kind {
            ChannelKind::Session => self.key.identity.as_str(),
            _ => "",
        };
        let event = Event::new(
            session_id,
            CHANNEL_DEGRADED,
            json!({"channel": self.key.to_string(), "reason": reason}),
        );
        hub.dispatch(&self.key, &event);
    }
}

// ============================================================================
// HUB: shared state behind the multiplexer, sinks and subscriptions
// ============================================================================

struct ListenerEntry {
    id: u64,
    scope: Scope,
    /// Approval presenters only see `approval_requested`
    presenter: bool,
    callback: Listener,
}

impl ListenerEntry {
    fn wants(&self, key: &ChannelKey, event: &Event) -> bool {
        let in_scope = match &self.scope {
            Scope::All => true,
            Scope::Channel(k) => k == key,
        };
        in_scope && (!self.presenter || event.event_type == APPROVAL_REQUESTED)
    }
}

struct ChannelEntry {
    connection_id: u64,
    connection: Option<Box<dyn UpstreamConnection>>,
    state: ChannelState,
}

struct Hub {
    dedupe: Mutex<DedupeCache>,
    listeners: Mutex<Vec<ListenerEntry>>,
    channels: Mutex<HashMap<ChannelKey, ChannelEntry>>,
    next_id: AtomicU64,
}

impl Hub {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Dedupe, then fan out. Callbacks run outside every lock so they may
    /// subscribe, unsubscribe or publish.
    fn dispatch(&self, key: &ChannelKey, event: &Event) -> usize {
        if self.dedupe.lock().seen(&event.id) {
            log::debug!("{}: duplicate event {} dropped", key, event.id);
            return 0;
        }
        let targets: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .filter(|l| l.wants(key, event))
            .map(|l| Arc::clone(&l.callback))
            .collect();
        for callback in &targets {
            callback(event);
        }
        targets.len()
    }

    /// True if `connection_id` is the live connection for `key`.
    /// A degraded channel that delivers again is connected again.
    fn mark_live(&self, key: &ChannelKey, connection_id: u64) -> bool {
        let mut channels = self.channels.lock();
        match channels.get_mut(key) {
            Some(entry) if entry.connection_id == connection_id => {
                if entry.state == ChannelState::Degraded {
                    log::info!("{}: upstream recovered", key);
                }
                entry.state = ChannelState::Connected;
                true
            }
            _ => false,
        }
    }

    fn mark_degraded(&self, key: &ChannelKey, connection_id: u64) -> bool {
        let mut channels = self.channels.lock();
        match channels.get_mut(key) {
            Some(entry) if entry.connection_id == connection_id => {
                entry.state = ChannelState::Degraded;
                true
            }
            _ => false,
        }
    }
}

/// Removal token for one listener. `unsubscribe` is idempotent.
/// Dropping the token does not unsubscribe.
pub struct Subscription {
    id: u64,
    hub: Weak<Hub>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.listeners.lock().retain(|l| l.id != self.id);
        }
    }
}

// ============================================================================
// MULTIPLEXER
// ============================================================================

pub struct EventMultiplexer {
    hub: Arc<Hub>,
    transport: Arc<dyn Transport>,
}

impl EventMultiplexer {
    pub fn new(transport: Arc<dyn Transport>, dedupe: DedupeCache) -> Self {
        Self {
            hub: Arc::new(Hub {
                dedupe: Mutex::new(dedupe),
                listeners: Mutex::new(Vec::new()),
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
            transport,
        }
    }

    pub fn subscribe<F>(&self, scope: Scope, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_listener(scope, false, Arc::new(callback))
    }

    /// Register a party that decides approvals (a UI). It receives only
    /// `approval_requested` events in its scope. Plain subscribers never
    /// make the approval subsystem reachable; presenters do.
    pub fn subscribe_approvals<F>(&self, scope: Scope, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add_listener(scope, true, Arc::new(callback))
    }

    fn add_listener(&self, scope: Scope, presenter: bool, callback: Listener) -> Subscription {
        let id = self.hub.next_id();
        self.hub.listeners.lock().push(ListenerEntry { id, scope, presenter, callback });
        Subscription { id, hub: Arc::downgrade(&self.hub) }
    }

    /// Listen to one session's channel
    pub fn subscribe_session<F>(&self, session_id: &str, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(Scope::Channel(ChannelKey::session(session_id)), callback)
    }

    /// Listen to everything
    pub fn subscribe_all<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(Scope::All, callback)
    }

    pub fn listener_count(&self) -> usize {
        self.hub.listeners.lock().len()
    }

    /// Approval presenters that would see a request for `session_id`
    pub fn approval_presenters(&self, session_id: &str) -> usize {
        let key = ChannelKey::session(session_id);
        self.hub
            .listeners
            .lock()
            .iter()
            .filter(|l| l.presenter)
            .filter(|l| match &l.scope {
                Scope::All => true,
                Scope::Channel(k) => *k == key,
            })
            .count()
    }

    /// Open the upstream for (kind, identity). A second call for a
    /// connected pair is a no-op.
    pub fn connect_channel(&self, kind: ChannelKind, identity: &str, credentials: Option<&str>) -> Result<(), GatewayError> {
        let key = ChannelKey::new(kind, identity);
        let connection_id = {
            let mut channels = self.hub.channels.lock();
            if channels.contains_key(&key) {
                log::debug!("{}: already connected", key);
                return Ok(());
            }
            let connection_id = self.hub.next_id();
            channels.insert(
                key.clone(),
                ChannelEntry { connection_id, connection: None, state: ChannelState::Connecting },
            );
            connection_id
        };

        let sink = UpstreamSink { key: key.clone(), connection_id, hub: Arc::downgrade(&self.hub) };
        // Not under the channels lock: the transport may deliver synchronously
        match self.transport.connect(&key, credentials, sink) {
            Ok(connection) => {
                let mut channels = self.hub.channels.lock();
                match channels.get_mut(&key) {
                    Some(entry) if entry.connection_id == connection_id => {
                        entry.connection = Some(connection);
                        if entry.state == ChannelState::Connecting {
                            entry.state = ChannelState::Connected;
                        }
                        log::info!("{}: upstream connected", key);
                    }
                    _ => {
                        // disconnected while connecting
                        drop(channels);
                        let mut connection = connection;
                        connection.close();
                    }
                }
                Ok(())
            }
            Err(e) => {
                let mut channels = self.hub.channels.lock();
                if channels.get(&key).map(|c| c.connection_id) == Some(connection_id) {
                    channels.remove(&key);
                }
                log::warn!("{}: connect failed: {}", key, e);
                Err(e)
            }
        }
    }

    /// Close the upstream for (kind, identity). Returns false if not connected.
    pub fn disconnect(&self, kind: ChannelKind, identity: &str) -> bool {
        let key = ChannelKey::new(kind, identity);
        let entry = self.hub.channels.lock().remove(&key);
        match entry {
            Some(mut entry) => {
                if let Some(connection) = entry.connection.as_mut() {
                    connection.close();
                }
                log::info!("{}: upstream disconnected", key);
                true
            }
            None => false,
        }
    }

    pub fn channel_state(&self, kind: ChannelKind, identity: &str) -> Option<ChannelState> {
        let key = ChannelKey::new(kind, identity);
        self.hub.channels.lock().get(&key).map(|c| c.state)
    }

    pub fn channels(&self) -> Vec<(ChannelKey, ChannelState)> {
        self.hub
            .channels
            .lock()
            .iter()
            .map(|(k, c)| (k.clone(), c.state))
            .collect()
    }

    /// Local output path: deliver a gateway-produced event to its session's
    /// subscribers and to `All` subscribers. Returns listeners reached.
    pub fn publish(&self, event: Event) -> usize {
        let key = if event.session_id.is_empty() {
            ChannelKey::global()
        } else {
            ChannelKey::session(&event.session_id)
        };
        self.hub.dispatch(&key, &event)
    }

    /// Proactive dedupe purge, returns entries removed
    pub fn purge_dedupe(&self) -> usize {
        self.hub.dedupe.lock().purge_expired()
    }
}

// ============================================================================
// TESTS
// ============================================================================
