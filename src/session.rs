// SPF Tool Gateway - Session Audit
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// In-memory audit trail per session. Nothing here survives a restart.
// Tracks: action_count, files_read, files_written, manifest, failures.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MANIFEST_LIMIT: usize = 200;
const FAILURE_LIMIT: usize = 50;

/// Audit state of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub action_count: u64,
    pub files_read: Vec<String>,
    pub files_written: Vec<String>,
    pub last_tool: Option<String>,
    pub last_result: Option<String>,
    pub started: DateTime<Utc>,
    pub last_action: Option<DateTime<Utc>>,
    pub manifest: Vec<ManifestEntry>,
    pub failures: Vec<FailureEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub action: String, // "ALLOWED" or "BLOCKED"
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub kind: String,
    pub error: String,
}

impl Session {
    pub fn new() -> Self {
        Self {
            action_count: 0,
            files_read: Vec::new(),
            files_written: Vec::new(),
            last_tool: None,
            last_result: None,
            started: Utc::now(),
            last_action: None,
            manifest: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn track_read(&mut self, path: &str) {
        if !self.files_read.iter().any(|p| p == path) {
            self.files_read.push(path.to_string());
        }
    }

    pub fn track_write(&mut self, path: &str) {
        if !self.files_written.iter().any(|p| p == path) {
            self.files_written.push(path.to_string());
        }
    }

    /// Record a completed tool call
    pub fn record_action(&mut self, tool: &str, result: &str) {
        self.action_count += 1;
        self.last_tool = Some(tool.to_string());
        self.last_result = Some(result.to_string());
        self.last_action = Some(Utc::now());
    }

    /// Record a gate decision (allowed/blocked)
    pub fn record_manifest(&mut self, tool: &str, action: &str, reason: Option<&str>) {
        self.manifest.push(ManifestEntry {
            timestamp: Utc::now(),
            tool: tool.to_string(),
            action: action.to_string(),
            reason: reason.map(|s| s.to_string()),
        });
        if self.manifest.len() > MANIFEST_LIMIT {
            self.manifest.remove(0);
        }
    }

    pub fn record_failure(&mut self, tool: &str, kind: &str, error: &str) {
        self.failures.push(FailureEntry {
            timestamp: Utc::now(),
            tool: tool.to_string(),
            kind: kind.to_string(),
            error: error.to_string(),
        });
        if self.failures.len() > FAILURE_LIMIT {
            self.failures.remove(0);
        }
    }

    /// Latest of start, completed action, gate decision or failure
    pub fn last_activity(&self) -> DateTime<Utc> {
        let decided = self.manifest.last().map(|m| m.timestamp);
        let failed = self.failures.last().map(|f| f.timestamp);
        [self.last_action, decided, failed]
            .into_iter()
            .flatten()
            .fold(self.started, |latest, t| latest.max(t))
    }

    pub fn status_summary(&self) -> String {
        format!(
            "Actions: {} | Reads: {} | Writes: {} | Blocked: {} | Failures: {} | Last: {}",
            self.action_count,
            self.files_read.len(),
            self.files_written.len(),
            self.manifest.iter().filter(|m| m.action == "BLOCKED").count(),
            self.failures.len(),
            self.last_tool.as_deref().unwrap_or("none"),
        )
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// All live sessions, keyed by session id. Sole owner of the audit state.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the session, creating it on first use
    pub fn with<R>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut sessions = self.sessions.lock();
        f(sessions.entry(session_id.to_string()).or_default())
    }

    pub fn snapshot(&self, session_id: &str) -> Option<Session> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    /// Drop sessions with no activity within `max_idle`. Returns their ids.
    pub fn purge_idle(&self, max_idle: chrono::Duration, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - max_idle;
        let mut removed = Vec::new();
        self.sessions.lock().retain(|id, session| {
            let keep = session.last_activity() > cutoff;
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ============================================================================
// TESTS
// ============================================================================
