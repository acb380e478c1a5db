// SPF Tool Gateway - Session Policy Store
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Owns the per-session AccessPolicy map. Sole writer.
// Sessions start from a default derived from their working directory.
// Customized policies are persisted and restored for the retention window.
// Uncustomized sessions are forgotten on close or after going idle.

use crate::error::GatewayError;
use crate::policy::AccessPolicy;
use crate::storage::GatewayStorage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct SessionPolicy {
    policy: AccessPolicy,
    last_used: DateTime<Utc>,
}

impl SessionPolicy {
    fn new(policy: AccessPolicy) -> Self {
        Self { policy, last_used: Utc::now() }
    }
}

pub struct PolicyStore {
    policies: Mutex<HashMap<String, SessionPolicy>>,
    storage: Option<Arc<GatewayStorage>>,
    retention: chrono::Duration,
    default_working_dir: PathBuf,
}

impl PolicyStore {
    pub fn new(storage: Option<Arc<GatewayStorage>>, retention: chrono::Duration, default_working_dir: PathBuf) -> Self {
        Self {
            policies: Mutex::new(HashMap::new()),
            storage,
            retention,
            default_working_dir,
        }
    }

    /// Load customized policies that are still inside the retention window
    pub fn restore(&self) -> Result<usize, GatewayError> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let restored = storage
            .load_policies(self.retention, Utc::now())
            .map_err(|e| GatewayError::Storage(e.to_string()))?;
        let count = restored.len();
        let mut policies = self.policies.lock();
        for (session_id, policy) in restored {
            policies.insert(session_id, SessionPolicy::new(policy));
        }
        log::info!("Restored {} customized session policies", count);
        Ok(count)
    }

    /// Register a session's working directory. Creates the default policy
    /// unless the session already has one (customized policies win).
    pub fn open_session(&self, session_id: &str, working_dir: &Path) -> AccessPolicy {
        let mut policies = self.policies.lock();
        let entry = policies
            .entry(session_id.to_string())
            .or_insert_with(|| SessionPolicy::new(AccessPolicy::for_working_dir(working_dir)));
        entry.last_used = Utc::now();
        entry.policy.clone()
    }

    /// Current policy for a session, creating the default one on first use
    pub fn policy_for(&self, session_id: &str) -> AccessPolicy {
        let default_dir = self.default_working_dir.clone();
        self.open_session(session_id, &default_dir)
    }

    /// Replace a session's policy. Marks it customized and persists it.
    pub fn customize(&self, session_id: &str, mut policy: AccessPolicy) -> Result<AccessPolicy, GatewayError> {
        let now = Utc::now();
        policy.is_customized = true;
        policy.customized_at = Some(now);

        if let Some(storage) = &self.storage {
            storage
                .save_policy(session_id, &policy, now)
                .map_err(|e| GatewayError::Storage(e.to_string()))?;
        }
        self.policies.lock().insert(session_id.to_string(), SessionPolicy::new(policy.clone()));
        log::info!("Session {} policy customized", session_id);
        Ok(policy)
    }

    /// Drop back to the working-directory default
    pub fn reset(&self, session_id: &str) -> Result<AccessPolicy, GatewayError> {
        let working_dir = self
            .policies
            .lock()
            .get(session_id)
            .map(|p| p.policy.working_dir.clone())
            .unwrap_or_else(|| self.default_working_dir.clone());
        if let Some(storage) = &self.storage {
            storage
                .delete_policy(session_id)
                .map_err(|e| GatewayError::Storage(e.to_string()))?;
        }
        let policy = AccessPolicy::for_working_dir(&working_dir);
        self.policies.lock().insert(session_id.to_string(), SessionPolicy::new(policy.clone()));
        Ok(policy)
    }

    /// Forget a session. A customized policy stays until its retention
    /// window ends, so a reconnecting session gets it back.
    pub fn close_session(&self, session_id: &str) -> bool {
        let mut policies = self.policies.lock();
        match policies.get(session_id) {
            Some(entry) if !entry.policy.is_customized => policies.remove(session_id).is_some(),
            _ => false,
        }
    }

    /// Forget uncustomized sessions not used within `max_idle`. Returns their ids.
    pub fn purge_idle(&self, max_idle: chrono::Duration, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - max_idle;
        let mut removed = Vec::new();
        self.policies.lock().retain(|id, entry| {
            let keep = entry.policy.is_customized || entry.last_used > cutoff;
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed
    }

    /// Purge persisted policies past retention, and forget their in-memory copies
    pub fn purge_expired(&self) -> Result<usize, GatewayError> {
        let now = Utc::now();
        let cutoff = now - self.retention;
        let removed = match &self.storage {
            Some(storage) => storage
                .purge_expired_policies(self.retention, now)
                .map_err(|e| GatewayError::Storage(e.to_string()))?,
            None => 0,
        };
        self.policies.lock().retain(|_, entry| match (entry.policy.is_customized, entry.policy.customized_at) {
            (true, Some(at)) => at > cutoff,
            _ => true,
        });
        Ok(removed)
    }

    pub fn session_count(&self) -> usize {
        self.policies.lock().len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
