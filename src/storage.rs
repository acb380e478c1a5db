// SPF Tool Gateway - LMDB Storage
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// The only state that survives a restart:
// - preferences: simple key-value strings
// - policies: customized session policies, purged after the retention window

use crate::policy::AccessPolicy;
use anyhow::Result;
use chrono::{DateTime, Utc};
use heed::types::*;
use heed::{Database, Env, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;

const MAX_DB_SIZE: usize = 10 * 1024 * 1024; // 10MB: prefs and policies are small

/// Policy record as stored in LMDB
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredPolicy {
    policy: AccessPolicy,
    saved_at: DateTime<Utc>,
}

/// LMDB storage for gateway state
pub struct GatewayStorage {
    env: Env,
    /// Preferences: key → value
    preferences: Database<Str, Str>,
    /// Customized policies: session id → JSON StoredPolicy
    policies: Database<Str, Str>,
}

impl GatewayStorage {
    /// Open or create LMDB at the given path
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAX_DB_SIZE)
                .max_dbs(4)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let preferences = env.create_database(&mut wtxn, Some("preferences"))?;
        let policies = env.create_database(&mut wtxn, Some("policies"))?;
        wtxn.commit()?;

        log::info!("Gateway LMDB opened at {:?}", path);
        Ok(Self { env, preferences, policies })
    }

    // ========================================================================
    // PREFERENCES
    // ========================================================================

    pub fn put_pref(&self, key: &str, value: &str) -> Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.preferences.put(&mut wtxn, key, value)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_pref(&self, key: &str) -> Result<Option<String>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.preferences.get(&rtxn, key)?.map(|s| s.to_string()))
    }

    pub fn delete_pref(&self, key: &str) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let deleted = self.preferences.delete(&mut wtxn, key)?;
        wtxn.commit()?;
        Ok(deleted)
    }

    // ========================================================================
    // CUSTOMIZED POLICIES
    // ========================================================================

    pub fn save_policy(&self, session_id: &str, policy: &AccessPolicy, now: DateTime<Utc>) -> Result<()> {
        let record = StoredPolicy { policy: policy.clone(), saved_at: now };
        let json = serde_json::to_string(&record)?;
        let mut wtxn = self.env.write_txn()?;
        self.policies.put(&mut wtxn, session_id, &json)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn delete_policy(&self, session_id: &str) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let deleted = self.policies.delete(&mut wtxn, session_id)?;
        wtxn.commit()?;
        Ok(deleted)
    }

    /// Remove policies saved more than `retention` before `now`.
    /// Unreadable records are purged too. Returns the count removed.
    pub fn purge_expired_policies(&self, retention: chrono::Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - retention;
        let expired: Vec<String> = {
            let rtxn = self.env.read_txn()?;
            let mut keys = Vec::new();
            for result in self.policies.iter(&rtxn)? {
                let (key, json) = result?;
                let keep = serde_json::from_str::<StoredPolicy>(json)
                    .map(|r| r.saved_at > cutoff)
                    .unwrap_or(false);
                if !keep {
                    keys.push(key.to_string());
                }
            }
            keys
        };

        if expired.is_empty() {
            return Ok(0);
        }
        let mut wtxn = self.env.write_txn()?;
        for key in &expired {
            self.policies.delete(&mut wtxn, key)?;
        }
        wtxn.commit()?;
        log::info!("Purged {} expired session policies", expired.len());
        Ok(expired.len())
    }

    /// Purge expired records, then return what's left
    pub fn load_policies(&self, retention: chrono::Duration, now: DateTime<Utc>) -> Result<Vec<(String, AccessPolicy)>> {
        self.purge_expired_policies(retention, now)?;
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for result in self.policies.iter(&rtxn)? {
            let (key, json) = result?;
            let record: StoredPolicy = serde_json::from_str(json)?;
            out.push((key.to_string(), record.policy));
        }
        Ok(out)
    }

    /// (preferences, policies) entry counts
    pub fn stats(&self) -> Result<(u64, u64)> {
        let rtxn = self.env.read_txn()?;
        let prefs = self.preferences.stat(&rtxn)?.entries as u64;
        let policies = self.policies.stat(&rtxn)?.entries as u64;
        Ok((prefs, policies))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn preferences_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let storage = GatewayStorage::open(dir.path())?;
        assert_eq!(storage.get_pref("theme")?, None);
        storage.put_pref("theme", "dark")?;
        assert_eq!(storage.get_pref("theme")?.as_deref(), Some("dark"));
        assert!(storage.delete_pref("theme")?);
        assert!(!storage.delete_pref("theme")?);
        Ok(())
    }

    #[test]
    fn policies_survive_reopen_within_retention() -> Result<()> {
        let dir = tempdir()?;
        let now = Utc::now();
        let mut policy = AccessPolicy::for_working_dir(Path::new("/nonexistent-spf-repo"));
        policy.is_customized = true;
        {
            let storage = GatewayStorage::open(dir.path())?;
            storage.save_policy("s1", &policy, now)?;
        }
        let storage = GatewayStorage::open(dir.path())?;
        let loaded = storage.load_policies(chrono::Duration::days(7), now + chrono::Duration::days(6))?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "s1");
        assert_eq!(loaded[0].1, policy);
        Ok(())
    }

    #[test]
    fn policies_purged_after_retention() -> Result<()> {
        let dir = tempdir()?;
        let storage = GatewayStorage::open(dir.path())?;
        let now = Utc::now();
        let policy = AccessPolicy::for_working_dir(Path::new("/nonexistent-spf-repo"));
        storage.save_policy("old", &policy, now - chrono::Duration::days(8))?;
        storage.save_policy("fresh", &policy, now - chrono::Duration::days(1))?;

        assert_eq!(storage.purge_expired_policies(chrono::Duration::days(7), now)?, 1);
        let loaded = storage.load_policies(chrono::Duration::days(7), now)?;
        assert_eq!(loaded.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(), vec!["fresh"]);
        assert_eq!(storage.stats()?, (0, 1));
        Ok(())
    }
}
