// SPF Tool Gateway - Dedupe Cache
// Copyright 2026 Joseph Stone - All Rights Reserved
//
// Time-boxed set membership. The multiplexer keys it by event id to
// drop replays after an upstream reconnect.
//
// Eviction is FIFO by first insertion, not LRU: a repeat hit inside the
// TTL does not move the key. Purging is pull-based, no timer.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_CAPACITY: usize = 2000;

#[derive(Debug)]
pub struct DedupeCache {
    ttl: Duration,
    capacity: usize,
    /// key -> time the key was recorded
    entries: HashMap<String, Instant>,
    /// insertion order, oldest at the front
    order: VecDeque<String>,
}

impl DedupeCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true if `key` was already recorded within the TTL.
    /// Otherwise records it and returns false.
    pub fn seen(&mut self, key: &str) -> bool {
        self.seen_at(key, Instant::now())
    }

    pub(crate) fn seen_at(&mut self, key: &str, now: Instant) -> bool {
        if let Some(recorded) = self.entries.get(key) {
            if now.saturating_duration_since(*recorded) <= self.ttl {
                return true;
            }
            // Stale: re-record at the back of the eviction order
            self.entries.remove(key);
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.remove(pos);
            }
        }

        self.purge_expired_at(now);

        self.entries.insert(key.to_string(), now);
        self.order.push_back(key.to_string());

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                log::debug!("dedupe: evicted {} (capacity {})", oldest, self.capacity);
            }
        }
        false
    }

    /// Remove every entry older than the TTL. Returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&mut self, now: Instant) -> usize {
        // Insertion order == timestamp order, so expired entries sit at the front
        let mut removed = 0;
        while let Some(front) = self.order.front() {
            let expired = self
                .entries
                .get(front)
                .map(|t| now.saturating_duration_since(*t) > self.ttl)
                .unwrap_or(true);
            if !expired {
                break;
            }
            if let Some(key) = self.order.pop_front() {
                self.entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_hit_within_ttl_is_duplicate() {
        let mut cache = DedupeCache::new(Duration::from_secs(30), 10);
        let t0 = Instant::now();
        assert!(!cache.seen_at("evt-1", t0));
        assert!(cache.seen_at("evt-1", t0 + Duration::from_secs(5)));
    }

    #[test]
    fn hit_after_ttl_from_first_call_is_fresh() {
        let mut cache = DedupeCache::new(Duration::from_secs(30), 10);
        let t0 = Instant::now();
        assert!(!cache.seen_at("evt-1", t0));
        assert!(cache.seen_at("evt-1", t0 + Duration::from_secs(1)));
        assert!(!cache.seen_at("evt-1", t0 + Duration::from_secs(31)));
        // and it is recorded again
        assert!(cache.seen_at("evt-1", t0 + Duration::from_secs(32)));
    }

    #[test]
    fn capacity_evicts_first_inserted() {
        let mut cache = DedupeCache::new(Duration::from_secs(30), 3);
        let t0 = Instant::now();
        for key in ["a", "b", "c"] {
            assert!(!cache.seen_at(key, t0));
        }
        assert!(!cache.seen_at("d", t0));
        assert_eq!(cache.len(), 3);
        assert!(!cache.seen_at("a", t0), "a should have been evicted");
        // inserting a again evicted b
        assert!(cache.seen_at("c", t0));
        assert!(cache.seen_at("d", t0));
    }

    #[test]
    fn repeat_hit_does_not_refresh_eviction_order() {
        let mut cache = DedupeCache::new(Duration::from_secs(30), 2);
        let t0 = Instant::now();
        cache.seen_at("a", t0);
        cache.seen_at("b", t0);
        // hit a again; LRU would now evict b, FIFO still evicts a
        assert!(cache.seen_at("a", t0 + Duration::from_secs(1)));
        cache.seen_at("c", t0 + Duration::from_secs(2));
        assert!(cache.seen_at("b", t0 + Duration::from_secs(3)));
        assert!(!cache.seen_at("a", t0 + Duration::from_secs(3)));
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut cache = DedupeCache::new(Duration::from_secs(30), 50);
        let t0 = Instant::now();
        for i in 0..500 {
            cache.seen_at(&format!("k{}", i), t0);
            assert!(cache.len() <= 50);
        }
    }

    #[test]
    fn purge_removes_only_expired() {
        let mut cache = DedupeCache::new(Duration::from_millis(100), 10);
        let t0 = Instant::now();
        cache.seen_at("old-1", t0);
        cache.seen_at("old-2", t0);
        cache.seen_at("new", t0 + Duration::from_millis(80));
        assert_eq!(cache.purge_expired_at(t0 + Duration::from_millis(150)), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_resets() {
        let mut cache = DedupeCache::default();
        cache.seen("x");
        cache.clear();
        assert!(cache.is_empty());
        assert!(!cache.seen("x"));
    }
}
