//! Short-lived response memoization.
//!
//! Entries expire lazily: a read that finds an entry older than the TTL
//! evicts it and reports a miss.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::modules::clock::{SharedClock, chrono_duration};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    payload: V,
    inserted_at: DateTime<Utc>,
}

/// TTL cache keyed by logical request identity. Clones share entries.
#[derive(Debug, Clone)]
pub struct ResponseCache<V> {
    ttl: Duration,
    clock: SharedClock,
    entries: Arc<RwLock<HashMap<String, CacheEntry<V>>>>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            ttl,
            clock,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_stale(&self, entry: &CacheEntry<V>, now: DateTime<Utc>) -> bool {
        now - entry.inserted_at > chrono_duration(self.ttl)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        {
            let guard = self.entries.read().ok()?;
            match guard.get(key) {
                None => return None,
                Some(entry) if !self.is_stale(entry, now) => return Some(entry.payload.clone()),
                Some(_) => {}
            }
        }

        if let Ok(mut guard) = self.entries.write()
            && guard
                .get(key)
                .is_some_and(|entry| self.is_stale(entry, now))
        {
            guard.remove(key);
            log::trace!("evicted stale cache entry {key}");
        }
        None
    }

    pub fn set(&self, key: impl Into<String>, payload: V) {
        let entry = CacheEntry {
            payload,
            inserted_at: self.clock.now(),
        };
        if let Ok(mut guard) = self.entries.write() {
            guard.insert(key.into(), entry);
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries
            .write()
            .ok()
            .and_then(|mut guard| guard.remove(key))
            .map(|entry| entry.payload)
    }

    /// Drop every stale entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let Ok(mut guard) = self.entries.write() else {
            return 0;
        };
        let before = guard.len();
        guard.retain(|_, entry| !self.is_stale(entry, now));
        before - guard.len()
    }

    /// Number of stored entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.entries.write() {
            guard.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::ManualClock;

    fn cache(clock: &ManualClock) -> ResponseCache<String> {
        ResponseCache::new(DEFAULT_CACHE_TTL, Arc::new(clock.clone()))
    }

    #[test]
    fn value_survives_until_ttl() {
        let clock = ManualClock::default();
        let cache = cache(&clock);
        cache.set("profile:alice", "payload".to_string());

        clock.advance(Duration::from_secs(4 * 60 + 59));
        assert_eq!(cache.get("profile:alice").as_deref(), Some("payload"));
    }

    #[test]
    fn stale_read_is_absent_and_evicts() {
        let clock = ManualClock::default();
        let cache = cache(&clock);
        cache.set("profile:alice", "payload".to_string());

        clock.advance(Duration::from_secs(5 * 60 + 1));
        assert_eq!(cache.get("profile:alice"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn set_refreshes_insertion_time() {
        let clock = ManualClock::default();
        let cache = cache(&clock);
        cache.set("k", "old".to_string());
        clock.advance(Duration::from_secs(4 * 60));
        cache.set("k", "new".to_string());
        clock.advance(Duration::from_secs(4 * 60));
        assert_eq!(cache.get("k").as_deref(), Some("new"));
    }

    #[test]
    fn purge_drops_only_stale_entries() {
        let clock = ManualClock::default();
        let cache = cache(&clock);
        cache.set("a", "1".to_string());
        clock.advance(Duration::from_secs(3 * 60));
        cache.set("b", "2".to_string());
        clock.advance(Duration::from_secs(3 * 60));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("b").as_deref(), Some("2"));
    }
}
