//! Process-local pointer from a platform user to their active session.
//!
//! Advisory only: every hit is re-validated against the store, and a miss
//! always falls back to store-driven resolution.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use koe_core::clock::Clock;
use koe_core::ids::{ChatSessionId, UserId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub session_id: ChatSessionId,
    pub user_id: UserId,
    pub last_touch: DateTime<Utc>,
}

pub trait SessionCache: Send + Sync {
    /// Entry for `key`, or `None` if absent or older than the TTL. Stale
    /// entries are dropped on read.
    fn get(&self, key: &str) -> Option<CacheEntry>;

    /// Insert or refresh an entry, stamped with the current time.
    fn put(&self, key: &str, session_id: &ChatSessionId, user_id: &UserId);

    fn remove(&self, key: &str);

    fn clear(&self);
}

/// TTL cache with lazy eviction. No background sweeper.
pub struct TtlSessionCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TtlSessionCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SessionCache for TtlSessionCache {
    fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now();
        let entry = self.entries.get(key)?.clone();
        if now - entry.last_touch <= self.ttl {
            Some(entry)
        } else {
            // Only evict if nobody refreshed it in between.
            self.entries
                .remove_if(key, |_, current| current.last_touch == entry.last_touch);
            None
        }
    }

    fn put(&self, key: &str, session_id: &ChatSessionId, user_id: &UserId) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                session_id: session_id.clone(),
                user_id: user_id.clone(),
                last_touch: self.clock.now(),
            },
        );
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    fn clear(&self) {
        self.entries.clear();
    }
}

/// Cache that never remembers anything; forces the store path every time.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCache;

impl SessionCache for NoopCache {
    fn get(&self, _key: &str) -> Option<CacheEntry> {
        None
    }

    fn put(&self, _key: &str, _session_id: &ChatSessionId, _user_id: &UserId) {}

    fn remove(&self, _key: &str) {}

    fn clear(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use koe_core::clock::ManualClock;

    fn cache() -> (TtlSessionCache, ManualClock) {
        let clock = ManualClock::default();
        let cache = TtlSessionCache::new(Duration::seconds(600), Arc::new(clock.clone()));
        (cache, clock)
    }

    #[test]
    fn hit_within_ttl() {
        let (cache, clock) = cache();
        let sid = ChatSessionId::new();
        cache.put("U1", &sid, &UserId::new());
        clock.advance(Duration::seconds(600));
        assert_eq!(cache.get("U1").map(|e| e.session_id), Some(sid));
    }

    #[test]
    fn stale_entry_is_evicted_on_read() {
        let (cache, clock) = cache();
        cache.put("U1", &ChatSessionId::new(), &UserId::new());
        clock.advance(Duration::seconds(601));
        assert!(cache.get("U1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn put_refreshes_touch() {
        let (cache, clock) = cache();
        let sid = ChatSessionId::new();
        let uid = UserId::new();
        cache.put("U1", &sid, &uid);
        clock.advance(Duration::seconds(500));
        cache.put("U1", &sid, &uid);
        clock.advance(Duration::seconds(500));
        assert!(cache.get("U1").is_some());
    }

    #[test]
    fn remove_and_clear() {
        let (cache, _) = cache();
        cache.put("U1", &ChatSessionId::new(), &UserId::new());
        cache.put("U2", &ChatSessionId::new(), &UserId::new());
        cache.remove("U1");
        assert!(cache.get("U1").is_none());
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn noop_never_hits() {
        let cache = NoopCache;
        cache.put("U1", &ChatSessionId::new(), &UserId::new());
        assert!(cache.get("U1").is_none());
    }
}
