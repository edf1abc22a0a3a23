//! Cache entries with access statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// A cached value with absolute expiry. Stats are updated on read through a
/// shared reference, so they use atomics.
#[derive(Debug)]
pub struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    tag: Option<String>,
    hits: AtomicU64,
    /// Nanoseconds after `created_at` of the most recent read.
    last_access_nanos: AtomicU64,
}

/// Point-in-time view of an entry's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStats {
    pub hits: u64,
    pub age: Duration,
    pub ttl_remaining: Duration,
    pub tag: Option<String>,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration, tag: Option<String>, now: Instant) -> Self {
        Self {
            value,
            created_at: now,
            expires_at: now + ttl,
            tag,
            hits: AtomicU64::new(0),
            last_access_nanos: AtomicU64::new(0),
        }
    }

    /// Expired at or after the expiry instant; never served past it.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Record a read.
    pub fn touch(&self, now: Instant) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        let offset = now.saturating_duration_since(self.created_at).as_nanos();
        self.last_access_nanos
            .store(u64::try_from(offset).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Most recent read, or creation time if never read.
    pub fn last_accessed(&self) -> Instant {
        self.created_at + Duration::from_nanos(self.last_access_nanos.load(Ordering::Relaxed))
    }

    pub fn stats(&self, now: Instant) -> EntryStats {
        EntryStats {
            hits: self.hits(),
            age: now.saturating_duration_since(self.created_at),
            ttl_remaining: self.expires_at.saturating_duration_since(now),
            tag: self.tag.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_is_inclusive() {
        let now = Instant::now();
        let entry = CacheEntry::new(1u32, Duration::from_millis(500), None, now);
        assert!(!entry.is_expired(now + Duration::from_millis(499)));
        assert!(entry.is_expired(now + Duration::from_millis(500)));
    }

    #[test]
    fn test_touch_updates_stats() {
        let now = Instant::now();
        let entry = CacheEntry::new("v", Duration::from_secs(10), Some("book".into()), now);
        assert_eq!(entry.last_accessed(), now);

        entry.touch(now + Duration::from_secs(2));
        entry.touch(now + Duration::from_secs(3));

        let stats = entry.stats(now + Duration::from_secs(4));
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.age, Duration::from_secs(4));
        assert_eq!(stats.ttl_remaining, Duration::from_secs(6));
        assert_eq!(entry.last_accessed(), now + Duration::from_secs(3));
        assert_eq!(entry.tag(), Some("book"));
    }
}
