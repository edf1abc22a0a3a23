//! Tier B: general TTL cache with tags.
//!
//! # Responsibilities
//! - Serve reads until their absolute expiry
//! - Bulk invalidation by tag, and a sweep for expired entries
//! - Single population per key under concurrent misses
//! - Entry-count capacity bound
//!
//! # Design Decisions
//! - Population serializes per key (an async mutex per key being populated),
//!   not across the whole cache, so slow keys do not block fast ones
//! - At capacity, expired entries go first, then the least recently read
//! - A failed population caches nothing

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::cache::entry::{CacheEntry, EntryStats};
use crate::cache::sweep::run_sweep_loop;
use crate::config::TaggedCacheConfig;
use crate::error::FlowResult;
use crate::lifecycle::cancel::CancelToken;
use crate::observability::metrics::{CacheTier, Observer};

/// TTL cache with tag-based invalidation.
pub struct TaggedCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    populating: DashMap<String, Arc<AsyncMutex<()>>>,
    default_ttl: Duration,
    max_entries: usize,
    observer: Arc<dyn Observer>,
}

impl<V> TaggedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: &TaggedCacheConfig, observer: Arc<dyn Observer>) -> Self {
        Self {
            entries: DashMap::new(),
            populating: DashMap::new(),
            default_ttl: config.default_ttl(),
            max_entries: config.max_entries.max(1),
            observer,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Read a live entry. An expired entry is removed on the spot.
    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.lookup(key, Instant::now());
        match value {
            Some(_) => self.observer.on_cache_hit(CacheTier::Tagged),
            None => self.observer.on_cache_miss(CacheTier::Tagged),
        }
        value
    }

    fn lookup(&self, key: &str, now: Instant) -> Option<V> {
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                entry.touch(now);
                return Some(entry.value().value().clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    /// Insert or replace `key`. `ttl` defaults to the configured TTL.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>, tag: Option<&str>) {
        let now = Instant::now();
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            self.make_room(now);
        }

        let entry = CacheEntry::new(
            value,
            ttl.unwrap_or(self.default_ttl),
            tag.map(str::to_string),
            now,
        );
        self.entries.insert(key.to_string(), entry);
    }

    fn make_room(&self, now: Instant) {
        let expired = self.remove_expired(now);
        if expired > 0 && self.entries.len() < self.max_entries {
            tracing::debug!(expired, "Purged expired entries to make room");
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_accessed())
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            tracing::debug!(key = %key, "Evicted least recently used entry");
        }
    }

    /// Serve `key` if live, otherwise populate it with `factory`.
    ///
    /// Concurrent callers missing the same key wait for the first one's
    /// population and then read its result; `factory` runs once.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        tag: Option<&str>,
        factory: F,
        cancel: &CancelToken,
    ) -> FlowResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlowResult<V>>,
    {
        if let Some(value) = self.lookup(key, Instant::now()) {
            self.observer.on_cache_hit(CacheTier::Tagged);
            return Ok(value);
        }

        let lock = self
            .populating
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let result = {
            match cancel.run(lock.lock()).await {
                Err(cancelled) => Err(cancelled),
                Ok(_held) => match self.lookup(key, Instant::now()) {
                    Some(value) => {
                        tracing::trace!(key = %key, "Populated by a concurrent caller");
                        self.observer.on_cache_hit(CacheTier::Tagged);
                        Ok(value)
                    }
                    None => {
                        self.observer.on_cache_miss(CacheTier::Tagged);
                        let computed = cancel.run(factory()).await.and_then(|r| r);
                        if let Ok(value) = &computed {
                            self.set(key, value.clone(), ttl, tag);
                        }
                        computed
                    }
                },
            }
        };

        drop(lock);
        self.populating
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry carrying `tag`. Returns the number removed.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let matches = entry.tag() == Some(tag);
            if matches {
                removed += 1;
            }
            !matches
        });
        tracing::debug!(tag = %tag, removed, "Invalidated by tag");
        removed
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn invalidate_expired_entries(&self) -> usize {
        self.remove_expired(Instant::now())
    }

    fn remove_expired(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let expired = entry.is_expired(now);
            if expired {
                removed += 1;
            }
            !expired
        });
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry_stats(&self, key: &str) -> Option<EntryStats> {
        self.entries
            .get(key)
            .map(|entry| entry.stats(Instant::now()))
    }

    /// Sweep expired entries every `interval` until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancelToken) {
        run_sweep_loop(CacheTier::Tagged, interval, cancel, || {
            (self.invalidate_expired_entries(), self.len())
        })
        .await;
    }
}
