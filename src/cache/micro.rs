//! Tier A: micro-cache for hot reads.
//!
//! # Responsibilities
//! - Absorb near-simultaneous duplicate reads (tickers, order books)
//! - Guarantee at most one in-flight fetch per key
//! - Bypass entirely when switched off
//!
//! # Design Decisions
//! - A key's slot is either a ready entry or a pending shared fetch; callers
//!   arriving during a fetch join it instead of dispatching again
//! - The fetch publishes its own result, so a fetch whose first caller gave
//!   up still lands in the cache if anyone else drove it to completion
//! - A pending fetch is counted by its waiters; when the last one leaves the
//!   slot is dropped and the fetch with it, releasing any gate it queued on
//! - Failures remove the pending slot and are never cached
//! - Expiry is checked at read time; the sweeper reclaims keys never read again

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::cache::entry::CacheEntry;
use crate::cache::sweep::run_sweep_loop;
use crate::error::FlowResult;
use crate::lifecycle::cancel::CancelToken;
use crate::observability::metrics::{CacheTier, Observer};

type SharedFetch<V> = Shared<BoxFuture<'static, FlowResult<V>>>;

struct PendingFetch<V> {
    generation: u64,
    fetch: SharedFetch<V>,
    waiters: Arc<AtomicUsize>,
}

impl<V> PendingFetch<V>
where
    V: Clone,
{
    /// Register one more waiter. Called with the key's shard locked.
    fn join(&self) -> Waiting<V> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        Waiting {
            generation: self.generation,
            fetch: self.fetch.clone(),
            waiters: self.waiters.clone(),
        }
    }
}

enum Slot<V> {
    Ready(CacheEntry<V>),
    Pending(PendingFetch<V>),
}

impl<V> Slot<V> {
    fn is_pending(&self, generation: u64) -> bool {
        matches!(self, Slot::Pending(pending) if pending.generation == generation)
    }
}

struct Waiting<V> {
    generation: u64,
    fetch: SharedFetch<V>,
    waiters: Arc<AtomicUsize>,
}

enum Lookup<V> {
    Hit(V),
    Join(Waiting<V>),
    Miss,
}

/// A caller's registration on a pending fetch. The last one to leave before
/// the fetch settles drops the slot.
struct WaiterGuard<'a, V> {
    slots: &'a DashMap<String, Slot<V>>,
    key: &'a str,
    generation: u64,
    waiters: Arc<AtomicUsize>,
}

impl<V> Drop for WaiterGuard<'_, V> {
    fn drop(&mut self) {
        if self.waiters.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let abandoned = self.slots.remove_if(self.key, |_, slot| {
            slot.is_pending(self.generation) && self.waiters.load(Ordering::Acquire) == 0
        });
        if abandoned.is_some() {
            tracing::debug!(key = %self.key, "Last waiter left; dropping in-flight fetch");
        }
    }
}

/// Short-TTL cache with in-flight deduplication.
pub struct MicroCache<V> {
    slots: Arc<DashMap<String, Slot<V>>>,
    enabled: AtomicBool,
    next_generation: AtomicU64,
    observer: Arc<dyn Observer>,
}

impl<V> MicroCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(enabled: bool, observer: Arc<dyn Observer>) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            enabled: AtomicBool::new(enabled),
            next_generation: AtomicU64::new(1),
            observer,
        }
    }

    /// Serve `key` from cache, join its in-flight fetch, or start one with `factory`.
    ///
    /// `factory` is invoked at most once and only on a miss. It is called
    /// while the key's shard is locked, so it must only build the future.
    /// If every caller waiting on a fetch gives up, the fetch is dropped.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        factory: F,
        cancel: &CancelToken,
    ) -> FlowResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlowResult<V>> + Send + 'static,
    {
        if !self.is_enabled() {
            return cancel.run(factory()).await?;
        }

        let now = Instant::now();
        let waiting = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let lookup = match occupied.get() {
                    Slot::Ready(entry) if !entry.is_expired(now) => {
                        entry.touch(now);
                        Lookup::Hit(entry.value().clone())
                    }
                    Slot::Pending(pending) => Lookup::Join(pending.join()),
                    Slot::Ready(_) => Lookup::Miss,
                };
                match lookup {
                    Lookup::Hit(value) => {
                        tracing::trace!(key = %key, "Micro-cache hit");
                        self.observer.on_cache_hit(CacheTier::Micro);
                        return Ok(value);
                    }
                    Lookup::Join(waiting) => {
                        tracing::trace!(key = %key, "Joining in-flight fetch");
                        self.observer.on_cache_hit(CacheTier::Micro);
                        waiting
                    }
                    Lookup::Miss => {
                        self.observer.on_cache_miss(CacheTier::Micro);
                        let pending = self.start_fetch(key, ttl, factory);
                        let waiting = pending.join();
                        occupied.insert(Slot::Pending(pending));
                        waiting
                    }
                }
            }
            Entry::Vacant(vacant) => {
                self.observer.on_cache_miss(CacheTier::Micro);
                let pending = self.start_fetch(key, ttl, factory);
                let waiting = pending.join();
                vacant.insert(Slot::Pending(pending));
                waiting
            }
        };

        let guard = WaiterGuard {
            slots: &self.slots,
            key,
            generation: waiting.generation,
            waiters: waiting.waiters,
        };
        let result = cancel.run(waiting.fetch).await;
        drop(guard);
        result?
    }

    fn start_fetch<F, Fut>(&self, key: &str, ttl: Duration, factory: F) -> PendingFetch<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlowResult<V>> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let slots = Arc::clone(&self.slots);
        let key = key.to_string();
        let pending = factory();

        let fetch = async move {
            let result = pending.await;
            match &result {
                Ok(value) => {
                    if let Some(mut slot) = slots.get_mut(&key) {
                        if slot.value().is_pending(generation) {
                            *slot = Slot::Ready(CacheEntry::new(value.clone(), ttl, None, Instant::now()));
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(key = %key, error = %error, "Micro-cache fetch failed; not caching");
                    slots.remove_if(&key, |_, slot| slot.is_pending(generation));
                }
            }
            result
        }
        .boxed()
        .shared();

        PendingFetch {
            generation,
            fetch,
            waiters: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Switch the tier on or off. Switching off also drops cached entries.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.slots.clear();
        }
        tracing::info!(enabled, "Micro-cache toggled");
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.slots.remove(key).is_some()
    }

    /// Remove every expired ready entry. Pending fetches are left alone.
    pub fn invalidate_expired_entries(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.slots.retain(|_, slot| {
            let expired = matches!(slot, Slot::Ready(entry) if entry.is_expired(now));
            if expired {
                removed += 1;
            }
            !expired
        });
        removed
    }

    /// Sweep expired entries every `interval` until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancelToken) {
        run_sweep_loop(CacheTier::Micro, interval, cancel, || {
            (self.invalidate_expired_entries(), self.len())
        })
        .await;
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Slots held, including pending fetches and not-yet-swept expired entries.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use crate::lifecycle::cancel::CancelReason;
    use crate::observability::metrics::testing::CountingObserver;
    use crate::observability::NoopObserver;

    fn cache(enabled: bool) -> Arc<MicroCache<u64>> {
        Arc::new(MicroCache::new(enabled, Arc::new(NoopObserver)))
    }

    fn counted_fetch(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        value: u64,
    ) -> impl FnOnce() -> BoxFuture<'static, FlowResult<u64>> {
        let calls = calls.clone();
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let cache = cache(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..16 {
            let cache = cache.clone();
            let factory = counted_fetch(&calls, Duration::from_millis(100), 42);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create("ticker:BTCUSD", Duration::from_millis(500), factory, &CancelToken::new())
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_refetched() {
        let cache = cache(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_millis(500);
        let token = CancelToken::new();

        let first = cache
            .get_or_create("k", ttl, counted_fetch(&calls, Duration::ZERO, 1), &token)
            .await;
        let cached = cache
            .get_or_create("k", ttl, counted_fetch(&calls, Duration::ZERO, 2), &token)
            .await;
        assert_eq!((first, cached), (Ok(1), Ok(1)));

        tokio::time::advance(ttl).await;
        let refreshed = cache
            .get_or_create("k", ttl, counted_fetch(&calls, Duration::ZERO, 3), &token)
            .await;
        assert_eq!(refreshed, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_not_cached() {
        let cache = cache(true);
        let token = CancelToken::new();
        let failure = FlowError::TransientRemoteFailure {
            status: 502,
            message: "bad gateway".into(),
            retry_after: None,
        };

        let failed = {
            let failure = failure.clone();
            cache
                .get_or_create("k", Duration::from_secs(1), move || async move { Err(failure) }, &token)
                .await
        };
        assert_eq!(failed, Err(failure));
        assert!(cache.is_empty());

        let recovered = cache
            .get_or_create("k", Duration::from_secs(1), || async { Ok(7) }, &token)
            .await;
        assert_eq!(recovered, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_tier_always_calls_factory() {
        let cache = cache(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let token = CancelToken::new();

        for _ in 0..3 {
            let value = cache
                .get_or_create("k", Duration::from_secs(60), counted_fetch(&calls, Duration::ZERO, 9), &token)
                .await;
            assert_eq!(value, Ok(9));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_abort_shared_fetch() {
        let cache = cache(true);
        let calls = Arc::new(AtomicUsize::new(0));

        let impatient = CancelToken::new();
        let first = {
            let cache = cache.clone();
            let impatient = impatient.clone();
            let factory = counted_fetch(&calls, Duration::from_millis(200), 5);
            tokio::spawn(async move {
                cache
                    .get_or_create("k", Duration::from_secs(1), factory, &impatient)
                    .await
            })
        };
        tokio::task::yield_now().await;
        let second = {
            let cache = cache.clone();
            let factory = counted_fetch(&calls, Duration::from_millis(200), 6);
            tokio::spawn(async move {
                cache
                    .get_or_create("k", Duration::from_secs(1), factory, &CancelToken::new())
                    .await
            })
        };
        tokio::task::yield_now().await;

        impatient.cancel();
        assert_eq!(
            first.await.unwrap(),
            Err(FlowError::OperationCancelled(CancelReason::Explicit))
        );
        assert_eq!(second.await.unwrap(), Ok(5));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hits_and_misses_are_observed() {
        let observer = Arc::new(CountingObserver::default());
        let cache: MicroCache<u64> = MicroCache::new(true, observer.clone());
        let token = CancelToken::new();

        for _ in 0..3 {
            let _ = cache
                .get_or_create("k", Duration::from_secs(1), || async { Ok(1) }, &token)
                .await;
        }
        assert_eq!(CountingObserver::get(&observer.cache_misses), 1);
        assert_eq!(CountingObserver::get(&observer.cache_hits), 2);
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_waiter_leaving_drops_fetch() {
        let cache = cache(true);
        let dropped = Arc::new(AtomicBool::new(false));
        let cancel = CancelToken::new();

        let caller = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            let flag = DropFlag(dropped.clone());
            tokio::spawn(async move {
                cache
                    .get_or_create(
                        "k",
                        Duration::from_secs(1),
                        move || async move {
                            let _flag = flag;
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            Ok(1)
                        },
                        &cancel,
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(cache.len(), 1);

        cancel.cancel();
        assert!(caller.await.unwrap().is_err());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(cache.is_empty());

        let calls = Arc::new(AtomicUsize::new(0));
        let fresh = cache
            .get_or_create("k", Duration::from_secs(1), counted_fetch(&calls, Duration::ZERO, 2), &CancelToken::new())
            .await;
        assert_eq!(fresh, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_reclaimed() {
        let cache = cache(true);
        let token = CancelToken::new();
        for (key, ttl) in [("a", 100), ("b", 100), ("c", 10_000)] {
            cache
                .get_or_create(key, Duration::from_millis(ttl), || async { Ok(1) }, &token)
                .await
                .unwrap();
        }
        assert_eq!(cache.len(), 3);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(cache.invalidate_expired_entries(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_reclaims_unread_keys() {
        let cache = cache(true);
        let token = CancelToken::new();
        for symbol in ["BTCUSD", "ETHUSD", "SOLUSD"] {
            cache
                .get_or_create(symbol, Duration::from_millis(500), || async { Ok(1) }, &token)
                .await
                .unwrap();
        }

        let stop = CancelToken::new();
        let sweeper = tokio::spawn(cache.clone().run_sweeper(Duration::from_secs(1), stop.clone()));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(cache.is_empty());

        stop.cancel();
        sweeper.await.unwrap();
    }
}
