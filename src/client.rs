//! Resilient API client.
//!
//! # Data Flow
//! ```text
//! send(request, profile):
//!     RetryCoordinator (per attempt):
//!         → PerIdentityRateGate (only when the request names an identity)
//!         → GlobalRateGate
//!         → Dispatch under the per-attempt deadline
//!         → ApiResponse::into_result (classify status)
//!
//! get_cached(request, class):  MicroCache  → send on miss
//! get_tagged(request, tag):    TaggedCache → send on miss
//! corrected_now():             ClockSynchronizer offset applied to local time
//! ```
//!
//! # Design Decisions
//! - Every retry re-enters both gates; a retry never bypasses pacing
//! - Reads with an identity use the trading profile, anonymous reads the
//!   public-data profile
//! - Background loops (gate emitter, cache sweeper, clock resync) hang off one
//!   `Shutdown` and stop when the last client handle is dropped

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::cache::{request_key, DataClass, MicroCache, TaggedCache};
use crate::clock::{ClockOffset, ClockState, ClockSynchronizer, SystemClock, WallClock};
use crate::config::{validate_config, FlowguardConfig};
use crate::error::{FlowError, FlowResult};
use crate::lifecycle::{CancelToken, Shutdown};
use crate::limiter::{GlobalPermit, GlobalRateGate, IdentityLease, PerIdentityRateGate};
use crate::observability::{NoopObserver, Observer};
use crate::resilience::timeouts::with_deadline;
use crate::resilience::{RetryCoordinator, RetryError, RetryProfile};
use crate::transport::{ApiRequest, ApiResponse, Dispatch, HttpDispatcher};

struct Inner {
    config: FlowguardConfig,
    dispatcher: Arc<dyn Dispatch>,
    global_gate: GlobalRateGate,
    identity_gate: PerIdentityRateGate,
    retries: RetryCoordinator,
    trading: RetryProfile,
    public_data: RetryProfile,
    micro: Arc<MicroCache<ApiResponse>>,
    tagged: Arc<TaggedCache<ApiResponse>>,
    clock: Arc<ClockSynchronizer>,
    shutdown: Shutdown,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Traffic-shaping client facade. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ResilientClient {
    inner: Arc<Inner>,
}

impl ResilientClient {
    /// Client over HTTP to `config.transport.base_url`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_config(config: FlowguardConfig, observer: Arc<dyn Observer>) -> FlowResult<Self> {
        let dispatcher = Arc::new(HttpDispatcher::new(&config.transport)?);
        Self::with_observer(config, dispatcher, observer)
    }

    /// Must be called from within a Tokio runtime.
    pub fn new(config: FlowguardConfig, dispatcher: Arc<dyn Dispatch>) -> FlowResult<Self> {
        Self::with_observer(config, dispatcher, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        config: FlowguardConfig,
        dispatcher: Arc<dyn Dispatch>,
        observer: Arc<dyn Observer>,
    ) -> FlowResult<Self> {
        Self::with_clock(config, dispatcher, observer, Arc::new(SystemClock))
    }

    /// Full constructor: spawns the gate emitter, the cache sweepers and, when
    /// enabled, the clock resync loop.
    pub fn with_clock(
        config: FlowguardConfig,
        dispatcher: Arc<dyn Dispatch>,
        observer: Arc<dyn Observer>,
        wall_clock: Arc<dyn WallClock>,
    ) -> FlowResult<Self> {
        validate_config(&config).map_err(|errors| {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            FlowError::InvalidConfig(joined.join("; "))
        })?;

        let shutdown = Shutdown::new();
        let global_gate = GlobalRateGate::new(
            config.global_gate.requests_per_second,
            &shutdown.subscribe(),
            observer.clone(),
        )?;
        let identity_gate = PerIdentityRateGate::new(config.identity_gate.clone(), observer.clone())?;

        let micro = Arc::new(MicroCache::new(config.micro_cache.enabled, observer.clone()));
        tokio::spawn(micro.clone().run_sweeper(
            Duration::from_millis(config.micro_cache.sweep_interval_ms),
            shutdown.subscribe(),
        ));

        let tagged = Arc::new(TaggedCache::new(&config.tagged_cache, observer.clone()));
        tokio::spawn(tagged.clone().run_sweeper(
            Duration::from_secs(config.tagged_cache.sweep_interval_secs),
            shutdown.subscribe(),
        ));

        let clock = Arc::new(ClockSynchronizer::with_clock(
            dispatcher.clone(),
            wall_clock,
            config.clock.clone(),
            observer.clone(),
        ));
        if config.clock.enabled {
            tokio::spawn(clock.clone().run(shutdown.subscribe()));
        }

        tracing::info!(
            requests_per_second = config.global_gate.requests_per_second,
            identity_capacity = config.identity_gate.capacity,
            micro_cache = config.micro_cache.enabled,
            clock_sync = config.clock.enabled,
            "Resilient client started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                trading: RetryProfile::from_config("trading", &config.retry.trading),
                public_data: RetryProfile::from_config("public_data", &config.retry.public_data),
                micro,
                retries: RetryCoordinator::new(observer),
                config,
                dispatcher,
                global_gate,
                identity_gate,
                tagged,
                clock,
                shutdown,
            }),
        })
    }

    pub fn config(&self) -> &FlowguardConfig {
        &self.inner.config
    }

    pub fn trading_profile(&self) -> &RetryProfile {
        &self.inner.trading
    }

    pub fn public_data_profile(&self) -> &RetryProfile {
        &self.inner.public_data
    }

    /// Profile for a request: identity-bound traffic is trading traffic.
    pub fn profile_for(&self, request: &ApiRequest) -> &RetryProfile {
        match request.identity {
            Some(_) => &self.inner.trading,
            None => &self.inner.public_data,
        }
    }

    pub async fn acquire_global(&self, cancel: &CancelToken) -> FlowResult<GlobalPermit> {
        self.inner.global_gate.acquire(cancel).await
    }

    pub async fn acquire_for_identity(
        &self,
        identity: &str,
        cancel: &CancelToken,
    ) -> FlowResult<IdentityLease> {
        self.inner.identity_gate.acquire(identity, 1, cancel).await
    }

    /// Run an arbitrary operation under `profile`'s retry policy.
    pub async fn with_retry<T, F, Fut>(
        &self,
        profile: &RetryProfile,
        cancel: &CancelToken,
        operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = FlowResult<T>>,
    {
        self.inner.retries.execute(profile, cancel, operation).await
    }

    /// Micro-cache lookup with a caller-supplied factory.
    pub async fn cached<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        factory: F,
        cancel: &CancelToken,
    ) -> FlowResult<ApiResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlowResult<ApiResponse>> + Send + 'static,
    {
        self.inner.micro.get_or_create(key, ttl, factory, cancel).await
    }

    /// Gate, dispatch and classify `request`, retrying under `profile`.
    pub async fn send(
        &self,
        request: ApiRequest,
        profile: &RetryProfile,
        cancel: &CancelToken,
    ) -> Result<ApiResponse, RetryError> {
        let inner = &self.inner;
        let deadline = inner.config.transport.request_timeout();

        inner
            .retries
            .execute(profile, cancel, |attempt| {
                let request = if attempt == 1 {
                    request.clone()
                } else {
                    request.reissue()
                };
                async move {
                    if let Some(identity) = request.identity.as_deref() {
                        inner.identity_gate.acquire(identity, 1, cancel).await?;
                    }
                    inner.global_gate.acquire(cancel).await?;

                    let response = with_deadline(deadline, inner.dispatcher.dispatch(request)).await?;
                    response.into_result()
                }
            })
            .await
    }

    /// Read through the micro-cache. Concurrent identical reads share one dispatch.
    pub async fn get_cached(
        &self,
        request: ApiRequest,
        class: DataClass,
        cancel: &CancelToken,
    ) -> FlowResult<ApiResponse> {
        let key = request_key(&request);
        let ttl = class.ttl(&self.inner.config.micro_cache);

        // The shared fetch outlives any single caller, so it runs under the
        // client's own shutdown token rather than the first caller's. It holds
        // the client weakly while parked in the cache.
        let client: Weak<Inner> = Arc::downgrade(&self.inner);
        let fetch_cancel = self.inner.shutdown.subscribe();
        let factory = move || async move {
            let Some(inner) = client.upgrade() else {
                return Err(FlowError::GateClosed);
            };
            let client = ResilientClient { inner };
            let profile = client.profile_for(&request).clone();
            client
                .send(request, &profile, &fetch_cancel)
                .await
                .map_err(FlowError::from)
        };

        self.inner.micro.get_or_create(&key, ttl, factory, cancel).await
    }

    /// Read through the tagged cache; `ttl` defaults to the configured TTL.
    pub async fn get_tagged(
        &self,
        request: ApiRequest,
        tag: Option<&str>,
        ttl: Option<Duration>,
        cancel: &CancelToken,
    ) -> FlowResult<ApiResponse> {
        let key = request_key(&request);
        let profile = self.profile_for(&request);

        self.inner
            .tagged
            .get_or_compute(
                &key,
                ttl,
                tag,
                || async move { self.send(request, profile, cancel).await.map_err(FlowError::from) },
                cancel,
            )
            .await
    }

    pub fn invalidate_tag(&self, tag: &str) -> usize {
        self.inner.tagged.invalidate_by_tag(tag)
    }

    pub fn micro_cache(&self) -> &MicroCache<ApiResponse> {
        &self.inner.micro
    }

    pub fn tagged_cache(&self) -> &TaggedCache<ApiResponse> {
        &self.inner.tagged
    }

    pub fn identity_gate(&self) -> &PerIdentityRateGate {
        &self.inner.identity_gate
    }

    pub fn global_gate(&self) -> &GlobalRateGate {
        &self.inner.global_gate
    }

    /// Local time plus the last good server offset.
    pub fn corrected_now(&self) -> DateTime<Utc> {
        self.inner.clock.corrected_now()
    }

    pub fn clock_state(&self) -> ClockState {
        self.inner.clock.state()
    }

    /// Probe the server clock now, outside the periodic loop.
    pub async fn sync_clock(&self, cancel: &CancelToken) -> Option<ClockOffset> {
        self.inner.clock.sync(cancel).await
    }

    /// Stop background loops and release gate waiters with `GateClosed`.
    pub fn shutdown(&self) {
        self.inner.global_gate.dispose();
        self.inner.shutdown.trigger();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }
}
