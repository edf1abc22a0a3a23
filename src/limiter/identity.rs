//! Per-identity rate gate.
//!
//! # Responsibilities
//! - Keep one token bucket per identity, created lazily on first use
//! - Non-blocking `try_acquire` and queued, cancellable `acquire`
//! - Reject with `RateLimitQueueOverflow` once an identity's queue is full
//!
//! # Design Decisions
//! - Buckets live in a `DashMap` of independently locked records; unrelated
//!   identities never contend on the same lock
//! - Queued callers are granted strictly oldest-first; new arrivals never jump the queue
//! - No background task per identity: every queued caller sleeps until the
//!   next refill and drains the queue head when it wakes
//! - Buckets are never evicted implicitly; `remove_limiter` drops one

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};

use crate::config::IdentityGateConfig;
use crate::error::{FlowError, FlowResult};
use crate::lifecycle::cancel::CancelToken;
use crate::limiter::bucket::TokenBucket;
use crate::observability::metrics::{GateKind, Observer};

/// Proof that an identity's bucket admitted a request.
#[derive(Debug)]
#[must_use = "a lease is only meaningful if the request is sent"]
pub struct IdentityLease {
    identity: String,
    tokens: u32,
    waited: Duration,
}

impl IdentityLease {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }
}

struct QueuedRequest {
    id: u64,
    tokens: u32,
    grant: oneshot::Sender<()>,
}

struct BucketState {
    bucket: TokenBucket,
    queue: VecDeque<QueuedRequest>,
    /// Set once the limiter is dropped from the map; holders of a stale
    /// handle must look the identity up again.
    retired: bool,
}

impl BucketState {
    /// Grant queued requests from the head while tokens allow.
    fn drain_queue(&mut self, now: Instant) {
        self.bucket.refill(now);
        while let Some(head) = self.queue.front() {
            if head.grant.is_closed() {
                self.queue.pop_front();
                continue;
            }
            if !self.bucket.try_take(head.tokens, now) {
                break;
            }
            if let Some(request) = self.queue.pop_front() {
                if request.grant.send(()).is_err() {
                    self.bucket.give_back(request.tokens);
                }
            }
        }
    }

    /// Fail every queued caller and mark the state unusable.
    fn retire(&mut self) {
        self.retired = true;
        self.queue.clear();
    }
}

struct IdentityLimiter {
    state: Mutex<BucketState>,
}

impl IdentityLimiter {
    fn new(config: &IdentityGateConfig) -> Self {
        let bucket = TokenBucket::new(
            config.capacity,
            config.tokens_per_period,
            config.refill_period(),
            Instant::now(),
        );
        Self {
            state: Mutex::new(BucketState {
                bucket,
                queue: VecDeque::new(),
                retired: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().expect("identity limiter mutex poisoned")
    }
}

/// A queued caller's place in line. Dropping it before the grant arrives
/// leaves the queue and refunds a grant that raced the drop.
struct QueuedWaiter<'a> {
    limiter: &'a IdentityLimiter,
    request_id: u64,
    tokens: u32,
    granted: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.limiter.lock();
        state.queue.retain(|request| request.id != self.request_id);
        if self.granted.try_recv().is_ok() {
            state.bucket.give_back(self.tokens);
        }
        state.drain_queue(Instant::now());
    }
}

/// Token-bucket limiter keyed by identity.
pub struct PerIdentityRateGate {
    limiters: DashMap<String, Arc<IdentityLimiter>>,
    config: IdentityGateConfig,
    next_request_id: AtomicU64,
    observer: Arc<dyn Observer>,
}

impl PerIdentityRateGate {
    pub fn new(config: IdentityGateConfig, observer: Arc<dyn Observer>) -> FlowResult<Self> {
        if config.capacity == 0 || config.tokens_per_period == 0 || config.refill_period_ms == 0 {
            return Err(FlowError::InvalidConfig(
                "identity gate requires non-zero capacity, refill tokens and refill period"
                    .to_string(),
            ));
        }
        Ok(Self {
            limiters: DashMap::new(),
            config,
            next_request_id: AtomicU64::new(1),
            observer,
        })
    }

    fn limiter(&self, identity: &str) -> Arc<IdentityLimiter> {
        if let Some(limiter) = self.limiters.get(identity) {
            return limiter.value().clone();
        }
        self.limiters
            .entry(identity.to_string())
            .or_insert_with(|| {
                tracing::debug!(identity = %identity, "Creating identity rate limiter");
                Arc::new(IdentityLimiter::new(&self.config))
            })
            .value()
            .clone()
    }

    /// Run `f` on the identity's current bucket state. A handle retired by
    /// `remove_limiter` between lookup and lock is discarded and looked up again.
    fn with_live_state<R>(
        &self,
        identity: &str,
        mut f: impl FnMut(&Arc<IdentityLimiter>, &mut BucketState) -> R,
    ) -> R {
        loop {
            let limiter = self.limiter(identity);
            let mut state = limiter.lock();
            if state.retired {
                continue;
            }
            return f(&limiter, &mut *state);
        }
    }

    /// Take one token now, or fail. Never waits and never jumps queued callers.
    pub fn try_acquire(&self, identity: &str) -> bool {
        self.with_live_state(identity, |_, state| {
            let now = Instant::now();
            state.drain_queue(now);
            state.queue.is_empty() && state.bucket.try_take(1, now)
        })
    }

    /// Take `tokens`, queueing oldest-first if the bucket is short.
    pub async fn acquire(
        &self,
        identity: &str,
        tokens: u32,
        cancel: &CancelToken,
    ) -> FlowResult<IdentityLease> {
        if tokens > self.config.capacity {
            return Err(FlowError::PermitExceedsCapacity {
                requested: tokens,
                capacity: self.config.capacity,
            });
        }
        if let Some(reason) = cancel.reason() {
            return Err(FlowError::OperationCancelled(reason));
        }

        let started = Instant::now();
        let lease = |waited| IdentityLease {
            identity: identity.to_string(),
            tokens,
            waited,
        };

        let admission = self.with_live_state(identity, |limiter, state| {
            state.drain_queue(started);

            if state.queue.is_empty() && state.bucket.try_take(tokens, started) {
                return Ok(None);
            }

            if state.queue.len() >= self.config.queue_limit {
                tracing::warn!(
                    identity = %identity,
                    queued = state.queue.len(),
                    "Identity rate limit queue full"
                );
                self.observer.on_gate_rejected(GateKind::Identity, "queue_full");
                return Err(FlowError::RateLimitQueueOverflow {
                    identity: identity.to_string(),
                    queue_limit: self.config.queue_limit,
                });
            }

            let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            let (grant, granted) = oneshot::channel();
            state.queue.push_back(QueuedRequest {
                id: request_id,
                tokens,
                grant,
            });
            Ok(Some((limiter.clone(), request_id, granted)))
        })?;

        let Some((limiter, request_id, granted)) = admission else {
            self.observer.on_gate_wait(GateKind::Identity, Duration::ZERO);
            return Ok(lease(Duration::ZERO));
        };

        tracing::debug!(identity = %identity, tokens, "Queued behind identity rate limit");
        let mut waiter = QueuedWaiter {
            limiter: &limiter,
            request_id,
            tokens,
            granted,
            settled: false,
        };

        loop {
            let wake_at = limiter.lock().bucket.next_refill_at();

            tokio::select! {
                biased;
                reason = cancel.cancelled() => {
                    return Err(FlowError::OperationCancelled(reason));
                }
                outcome = &mut waiter.granted => {
                    waiter.settled = true;
                    return match outcome {
                        Ok(()) => {
                            let waited = started.elapsed();
                            self.observer.on_gate_wait(GateKind::Identity, waited);
                            Ok(lease(waited))
                        }
                        Err(_) => Err(FlowError::LimiterRemoved {
                            identity: identity.to_string(),
                        }),
                    };
                }
                _ = sleep_until(wake_at) => {
                    limiter.lock().drain_queue(Instant::now());
                }
            }
        }
    }

    /// Drop an identity's state. Queued callers fail with `LimiterRemoved`;
    /// the next use recreates a full bucket.
    pub fn remove_limiter(&self, identity: &str) -> bool {
        match self.limiters.remove(identity) {
            Some((_, limiter)) => {
                limiter.lock().retire();
                tracing::debug!(identity = %identity, "Identity rate limiter removed");
                true
            }
            None => false,
        }
    }

    /// Tokens currently available, without creating a bucket.
    pub fn available_tokens(&self, identity: &str) -> Option<u32> {
        let limiter = self.limiters.get(identity)?.value().clone();
        let mut state = limiter.lock();
        Some(state.bucket.available(Instant::now()))
    }

    /// Callers currently queued for an identity.
    pub fn queued(&self, identity: &str) -> usize {
        self.limiters
            .get(identity)
            .map(|limiter| limiter.value().clone())
            .map(|limiter| limiter.lock().queue.len())
            .unwrap_or(0)
    }

    pub fn identity_count(&self) -> usize {
        self.limiters.len()
    }

    pub fn config(&self) -> &IdentityGateConfig {
        &self.config
    }
}
