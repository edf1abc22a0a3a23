//! Token bucket with fixed-period replenishment.

use std::time::Duration;
use tokio::time::Instant;

/// Capped pool of tokens topped up by `tokens_per_period` once per whole
/// `period`. Partial periods add nothing.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: u32,
    capacity: u32,
    tokens_per_period: u32,
    period: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket whose refill clock starts at `now`.
    pub fn new(capacity: u32, tokens_per_period: u32, period: Duration, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            tokens_per_period,
            period: period.max(Duration::from_millis(1)),
            last_refill: now,
        }
    }

    /// Credit every whole period elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let periods = elapsed.as_nanos() / self.period.as_nanos();
        if periods == 0 {
            return;
        }

        let added = periods.saturating_mul(u128::from(self.tokens_per_period));
        let level = u128::from(self.tokens).saturating_add(added);
        self.tokens = level.min(u128::from(self.capacity)) as u32;

        // Keep the refill phase: drop only the whole periods just credited.
        let remainder = elapsed.as_nanos() % self.period.as_nanos();
        self.last_refill = now - Duration::from_nanos(remainder as u64);
    }

    /// Take `count` tokens if available after refilling.
    pub fn try_take(&mut self, count: u32, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= count {
            self.tokens -= count;
            true
        } else {
            false
        }
    }

    /// Return tokens that were taken but not used.
    pub fn give_back(&mut self, count: u32) {
        self.tokens = self.tokens.saturating_add(count).min(self.capacity);
    }

    /// Tokens available at `now`.
    pub fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens
    }

    /// Instant of the next replenishment.
    pub fn next_refill_at(&self) -> Instant {
        self.last_refill + self.period
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
