//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the client
//! layer. All types derive Serde traits for deserialization from config files,
//! and every section is defaulted so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct FlowguardConfig {
    /// Remote API endpoint and per-attempt deadline.
    pub transport: TransportConfig,

    /// Aggregate request pacing for the whole client.
    pub global_gate: GlobalGateConfig,

    /// Token bucket applied per identity.
    pub identity_gate: IdentityGateConfig,

    /// Tier A: sub-second hot-read cache.
    pub micro_cache: MicroCacheConfig,

    /// Tier B: general TTL cache with tags.
    pub tagged_cache: TaggedCacheConfig,

    /// Retry profiles.
    pub retry: RetryConfig,

    /// Server clock synchronization.
    pub clock: ClockConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL of the remote API.
    pub base_url: String,

    /// Deadline for a single dispatch attempt in milliseconds.
    pub request_timeout_ms: u64,

    /// User-Agent sent with every request.
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.example.com".to_string(),
            request_timeout_ms: 10_000,
            user_agent: concat!("flowguard/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Global rate gate configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GlobalGateConfig {
    /// Maximum aggregate requests per second.
    pub requests_per_second: u32,
}

impl Default for GlobalGateConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 20,
        }
    }
}

/// Per-identity token bucket configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct IdentityGateConfig {
    /// Bucket capacity (burst size).
    pub capacity: u32,

    /// Tokens added each refill period.
    pub tokens_per_period: u32,

    /// Refill period in milliseconds.
    pub refill_period_ms: u64,

    /// Maximum callers queued per identity before rejecting.
    pub queue_limit: usize,
}

impl Default for IdentityGateConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            tokens_per_period: 10,
            refill_period_ms: 1_000,
            queue_limit: 100,
        }
    }
}

impl IdentityGateConfig {
    pub fn refill_period(&self) -> Duration {
        Duration::from_millis(self.refill_period_ms)
    }
}

/// Micro-cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MicroCacheConfig {
    /// Disabling the tier sends every read straight to the factory.
    pub enabled: bool,

    /// TTL for ticker-like reads in milliseconds.
    pub ticker_ttl_ms: u64,

    /// TTL for order-book-like reads in milliseconds.
    pub order_book_ttl_ms: u64,

    /// TTL for rarely-changing reference lists in milliseconds.
    pub reference_ttl_ms: u64,

    /// Interval of the expired-entry sweep in milliseconds (0 disables the sweeper).
    pub sweep_interval_ms: u64,
}

impl Default for MicroCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ticker_ttl_ms: 500,
            order_book_ttl_ms: 1_000,
            reference_ttl_ms: 3_600_000,
            sweep_interval_ms: 5_000,
        }
    }
}

/// Tagged cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TaggedCacheConfig {
    /// TTL applied when a caller does not provide one, in seconds.
    pub default_ttl_secs: u64,

    /// Entry-count capacity bound.
    pub max_entries: usize,

    /// Interval of the expired-entry sweep in seconds (0 disables the sweeper).
    pub sweep_interval_secs: u64,
}

impl Default for TaggedCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 60,
            max_entries: 10_000,
            sweep_interval_secs: 30,
        }
    }
}

impl TaggedCacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Retry configuration, one profile per traffic class.
///
/// A profile table only needs the fields it changes; the rest come from that
/// profile's own defaults, not from another profile's.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(from = "RawRetryConfig")]
pub struct RetryConfig {
    pub trading: RetryProfileConfig,
    pub public_data: RetryProfileConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRetryConfig {
    trading: ProfileOverrides,
    public_data: ProfileOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProfileOverrides {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    max_delay_ms: Option<u64>,
    retry_on_rate_limit: Option<bool>,
}

impl ProfileOverrides {
    fn apply(self, base: RetryProfileConfig) -> RetryProfileConfig {
        RetryProfileConfig {
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            base_delay_ms: self.base_delay_ms.unwrap_or(base.base_delay_ms),
            multiplier: self.multiplier.unwrap_or(base.multiplier),
            max_delay_ms: self.max_delay_ms.unwrap_or(base.max_delay_ms),
            retry_on_rate_limit: self.retry_on_rate_limit.unwrap_or(base.retry_on_rate_limit),
        }
    }
}

impl From<RawRetryConfig> for RetryConfig {
    fn from(raw: RawRetryConfig) -> Self {
        Self {
            trading: raw.trading.apply(RetryProfileConfig::trading()),
            public_data: raw.public_data.apply(RetryProfileConfig::public_data()),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            trading: RetryProfileConfig::trading(),
            public_data: RetryProfileConfig::public_data(),
        }
    }
}

/// Parameters of a single retry profile.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryProfileConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Growth factor applied per attempt.
    pub multiplier: f64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Retry 429 responses.
    pub retry_on_rate_limit: bool,
}

impl RetryProfileConfig {
    pub fn trading() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            multiplier: 1.5,
            max_delay_ms: 10_000,
            retry_on_rate_limit: true,
        }
    }

    pub fn public_data() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            retry_on_rate_limit: false,
        }
    }
}

impl Default for RetryProfileConfig {
    fn default() -> Self {
        Self::trading()
    }
}

/// Clock synchronization configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ClockConfig {
    /// Run the periodic resync loop.
    pub enabled: bool,

    /// Path probed with a header-only request.
    pub probe_path: String,

    /// Probe timeout in milliseconds.
    pub probe_timeout_ms: u64,

    /// Resync interval in seconds.
    pub resync_interval_secs: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_path: "/".to_string(),
            probe_timeout_ms: 5_000,
            resync_interval_secs: 300,
        }
    }
}

impl ClockConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Install the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
