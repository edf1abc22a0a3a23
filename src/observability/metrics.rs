//! Telemetry observer.
//!
//! # Responsibilities
//! - Define the `Observer` capability injected into gates, caches, retries and clock sync
//! - Forward observations to the `metrics` facade (`MetricsObserver`)
//! - Install the Prometheus exporter for the binary
//!
//! # Metrics
//! - `flowguard_gate_wait_seconds` (histogram): time spent queued, by gate
//! - `flowguard_gate_rejected_total` (counter): rejections, by gate and reason
//! - `flowguard_cache_requests_total` (counter): hits and misses, by tier
//! - `flowguard_retries_total` (counter): retries scheduled, by profile
//! - `flowguard_retry_exhausted_total` (counter): calls that ran out of attempts
//! - `flowguard_clock_offset_seconds` (gauge): last accepted offset
//! - `flowguard_clock_sync_failures_total` (counter)
//!
//! # Design Decisions
//! - Observers are injected, never global, so tests can count calls in isolation
//! - Every hook has a no-op default

use std::net::SocketAddr;
use std::time::Duration;

use crate::resilience::retries::RetryContext;

/// Which gate an observation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateKind {
    Global,
    Identity,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateKind::Global => "global",
            GateKind::Identity => "identity",
        }
    }
}

/// Which cache tier an observation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    Micro,
    Tagged,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Micro => "micro",
            CacheTier::Tagged => "tagged",
        }
    }
}

/// Telemetry hooks. Implementations must be cheap; they run inline.
pub trait Observer: Send + Sync {
    fn on_gate_wait(&self, _gate: GateKind, _waited: Duration) {}
    fn on_gate_rejected(&self, _gate: GateKind, _reason: &'static str) {}
    fn on_cache_hit(&self, _tier: CacheTier) {}
    fn on_cache_miss(&self, _tier: CacheTier) {}
    fn on_retry(&self, _profile: &str, _context: &RetryContext, _delay: Duration) {}
    fn on_give_up(&self, _profile: &str, _context: &RetryContext) {}
    fn on_clock_sync(&self, _offset: chrono::Duration, _round_trip: Duration) {}
    fn on_clock_sync_failed(&self, _reason: &str) {}
}

/// Discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Records observations through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl Observer for MetricsObserver {
    fn on_gate_wait(&self, gate: GateKind, waited: Duration) {
        metrics::histogram!("flowguard_gate_wait_seconds", "gate" => gate.as_str())
            .record(waited.as_secs_f64());
    }

    fn on_gate_rejected(&self, gate: GateKind, reason: &'static str) {
        metrics::counter!("flowguard_gate_rejected_total", "gate" => gate.as_str(), "reason" => reason)
            .increment(1);
    }

    fn on_cache_hit(&self, tier: CacheTier) {
        metrics::counter!("flowguard_cache_requests_total", "tier" => tier.as_str(), "result" => "hit")
            .increment(1);
    }

    fn on_cache_miss(&self, tier: CacheTier) {
        metrics::counter!("flowguard_cache_requests_total", "tier" => tier.as_str(), "result" => "miss")
            .increment(1);
    }

    fn on_retry(&self, profile: &str, _context: &RetryContext, _delay: Duration) {
        metrics::counter!("flowguard_retries_total", "profile" => profile.to_string()).increment(1);
    }

    fn on_give_up(&self, profile: &str, _context: &RetryContext) {
        metrics::counter!("flowguard_retry_exhausted_total", "profile" => profile.to_string())
            .increment(1);
    }

    fn on_clock_sync(&self, offset: chrono::Duration, _round_trip: Duration) {
        let offset_secs = offset.num_milliseconds() as f64 / 1000.0;
        metrics::gauge!("flowguard_clock_offset_seconds").set(offset_secs);
    }

    fn on_clock_sync_failed(&self, _reason: &str) {
        metrics::counter!("flowguard_clock_sync_failures_total").increment(1);
    }
}

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    let result = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install();

    match result {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}
