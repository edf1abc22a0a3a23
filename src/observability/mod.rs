//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Gates, caches, retries, clock sync produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (Observer hooks → metrics facade)
//!
//! Consumers:
//!     → stdout via tracing-subscriber
//!     → Prometheus scrape (optional)
//!     → test observers counting hook calls
//! ```

pub mod logging;
pub mod metrics;

pub use metrics::{CacheTier, GateKind, MetricsObserver, NoopObserver, Observer};
