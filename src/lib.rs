//! Traffic-shaping and resilience layer for clients of rate-limited trading APIs.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────┐
//!                        │                   ResilientClient                    │
//!                        │                                                      │
//!   get_cached / ────────┼─▶ cache (micro / tagged) ──miss──┐                   │
//!   get_tagged           │                                  ▼                   │
//!                        │                        resilience::RetryCoordinator  │
//!   send ────────────────┼────────────────────────────────▶ │ (per attempt)     │
//!                        │                                  ▼                   │
//!                        │              limiter::PerIdentityRateGate            │
//!                        │                                  ▼                   │
//!                        │              limiter::GlobalRateGate                 │
//!                        │                                  ▼                   │
//!                        │              transport::Dispatch ───────────────────┼──▶ Remote API
//!                        │                                                      │
//!   corrected_now ───────┼─▶ clock::ClockSynchronizer (periodic HEAD probe) ────┼──▶ Date header
//!                        │                                                      │
//!                        │  ┌────────────────────────────────────────────────┐  │
//!                        │  │ config · lifecycle (cancel, shutdown) · error  │  │
//!                        │  │ observability (tracing, Observer → metrics)    │  │
//!                        │  └────────────────────────────────────────────────┘  │
//!                        └──────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod limiter;
pub mod observability;
pub mod resilience;
pub mod transport;

pub use client::ResilientClient;
pub use config::FlowguardConfig;
pub use error::{FlowError, FlowResult};
pub use lifecycle::{CancelReason, CancelToken, Shutdown};
