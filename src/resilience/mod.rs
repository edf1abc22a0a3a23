//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! One logical call:
//!     → retries.rs (RetryCoordinator drives attempts under a RetryProfile)
//!         → each attempt re-enters the rate gates, then dispatches
//!         → timeouts.rs (per-attempt deadline → transient failure)
//!     → On retryable failure: backoff.rs (Retry-After hint, else exponential)
//!     → On exhaustion or non-retryable failure: last error surfaced unmodified
//! ```
//!
//! # Design Decisions
//! - Retries never bypass the gates; a retry is a new request as far as quota is concerned
//! - Only transient (5xx/timeout) and, per profile, rate-limited failures are retried
//! - Queue overflow and cancellation are never retried here

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use retries::{RetryContext, RetryCoordinator, RetryError, RetryProfile};
