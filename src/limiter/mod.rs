//! Rate limiting subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound request:
//!     → identity.rs (per-identity token bucket; may queue oldest-first)
//!     → global.rs (client-wide FIFO pacing, one admission per 1000/N ms)
//!     → dispatch
//! ```
//!
//! # Design Decisions
//! - Each gate guarantees fairness within its own waiters only
//! - Waiting is cooperative suspension; no worker is parked
//! - Cancellation never consumes a slot or token

pub mod bucket;
pub mod global;
pub mod identity;

pub use bucket::TokenBucket;
pub use global::{GlobalPermit, GlobalRateGate};
pub use identity::{IdentityLease, PerIdentityRateGate};
