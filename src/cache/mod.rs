//! Freshness cache subsystem.
//!
//! # Data Flow
//! ```text
//! Read request:
//!     → keys.rs (endpoint+symbol or request-derived key, data class → TTL)
//!     → micro.rs (tier A: hit, join in-flight fetch, or start one)
//!       or tagged.rs (tier B: hit, or populate under a per-key lock)
//!     → on miss: gates → retry → dispatch
//!     → entry.rs (stored with absolute expiry and access stats)
//! ```
//!
//! # Design Decisions
//! - Expiry is checked at read time; the sweepers only reclaim memory
//! - At most one population per key is in flight at any moment
//! - Errors are returned to every waiter and never stored

pub mod entry;
pub mod keys;
pub mod micro;
mod sweep;
pub mod tagged;

pub use entry::{CacheEntry, EntryStats};
pub use keys::{cache_key, request_key, DataClass};
pub use micro::MicroCache;
pub use tagged::TaggedCache;
