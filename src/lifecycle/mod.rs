//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Caller:
//!     CancelToken (explicit) → child_with_timeout (derived deadline)
//!     → passed into every gate acquisition, cache wait and backoff sleep
//!
//! Client:
//!     Shutdown::trigger → root token cancelled
//!     → gate emitter, cache sweeper and clock resync loops exit
//! ```
//!
//! # Design Decisions
//! - Timeouts are cancellations with a reason, not a separate mechanism
//! - Background loops never outlive the client that spawned them

pub mod cancel;
pub mod shutdown;

pub use cancel::{CancelReason, CancelToken};
pub use shutdown::Shutdown;
