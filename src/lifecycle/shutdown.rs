//! Shutdown coordination for background loops.

use crate::lifecycle::cancel::{CancelReason, CancelToken};

/// Coordinator for graceful shutdown.
///
/// Holds a root cancellation token; every long-running task (gate emitter,
/// cache sweeper, clock resync loop) subscribes to a child of it.
pub struct Shutdown {
    root: CancelToken,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            root: CancelToken::new(),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> CancelToken {
        self.root.child()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        if !self.root.is_cancelled() {
            tracing::info!("Shutdown triggered");
        }
        self.root.cancel_with(CancelReason::Shutdown);
    }

    pub fn is_triggered(&self) -> bool {
        self.root.is_cancelled()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
