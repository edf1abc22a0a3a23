//! Cooperative cancellation.
//!
//! # Responsibilities
//! - Carry an out-of-band cancel signal into every suspending call
//! - Derive child tokens (cancelled with their parent)
//! - Derive timeout tokens (a timeout is just a cancellation with a reason)
//!
//! # Design Decisions
//! - Built on `tokio::sync::watch` so any number of waiters observe one write
//! - First reason wins; later cancels are no-ops
//! - Cancellation is a distinct outcome, never a retryable failure

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{FlowError, FlowResult};

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled explicitly.
    Explicit,
    /// A derived deadline elapsed.
    Timeout,
    /// The owning client is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Explicit => write!(f, "cancelled by caller"),
            CancelReason::Timeout => write!(f, "deadline elapsed"),
            CancelReason::Shutdown => write!(f, "client shutting down"),
        }
    }
}

struct Inner {
    state: watch::Sender<Option<CancelReason>>,
    children: Mutex<Vec<Weak<Inner>>>,
    /// Children hold their parent strongly; parents hold children weakly.
    _parent: Option<Arc<Inner>>,
}

impl Inner {
    fn cancel_with(&self, reason: CancelReason) {
        let changed = self.state.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason);
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }

        let children: Vec<Weak<Inner>> = {
            let mut guard = self.children.lock().expect("cancel token mutex poisoned");
            guard.drain(..).collect()
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel_with(reason);
        }
    }
}

/// Cloneable cancellation handle. Clones share state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Arc<Inner>>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                state,
                children: Mutex::new(Vec::new()),
                _parent: parent,
            }),
        }
    }

    /// Cancel explicitly.
    pub fn cancel(&self) {
        self.inner.cancel_with(CancelReason::Explicit);
    }

    pub fn cancel_with(&self, reason: CancelReason) {
        self.inner.cancel_with(reason);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.inner.state.borrow()
    }

    /// Resolves once the token is cancelled, yielding the reason.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.inner.state.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.unwrap_or(CancelReason::Explicit),
            Err(_) => CancelReason::Explicit,
        };
        reason
    }

    /// A token that is cancelled whenever this one is, but can also be cancelled on its own.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::with_parent(Some(self.inner.clone()));
        let mut children = self.inner.children.lock().expect("cancel token mutex poisoned");
        match self.reason() {
            Some(reason) => child.inner.cancel_with(reason),
            None => {
                children.retain(|weak| weak.strong_count() > 0);
                children.push(Arc::downgrade(&child.inner));
            }
        }
        child
    }

    /// A child token that cancels itself with [`CancelReason::Timeout`] after `timeout`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn child_with_timeout(&self, timeout: Duration) -> CancelToken {
        let child = self.child();
        let timer = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => timer.cancel_with(CancelReason::Timeout),
                _ = timer.cancelled() => {}
            }
        });
        child
    }

    /// Drive `fut` unless the token fires first. An already-cancelled token
    /// never polls `fut`.
    pub async fn run<F>(&self, fut: F) -> FlowResult<F::Output>
    where
        F: Future,
    {
        if let Some(reason) = self.reason() {
            return Err(FlowError::OperationCancelled(reason));
        }
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(FlowError::OperationCancelled(reason)),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `delay` unless cancelled first.
    pub async fn sleep(&self, delay: Duration) -> FlowResult<()> {
        self.run(tokio::time::sleep(delay)).await
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}
