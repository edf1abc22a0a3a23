//! Error taxonomy for the traffic-shaping layer.
//!
//! Every suspending operation returns [`FlowResult`]. Errors are `Clone` so a
//! single in-flight cache population can hand the same outcome to all of its
//! waiters.

use std::time::Duration;
use thiserror::Error;

use crate::lifecycle::cancel::CancelReason;
use crate::resilience::retries::RetryProfile;

/// Errors surfaced by gates, caches, the retry coordinator and dispatch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowError {
    /// The identity's wait queue is full. Not retried here; the caller must shed load.
    #[error("Rate limit queue full for identity '{identity}' (limit {queue_limit})")]
    RateLimitQueueOverflow { identity: String, queue_limit: usize },

    /// The caller cancelled, or a derived timeout fired.
    #[error("Operation cancelled: {0}")]
    OperationCancelled(CancelReason),

    /// 5xx, transport timeout or connection failure. Retryable.
    #[error("Transient remote failure (status {status}): {message}")]
    TransientRemoteFailure {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// 429. Retryable only when the profile allows it.
    #[error("Remote rate limited (retry after {retry_after:?})")]
    RemoteRateLimited { retry_after: Option<Duration> },

    /// Validation, auth and every other 4xx. Surfaced immediately.
    #[error("Non-retryable remote failure (status {status}): {message}")]
    NonRetryableRemoteFailure { status: u16, message: String },

    /// Clock probe failed. Logged as a warning; never returned from time APIs.
    #[error("Clock sync failed: {0}")]
    ClockSyncFailed(String),

    /// The gate was disposed while the caller was waiting.
    #[error("Rate gate closed")]
    GateClosed,

    /// The identity's limiter was removed while the caller was queued on it.
    #[error("Rate limiter for identity '{identity}' was removed")]
    LimiterRemoved { identity: String },

    /// More tokens were requested than the bucket can ever hold.
    #[error("Requested {requested} tokens but bucket capacity is {capacity}")]
    PermitExceedsCapacity { requested: u32, capacity: u32 },

    /// Construction-time configuration error.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The request could not be built or the response could not be decoded.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for flowguard operations.
pub type FlowResult<T> = Result<T, FlowError>;

impl FlowError {
    /// Whether the retry coordinator may attempt the call again under `profile`.
    pub fn is_retryable(&self, profile: &RetryProfile) -> bool {
        match self {
            FlowError::TransientRemoteFailure { .. } => true,
            FlowError::RemoteRateLimited { .. } => profile.retry_on_rate_limit,
            _ => false,
        }
    }

    /// Server-provided retry hint, if the failure carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FlowError::TransientRemoteFailure { retry_after, .. } => *retry_after,
            FlowError::RemoteRateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::RateLimitQueueOverflow { .. } => "queue_overflow",
            FlowError::OperationCancelled(_) => "cancelled",
            FlowError::TransientRemoteFailure { .. } => "transient",
            FlowError::RemoteRateLimited { .. } => "rate_limited",
            FlowError::NonRetryableRemoteFailure { .. } => "non_retryable",
            FlowError::ClockSyncFailed(_) => "clock_sync",
            FlowError::GateClosed => "gate_closed",
            FlowError::LimiterRemoved { .. } => "limiter_removed",
            FlowError::PermitExceedsCapacity { .. } => "exceeds_capacity",
            FlowError::InvalidConfig(_) => "invalid_config",
            FlowError::Transport(_) => "transport",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlowError::OperationCancelled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_follows_profile() {
        let trading = RetryProfile::trading();
        let public = RetryProfile::public_data();
        let limited = FlowError::RemoteRateLimited { retry_after: None };
        let transient = FlowError::TransientRemoteFailure {
            status: 503,
            message: "unavailable".into(),
            retry_after: None,
        };
        let rejected = FlowError::NonRetryableRemoteFailure {
            status: 401,
            message: "bad key".into(),
        };

        assert!(limited.is_retryable(&trading));
        assert!(!limited.is_retryable(&public));
        assert!(transient.is_retryable(&trading));
        assert!(transient.is_retryable(&public));
        assert!(!rejected.is_retryable(&trading));
        assert!(!FlowError::OperationCancelled(CancelReason::Explicit).is_retryable(&trading));
        assert!(!FlowError::RateLimitQueueOverflow {
            identity: "a".into(),
            queue_limit: 1
        }
        .is_retryable(&trading));
    }

    #[test]
    fn test_error_display() {
        let err = FlowError::PermitExceedsCapacity {
            requested: 30,
            capacity: 20,
        };
        assert_eq!(err.to_string(), "Requested 30 tokens but bucket capacity is 20");

        let err = FlowError::RemoteRateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(err.to_string().contains("2s"));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }
}
