//! Retry logic.
//!
//! # Responsibilities
//! - Classify each failure as retryable or terminal under a profile
//! - Execute retries with the delay chosen by `backoff.rs`
//! - Report each retry and give-up to the injected observer
//!
//! # Design Decisions
//! - The operation closure is re-invoked per attempt, so gate acquisition
//!   inside it happens again on every retry
//! - Exhausted retries surface the last error unmodified; attempt count
//!   travels alongside it in `RetryError`
//! - Backoff sleeps are cancellable

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::schema::RetryProfileConfig;
use crate::error::{FlowError, FlowResult};
use crate::lifecycle::cancel::CancelToken;
use crate::observability::metrics::{NoopObserver, Observer};
use crate::resilience::backoff::select_delay;

/// A named bundle of retry parameters tuned for one traffic class.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryProfile {
    pub name: String,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Whether a 429 is worth retrying under this profile.
    pub retry_on_rate_limit: bool,
}

impl RetryProfile {
    /// Authenticated order traffic: persistent, quick, tolerant of throttling.
    pub fn trading() -> Self {
        Self::from_config("trading", &RetryProfileConfig::trading())
    }

    /// Anonymous market data: few slow attempts. A 429 here has no identity
    /// whose quota could recover, so it is never retried.
    pub fn public_data() -> Self {
        Self::from_config("public_data", &RetryProfileConfig::public_data())
    }

    pub fn from_config(name: &str, config: &RetryProfileConfig) -> Self {
        Self {
            name: name.to_string(),
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            retry_on_rate_limit: config.retry_on_rate_limit,
        }
    }
}

/// State of one logical call across its attempts.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempts made so far (1-based once the first attempt starts).
    pub attempt: u32,
    pub started: Instant,
    /// Kind of the most recent failure.
    pub last_error: Option<&'static str>,
}

impl RetryContext {
    fn new() -> Self {
        Self {
            attempt: 0,
            started: Instant::now(),
            last_error: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// The last attempt's error plus the attempt count that produced it.
#[derive(Debug, Clone, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct RetryError {
    pub attempts: u32,
    pub elapsed: Duration,
    #[source]
    pub error: FlowError,
}

impl RetryError {
    pub fn into_inner(self) -> FlowError {
        self.error
    }
}

impl From<RetryError> for FlowError {
    fn from(err: RetryError) -> Self {
        err.error
    }
}

/// Executes one logical call with bounded, classified retries.
#[derive(Clone)]
pub struct RetryCoordinator {
    observer: Arc<dyn Observer>,
}

impl RetryCoordinator {
    pub fn new(observer: Arc<dyn Observer>) -> Self {
        Self { observer }
    }

    /// Run `operation` until it succeeds, fails terminally, or `profile.max_attempts` is reached.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(
        &self,
        profile: &RetryProfile,
        cancel: &CancelToken,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = FlowResult<T>>,
    {
        let mut context = RetryContext::new();

        loop {
            context.attempt += 1;
            let result = cancel.run(operation(context.attempt)).await.and_then(|r| r);

            let error = match result {
                Ok(value) => {
                    if context.attempt > 1 {
                        tracing::debug!(
                            profile = %profile.name,
                            attempts = context.attempt,
                            "Call succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };
            context.last_error = Some(error.kind());

            if !error.is_retryable(profile) {
                tracing::debug!(
                    profile = %profile.name,
                    attempt = context.attempt,
                    error = %error,
                    "Failure is not retryable"
                );
                return Err(Self::give_up(context, error));
            }

            if context.attempt >= profile.max_attempts {
                tracing::warn!(
                    profile = %profile.name,
                    attempts = context.attempt,
                    error = %error,
                    "Retries exhausted"
                );
                self.observer.on_give_up(&profile.name, &context);
                return Err(Self::give_up(context, error));
            }

            let delay = select_delay(context.attempt, &error, profile);
            tracing::info!(
                profile = %profile.name,
                attempt = context.attempt,
                delay = ?delay,
                error = %error,
                "Retrying call"
            );
            self.observer.on_retry(&profile.name, &context, delay);

            if let Err(cancelled) = cancel.sleep(delay).await {
                return Err(Self::give_up(context, cancelled));
            }
        }
    }

    fn give_up(context: RetryContext, error: FlowError) -> RetryError {
        RetryError {
            attempts: context.attempt,
            elapsed: context.elapsed(),
            error,
        }
    }
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(NoopObserver))
    }
}
