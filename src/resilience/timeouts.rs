//! Per-attempt dispatch deadline.
//!
//! A dispatch that outlives its deadline is a transport timeout: it becomes a
//! retryable `TransientRemoteFailure` with status 0. Caller-side deadlines are
//! cancellations instead (see `lifecycle::cancel`).

use std::future::Future;
use std::time::Duration;

use crate::error::{FlowError, FlowResult};

/// Status recorded for failures that never produced an HTTP status.
pub const NO_STATUS: u16 = 0;

/// Run one dispatch attempt under `deadline`.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> FlowResult<T>
where
    F: Future<Output = FlowResult<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(FlowError::TransientRemoteFailure {
            status: NO_STATUS,
            message: format!("request timed out after {}ms", deadline.as_millis()),
            retry_after: None,
        }),
    }
}
