//! Retry delay selection.
//!
//! A server-provided `Retry-After` hint always wins (plus a little jitter so
//! a burst of throttled callers does not return in lockstep). Otherwise the
//! delay grows geometrically from the profile's base and is clamped to its
//! maximum.

use std::time::Duration;
use rand::Rng;

use crate::error::FlowError;
use crate::resilience::retries::RetryProfile;

/// Upper bound of the jitter added on top of a server hint.
pub const RETRY_AFTER_JITTER_MS: u64 = 100;

/// Exponential backoff for the given attempt (1-based): `base * multiplier^(attempt-1)`, capped.
pub fn calculate_backoff(attempt: u32, profile: &RetryProfile) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let delay_secs = profile.base_delay.as_secs_f64() * profile.multiplier.powi(exponent);
    let max_secs = profile.max_delay.as_secs_f64();

    if !delay_secs.is_finite() || delay_secs >= max_secs {
        return profile.max_delay;
    }
    Duration::from_secs_f64(delay_secs)
}

/// Honor a server hint, adding 0-100ms of jitter.
pub fn retry_after_delay(hint: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=RETRY_AFTER_JITTER_MS);
    hint + Duration::from_millis(jitter)
}

/// Pick the delay before the next attempt after `attempt` failed with `error`.
pub fn select_delay(attempt: u32, error: &FlowError, profile: &RetryProfile) -> Duration {
    match error.retry_after() {
        Some(hint) => retry_after_delay(hint),
        None => calculate_backoff(attempt, profile),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trading_backoff_sequence() {
        let profile = RetryProfile::trading();
        assert_eq!(calculate_backoff(1, &profile), Duration::from_millis(500));
        assert_eq!(calculate_backoff(2, &profile), Duration::from_millis(750));
        assert_eq!(calculate_backoff(3, &profile), Duration::from_micros(1_125_000));
        assert_eq!(calculate_backoff(10, &profile), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_never_exceeds_max() {
        let profile = RetryProfile::public_data();
        for attempt in 1..200 {
            assert!(calculate_backoff(attempt, &profile) <= profile.max_delay);
        }
        assert_eq!(calculate_backoff(u32::MAX, &profile), profile.max_delay);
        assert_eq!(calculate_backoff(0, &profile), Duration::ZERO);
    }

    #[test]
    fn test_retry_after_hint_wins() {
        let profile = RetryProfile::trading();
        let error = FlowError::RemoteRateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        for _ in 0..50 {
            let delay = select_delay(1, &error, &profile);
            assert!(delay >= Duration::from_secs(3));
            assert!(delay <= Duration::from_millis(3_100));
        }

        let error = FlowError::TransientRemoteFailure {
            status: 502,
            message: "bad gateway".into(),
            retry_after: None,
        };
        assert_eq!(select_delay(2, &error, &profile), Duration::from_millis(750));
    }
}
