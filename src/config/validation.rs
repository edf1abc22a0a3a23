//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (rates > 0, multipliers >= 1, delays ordered)
//! - Validate addresses and URLs parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: FlowguardConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::{FlowguardConfig, RetryProfileConfig};

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("identity_gate.tokens_per_period ({tokens}) exceeds capacity ({capacity})")]
    RefillExceedsCapacity { tokens: u32, capacity: u32 },

    #[error("retry.{profile}.multiplier must be >= 1.0 (got {value})")]
    Multiplier { profile: &'static str, value: f64 },

    #[error("retry.{profile}.base_delay_ms ({base}) exceeds max_delay_ms ({max})")]
    DelayOrder { profile: &'static str, base: u64, max: u64 },

    #[error("{field} is not a valid {expected}: '{value}'")]
    Unparseable {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Check a parsed configuration for semantic errors.
pub fn validate_config(config: &FlowguardConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.global_gate.requests_per_second == 0 {
        errors.push(ValidationError::Zero {
            field: "global_gate.requests_per_second",
        });
    }

    let gate = &config.identity_gate;
    if gate.capacity == 0 {
        errors.push(ValidationError::Zero {
            field: "identity_gate.capacity",
        });
    }
    if gate.tokens_per_period == 0 {
        errors.push(ValidationError::Zero {
            field: "identity_gate.tokens_per_period",
        });
    }
    if gate.refill_period_ms == 0 {
        errors.push(ValidationError::Zero {
            field: "identity_gate.refill_period_ms",
        });
    }
    if gate.capacity > 0 && gate.tokens_per_period > gate.capacity {
        errors.push(ValidationError::RefillExceedsCapacity {
            tokens: gate.tokens_per_period,
            capacity: gate.capacity,
        });
    }

    validate_profile("trading", &config.retry.trading, &mut errors);
    validate_profile("public_data", &config.retry.public_data, &mut errors);

    if config.transport.request_timeout_ms == 0 {
        errors.push(ValidationError::Zero {
            field: "transport.request_timeout_ms",
        });
    }
    if url::Url::parse(&config.transport.base_url).is_err() {
        errors.push(ValidationError::Unparseable {
            field: "transport.base_url",
            expected: "URL",
            value: config.transport.base_url.clone(),
        });
    }

    if config.clock.probe_timeout_ms == 0 {
        errors.push(ValidationError::Zero {
            field: "clock.probe_timeout_ms",
        });
    }
    if config.clock.enabled && config.clock.resync_interval_secs == 0 {
        errors.push(ValidationError::Zero {
            field: "clock.resync_interval_secs",
        });
    }

    if config.tagged_cache.max_entries == 0 {
        errors.push(ValidationError::Zero {
            field: "tagged_cache.max_entries",
        });
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::Unparseable {
            field: "observability.metrics_address",
            expected: "socket address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_profile(
    profile: &'static str,
    config: &RetryProfileConfig,
    errors: &mut Vec<ValidationError>,
) {
    if config.max_attempts == 0 {
        errors.push(ValidationError::Zero {
            field: match profile {
                "trading" => "retry.trading.max_attempts",
                _ => "retry.public_data.max_attempts",
            },
        });
    }
    if !(config.multiplier >= 1.0 && config.multiplier.is_finite()) {
        errors.push(ValidationError::Multiplier {
            profile,
            value: config.multiplier,
        });
    }
    if config.base_delay_ms > config.max_delay_ms {
        errors.push(ValidationError::DelayOrder {
            profile,
            base: config.base_delay_ms,
            max: config.max_delay_ms,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&FlowguardConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = FlowguardConfig::default();
        config.global_gate.requests_per_second = 0;
        config.identity_gate.tokens_per_period = 50;
        config.retry.trading.multiplier = 0.5;
        config.retry.public_data.base_delay_ms = 60_000;
        config.transport.base_url = "not a url".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors.contains(&ValidationError::Zero {
            field: "global_gate.requests_per_second"
        }));
        assert!(errors.contains(&ValidationError::RefillExceedsCapacity {
            tokens: 50,
            capacity: 20
        }));
    }

    #[test]
    fn test_metrics_address_checked_only_when_enabled() {
        let mut config = FlowguardConfig::default();
        config.observability.metrics_address = "nowhere".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert!(errors[0].to_string().contains("metrics_address"));
    }
}
