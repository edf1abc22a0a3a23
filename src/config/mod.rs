//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → FlowguardConfig (validated, immutable)
//!     → handed to ResilientClient, which builds gates, caches and profiles
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    ClockConfig, FlowguardConfig, GlobalGateConfig, IdentityGateConfig, MicroCacheConfig,
    ObservabilityConfig, RetryConfig, RetryProfileConfig, TaggedCacheConfig, TransportConfig,
};
pub use validation::{validate_config, ValidationError};
