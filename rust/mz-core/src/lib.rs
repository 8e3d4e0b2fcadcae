//! mz-core: action labels, the rules-engine boundary, and configuration.

pub mod action;
pub mod config;
pub mod oracle;

pub use action::{opponent, outcome_value, ActionLabel, DecisionKind, PlayerId, NUM_PLAYERS};
pub use config::{
    Config, ConfigError, CoordinatorConfig, InferenceConfig, LoggingConfig, SearchConfig,
};
pub use oracle::{Oracle, OracleError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
