//! Startup configuration.
//!
//! ```rust,no_run
//! use meter_gate::config::{EnvConfigSource, GateConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GateConfig::from_source(&EnvConfigSource::new()).await?;
//! # Ok(())
//! # }
//! ```

mod env;
mod gate;
mod memory;
mod source;

pub use env::{DEFAULT_ENV_PREFIX, EnvConfigSource};
pub use gate::{GateConfig, GateConfigBuilder};
pub use memory::MemoryConfigSource;
pub use source::ConfigSource;

use thiserror::Error;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The key with invalid value
        key: String,
        /// Error message
        message: String,
    },

    /// Environment variable error
    #[error("Environment error: {0}")]
    Env(#[from] std::env::VarError),
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("trial.limit", "not a number");
        assert!(err.to_string().contains("trial.limit"));
        assert!(err.to_string().contains("not a number"));
    }
}
