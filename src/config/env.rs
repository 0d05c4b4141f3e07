//! Environment variable configuration source.
//!
//! Environment variables are treated as immutable at runtime, so this source is
//! read-only.

use super::source::ConfigSource;
use super::{ConfigError, ConfigResult};

pub const DEFAULT_ENV_PREFIX: &str = "METER_GATE_";

/// Maps `a.b` to `{PREFIX}A_B`.
#[derive(Debug, Clone)]
pub struct EnvConfigSource {
    prefix: String,
}

impl EnvConfigSource {
    /// Source reading `METER_GATE_*` variables
    pub fn new() -> Self {
        Self::prefixed(DEFAULT_ENV_PREFIX)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_uppercase().replace('.', "_"))
    }
}

impl Default for EnvConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConfigSource for EnvConfigSource {
    fn name(&self) -> &str {
        "env"
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        match std::env::var(self.env_key(key)) {
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(ConfigError::Env(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_key_conversion() {
        let source = EnvConfigSource::new();
        assert_eq!(source.env_key("trial.limit"), "METER_GATE_TRIAL_LIMIT");
        assert_eq!(
            source.env_key("pricing.unit_price"),
            "METER_GATE_PRICING_UNIT_PRICE"
        );

        let source = EnvConfigSource::prefixed("BILLING_");
        assert_eq!(source.env_key("bypass"), "BILLING_BYPASS");
    }

    #[tokio::test]
    async fn test_env_source_get() {
        let source = EnvConfigSource::prefixed("METER_GATE_TEST_ENV_");

        // SAFETY: Test-only environment setup with a prefix no other test uses
        unsafe { std::env::set_var("METER_GATE_TEST_ENV_TRIAL_LIMIT", "7") };
        let value = source.get_raw("trial.limit").await.unwrap();
        assert_eq!(value, Some("7".to_string()));
        unsafe { std::env::remove_var("METER_GATE_TEST_ENV_TRIAL_LIMIT") };
    }

    #[tokio::test]
    async fn test_env_source_not_found() {
        let source = EnvConfigSource::prefixed("NONEXISTENT_PREFIX_");
        assert_eq!(source.get_raw("some.key").await.unwrap(), None);
    }
}
