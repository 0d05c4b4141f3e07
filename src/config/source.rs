use super::ConfigResult;

/// Read-only key/value configuration backend.
///
/// Keys are dotted lowercase paths such as `trial.limit`.
#[async_trait::async_trait]
pub trait ConfigSource: Send + Sync {
    /// Source name for logging
    fn name(&self) -> &str;

    /// Raw value, or `None` when the key is not set.
    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>>;
}
