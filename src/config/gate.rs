use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::Value;

use super::source::ConfigSource;
use super::{ConfigError, ConfigResult, EnvConfigSource};
use crate::charge::DEFAULT_PENDING_TTL;
use crate::pricing::{
    DEFAULT_UNIT_LABEL, PricingProfile, normalize_plan_prices, normalize_tiers, parse_decimal,
};
use crate::subscription::DEFAULT_TRIAL_LIMIT;
use crate::tenant::{TenantKey, parse_tenant_list};

const TRIAL_LIMIT: &str = "trial.limit";
const ADMIN_TENANTS: &str = "admin.tenants";
const PAID_TENANTS: &str = "paid.tenants";
const BYPASS: &str = "bypass";
const UNIT_PRICE: &str = "pricing.unit_price";
const UNIT_LABEL: &str = "pricing.unit_label";
const TIERS: &str = "pricing.tiers";
const PLANS: &str = "pricing.plans";
const SNAPSHOT_PATH: &str = "snapshot.path";
const SNAPSHOT_SYNC: &str = "snapshot.sync";
const PENDING_TTL_SECS: &str = "pending.ttl_secs";

/// Everything [`crate::AccessGate::open`] needs, resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct GateConfig {
    pub trial_limit: u32,
    pub admin_tenants: Vec<TenantKey>,
    pub paid_tenants: Vec<TenantKey>,
    /// Admit everyone without touching trial counters.
    pub bypass: bool,
    pub default_pricing: PricingProfile,
    /// `None` keeps the snapshot in memory only.
    pub snapshot_path: Option<PathBuf>,
    pub sync_on_write: bool,
    pub pending_ttl: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            trial_limit: DEFAULT_TRIAL_LIMIT,
            admin_tenants: Vec::new(),
            paid_tenants: Vec::new(),
            bypass: false,
            default_pricing: PricingProfile::default(),
            snapshot_path: None,
            sync_on_write: false,
            pending_ttl: DEFAULT_PENDING_TTL,
        }
    }
}

impl GateConfig {
    pub fn builder() -> GateConfigBuilder {
        GateConfigBuilder::default()
    }

    /// Load from `METER_GATE_*` environment variables.
    pub async fn from_env() -> ConfigResult<Self> {
        Self::from_source(&EnvConfigSource::new()).await
    }

    /// Load every key from `source`, falling back to defaults for unset keys.
    pub async fn from_source(source: &dyn ConfigSource) -> ConfigResult<Self> {
        let defaults = Self::default();

        let trial_limit = parsed(TRIAL_LIMIT, trimmed(source, TRIAL_LIMIT).await?)?
            .unwrap_or(defaults.trial_limit);
        let admin_tenants = trimmed(source, ADMIN_TENANTS)
            .await?
            .map(|raw| parse_tenant_list(&raw))
            .unwrap_or_default();
        let paid_tenants = trimmed(source, PAID_TENANTS)
            .await?
            .map(|raw| parse_tenant_list(&raw))
            .unwrap_or_default();
        let bypass = flag(BYPASS, trimmed(source, BYPASS).await?)?.unwrap_or(false);

        let mut pricing = PricingProfile::builder();
        if let Some(raw) = trimmed(source, UNIT_PRICE).await? {
            let price = parse_decimal(&raw)
                .filter(|price| !price.is_sign_negative())
                .ok_or_else(|| ConfigError::invalid(UNIT_PRICE, "expected a non-negative number"))?;
            pricing = pricing.unit_price(price);
        }
        pricing = pricing.unit_label(
            trimmed(source, UNIT_LABEL)
                .await?
                .unwrap_or_else(|| DEFAULT_UNIT_LABEL.to_string()),
        );
        match json(TIERS, trimmed(source, TIERS).await?)? {
            None => {}
            Some(Value::Array(entries)) => pricing = pricing.tiers(normalize_tiers(&entries)),
            Some(_) => return Err(ConfigError::invalid(TIERS, "expected a JSON array")),
        }
        match json(PLANS, trimmed(source, PLANS).await?)? {
            None => {}
            Some(Value::Object(plans)) => {
                for (plan_id, price) in normalize_plan_prices(&plans) {
                    pricing = pricing.plan(plan_id, price);
                }
            }
            Some(_) => return Err(ConfigError::invalid(PLANS, "expected a JSON object")),
        }

        let snapshot_path = trimmed(source, SNAPSHOT_PATH).await?.map(PathBuf::from);
        let sync_on_write = flag(SNAPSHOT_SYNC, trimmed(source, SNAPSHOT_SYNC).await?)?
            .unwrap_or(defaults.sync_on_write);
        let pending_ttl = parsed::<u64>(PENDING_TTL_SECS, trimmed(source, PENDING_TTL_SECS).await?)?
            .map(Duration::from_secs)
            .unwrap_or(defaults.pending_ttl);

        let config = Self {
            trial_limit,
            admin_tenants,
            paid_tenants,
            bypass,
            default_pricing: pricing.build(),
            snapshot_path,
            sync_on_write,
            pending_ttl,
        };
        tracing::debug!(
            source = source.name(),
            trial_limit = config.trial_limit,
            admins = config.admin_tenants.len(),
            bypass = config.bypass,
            persistent = config.snapshot_path.is_some(),
            "Gate configuration loaded"
        );
        Ok(config)
    }
}

async fn trimmed(source: &dyn ConfigSource, key: &str) -> ConfigResult<Option<String>> {
    Ok(source
        .get_raw(key)
        .await?
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty()))
}

fn parsed<T>(key: &str, raw: Option<String>) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|raw| {
        raw.parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))
    })
    .transpose()
}

fn flag(key: &str, raw: Option<String>) -> ConfigResult<Option<bool>> {
    raw.map(|raw| match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, format!("not a boolean: {raw}"))),
    })
    .transpose()
}

fn json(key: &str, raw: Option<String>) -> ConfigResult<Option<Value>> {
    raw.map(|raw| serde_json::from_str(&raw).map_err(|e| ConfigError::invalid(key, e.to_string())))
        .transpose()
}

/// Code-defined configuration.
#[derive(Debug, Default)]
pub struct GateConfigBuilder {
    config: GateConfig,
}

impl GateConfigBuilder {
    pub fn trial_limit(mut self, limit: u32) -> Self {
        self.config.trial_limit = limit;
        self
    }

    /// Blank names are ignored.
    pub fn admin(mut self, tenant: &str) -> Self {
        self.config.admin_tenants.extend(TenantKey::parse(tenant));
        self
    }

    pub fn paid(mut self, tenant: &str) -> Self {
        self.config.paid_tenants.extend(TenantKey::parse(tenant));
        self
    }

    pub fn bypass(mut self, bypass: bool) -> Self {
        self.config.bypass = bypass;
        self
    }

    pub fn default_pricing(mut self, pricing: PricingProfile) -> Self {
        self.config.default_pricing = pricing;
        self
    }

    pub fn unit_price(mut self, price: Decimal) -> Self {
        self.config.default_pricing.model_unit_price = price;
        self
    }

    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.snapshot_path = Some(path.into());
        self
    }

    pub fn sync_on_write(mut self, sync: bool) -> Self {
        self.config.sync_on_write = sync;
        self
    }

    pub fn pending_ttl(mut self, ttl: Duration) -> Self {
        self.config.pending_ttl = ttl;
        self
    }

    pub fn build(self) -> GateConfig {
        self.config
    }
}
