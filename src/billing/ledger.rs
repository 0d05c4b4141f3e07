use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;

use super::usage::{DailyUsage, UsageEvent, UsageReceipt, UsageTotal};
use crate::clock::{Clock, day_key, system_clock, utc_date};
use crate::observability::LedgerMetrics;
use crate::persistence::{DailyUsageByDay, LedgerSnapshot, PersistenceSink};
use crate::pricing::{PricingOverride, PricingProfile, round_money};
use crate::tenant::TenantKey;
use crate::{Error, Result};

#[derive(Debug, Default)]
struct BillingState {
    pricing: BTreeMap<TenantKey, PricingOverride>,
    usage: BTreeMap<TenantKey, UsageTotal>,
    daily: BTreeMap<TenantKey, DailyUsageByDay>,
}

impl BillingState {
    fn pricing_patch(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            pricing_by_tenant: Some(
                self.pricing
                    .iter()
                    .map(|(tenant, profile)| (tenant.to_string(), profile.clone()))
                    .collect(),
            ),
            ..Default::default()
        }
    }
}

/// Patch carrying only the entries one usage event touched.
fn usage_patch(
    tenant: &TenantKey,
    day: &str,
    daily: DailyUsage,
    total: UsageTotal,
) -> LedgerSnapshot {
    LedgerSnapshot {
        usage_by_tenant: Some(BTreeMap::from([(tenant.to_string(), total)])),
        daily_usage_by_tenant: Some(BTreeMap::from([(
            tenant.to_string(),
            BTreeMap::from([(day.to_string(), daily)]),
        )])),
        ..Default::default()
    }
}

/// Post-event cost, daily and cumulative usage, or `None` on overflow.
fn bill(
    pricing: &PricingProfile,
    daily: DailyUsage,
    total: UsageTotal,
    minutes: Decimal,
) -> Option<(Decimal, DailyUsage, UsageTotal)> {
    let cost = round_money(pricing.cost_for(daily.minutes, minutes)?);
    let daily = DailyUsage {
        minutes: daily.minutes.checked_add(minutes)?,
        cost: round_money(daily.cost.checked_add(cost)?),
    };
    let total = UsageTotal {
        count: total.count.checked_add(minutes)?,
        cost: round_money(total.cost.checked_add(cost)?),
    };
    Some((cost, daily, total))
}

/// Metered usage and per-tenant pricing.
///
/// Costs are computed against the tenant's running total for the calendar day
/// (UTC) the usage occurred on, so tiered bands reset at midnight.
#[derive(Debug)]
pub struct BillingLedger {
    state: RwLock<BillingState>,
    default_pricing: PricingProfile,
    clock: Arc<dyn Clock>,
    sink: PersistenceSink,
    metrics: Arc<LedgerMetrics>,
}

impl Default for BillingLedger {
    fn default() -> Self {
        Self::new(PricingProfile::default())
    }
}

impl BillingLedger {
    /// In-memory ledger on the system clock.
    pub fn new(default_pricing: PricingProfile) -> Self {
        Self {
            state: RwLock::new(BillingState::default()),
            default_pricing,
            clock: system_clock(),
            sink: PersistenceSink::disabled(),
            metrics: Arc::new(LedgerMetrics::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: PersistenceSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<LedgerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn restore(mut self, snapshot: &LedgerSnapshot) -> Self {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(pricing) = &snapshot.pricing_by_tenant {
            state.pricing.extend(
                pricing
                    .iter()
                    .filter_map(|(t, p)| Some((TenantKey::parse(t)?, p.clone()))),
            );
        }
        if let Some(usage) = &snapshot.usage_by_tenant {
            state.usage.extend(
                usage
                    .iter()
                    .filter_map(|(t, total)| Some((TenantKey::parse(t)?, *total))),
            );
        }
        if let Some(daily) = &snapshot.daily_usage_by_tenant {
            state.daily.extend(
                daily
                    .iter()
                    .filter_map(|(t, days)| Some((TenantKey::parse(t)?, days.clone()))),
            );
        }
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, BillingState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BillingState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn default_pricing(&self) -> &PricingProfile {
        &self.default_pricing
    }

    fn resolve_pricing(&self, state: &BillingState, tenant: &TenantKey) -> PricingProfile {
        match state.pricing.get(tenant) {
            Some(custom) => custom.apply(&self.default_pricing),
            None => self.default_pricing.clone(),
        }
    }

    /// Effective schedule for a tenant: its override merged over the default.
    pub fn pricing(&self, tenant: &str) -> PricingProfile {
        match TenantKey::parse(tenant) {
            Some(tenant) => self.resolve_pricing(&self.read(), &tenant),
            None => self.default_pricing.clone(),
        }
    }

    pub fn pricing_override(&self, tenant: &str) -> Option<PricingOverride> {
        let tenant = TenantKey::parse(tenant)?;
        self.read().pricing.get(&tenant).cloned()
    }

    /// Validate and store a raw pricing override; returns the effective schedule.
    pub fn set_pricing(&self, tenant: &str, raw: &Value) -> Result<PricingProfile> {
        let tenant = TenantKey::parse(tenant)
            .ok_or_else(|| Error::invalid_input("missing baseId"))?;
        let custom = PricingOverride::from_value(raw)?;

        let mut state = self.write();
        state.pricing.insert(tenant.clone(), custom);
        let effective = self.resolve_pricing(&state, &tenant);
        tracing::info!(
            tenant = %tenant,
            unit_price = %effective.model_unit_price,
            tiers = effective.tiered_prices.len(),
            "Pricing override stored"
        );
        self.sink.persist(state.pricing_patch());
        Ok(effective)
    }

    /// Drop a tenant's override so it falls back to the default schedule.
    pub fn clear_pricing(&self, tenant: &str) -> Result<bool> {
        let tenant = TenantKey::parse(tenant)
            .ok_or_else(|| Error::invalid_input("missing baseId"))?;
        let mut state = self.write();
        let removed = state.pricing.remove(&tenant).is_some();
        if removed {
            tracing::info!(tenant = %tenant, "Pricing override cleared");
            self.sink.persist(state.pricing_patch());
        }
        Ok(removed)
    }

    pub fn plan_price(&self, tenant: &str, plan_id: &str) -> Option<Decimal> {
        self.pricing(tenant).plan_price(plan_id)
    }

    /// Bill one usage event.
    pub fn record_usage(&self, event: &UsageEvent) -> Result<UsageReceipt> {
        let tenant = TenantKey::parse(&event.tenant)
            .ok_or_else(|| Error::invalid_input("missing baseId"))?;
        let minutes = event.billable_minutes();
        let occurred_at = event.occurred_at.unwrap_or_else(|| self.clock.now_ms());
        let day = day_key(utc_date(occurred_at));

        let mut state = self.write();
        let pricing = self.resolve_pricing(&state, &tenant);
        let previous_daily = state
            .daily
            .get(&tenant)
            .and_then(|days| days.get(&day))
            .copied()
            .unwrap_or_default();
        let previous_total = state.usage.get(&tenant).copied().unwrap_or_default();

        let Some((cost, daily, total)) = bill(&pricing, previous_daily, previous_total, minutes)
        else {
            tracing::warn!(tenant = %tenant, minutes = %minutes, "Usage amount out of range");
            return Err(Error::invalid_input("usage amount too large to bill"));
        };

        state
            .daily
            .entry(tenant.clone())
            .or_default()
            .insert(day.clone(), daily);
        state.usage.insert(tenant.clone(), total);

        let receipt = UsageReceipt {
            count: total.count,
            cost: total.cost,
            daily_minutes: daily.minutes,
            daily_cost: daily.cost,
            unit_price: pricing.unit_price_at(daily.minutes),
            unit_label: pricing.model_unit_label.clone(),
            charged_minutes: minutes,
            charged_cost: cost,
        };

        self.metrics.usage_records.inc();
        self.metrics.record_cost(cost);
        tracing::debug!(
            tenant = %tenant,
            day = %day,
            minutes = %minutes,
            cost = %cost,
            daily_minutes = %daily.minutes,
            "Usage recorded"
        );
        self.sink.persist(usage_patch(&tenant, &day, daily, total));
        Ok(receipt)
    }

    pub fn usage(&self, tenant: &str) -> UsageTotal {
        TenantKey::parse(tenant)
            .and_then(|t| self.read().usage.get(&t).copied())
            .unwrap_or_default()
    }

    /// Usage for one UTC day, defaulting to today.
    pub fn daily_usage(&self, tenant: &str, date: Option<NaiveDate>) -> DailyUsage {
        let Some(tenant) = TenantKey::parse(tenant) else {
            return DailyUsage::default();
        };
        let day = day_key(date.unwrap_or_else(|| utc_date(self.clock.now_ms())));
        self.read()
            .daily
            .get(&tenant)
            .and_then(|days| days.get(&day).copied())
            .unwrap_or_default()
    }

    pub fn daily_history(&self, tenant: &str) -> DailyUsageByDay {
        TenantKey::parse(tenant)
            .and_then(|t| self.read().daily.get(&t).cloned())
            .unwrap_or_default()
    }
}
