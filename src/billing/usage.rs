use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::clock::MINUTE_MS;

/// Cumulative usage for one tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotal {
    /// Billed minutes.
    #[serde(default)]
    pub count: Decimal,
    #[serde(default)]
    pub cost: Decimal,
}

/// Usage accrued on one UTC calendar day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    #[serde(default)]
    pub minutes: Decimal,
    #[serde(default)]
    pub cost: Decimal,
}

/// A billable unit of work.
///
/// The billed quantity is taken from the first usable field in order: explicit
/// `minutes`, `duration_ms` rounded up to whole minutes (at least one), `units`,
/// and finally a single minute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageEvent {
    pub tenant: String,
    pub minutes: Option<Decimal>,
    pub duration_ms: Option<i64>,
    pub units: Option<u64>,
    pub occurred_at: Option<i64>,
}

impl UsageEvent {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            ..Default::default()
        }
    }

    pub fn minutes(mut self, minutes: Decimal) -> Self {
        self.minutes = Some(minutes);
        self
    }

    pub fn duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn units(mut self, units: u64) -> Self {
        self.units = Some(units);
        self
    }

    pub fn occurred_at(mut self, epoch_ms: i64) -> Self {
        self.occurred_at = Some(epoch_ms);
        self
    }

    pub fn billable_minutes(&self) -> Decimal {
        if let Some(minutes) = self.minutes.filter(|m| *m > Decimal::ZERO) {
            return minutes;
        }
        if let Some(ms) = self.duration_ms.filter(|ms| *ms > 0) {
            let whole = ms.div_euclid(MINUTE_MS) + i64::from(ms.rem_euclid(MINUTE_MS) != 0);
            return Decimal::from(whole.max(1));
        }
        if let Some(units) = self.units.filter(|u| *u > 0) {
            return Decimal::from(units);
        }
        Decimal::ONE
    }
}

/// Result of recording one usage event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReceipt {
    /// Cumulative billed minutes for the tenant.
    pub count: Decimal,
    /// Cumulative cost for the tenant.
    pub cost: Decimal,
    pub daily_minutes: Decimal,
    pub daily_cost: Decimal,
    pub unit_price: Decimal,
    pub unit_label: String,
    pub charged_minutes: Decimal,
    pub charged_cost: Decimal,
}
