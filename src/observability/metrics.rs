//! Metrics collection for admission, billing and persistence.
//!
//! Plain atomics, readable at any time through [`MetricsSummary`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// Billed cost is accumulated in units of 1/10_000 (the ledgers' money precision).
const COST_SCALE: u32 = 4;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add `n`, saturating at `u64::MAX`.
    pub fn add(&self, n: u64) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add(n))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Ledger metrics registry, shared by every component of one gate.
#[derive(Debug, Default)]
pub struct LedgerMetrics {
    pub admissions_allowed: Counter,
    pub admissions_denied: Counter,
    pub trial_uses: Counter,
    pub plan_activations: Counter,
    pub redemptions: Counter,
    pub redemptions_rejected: Counter,
    pub usage_records: Counter,
    pub charges: Counter,
    pub duplicate_charges: Counter,
    pub unknown_charges: Counter,
    pub pending_evicted: Counter,
    pub pending_charges: Gauge,
    pub persist_writes: Counter,
    pub persist_failures: Counter,
    billed_cost_scaled: Counter,
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admission(&self, allowed: bool) {
        if allowed {
            self.admissions_allowed.inc();
        } else {
            self.admissions_denied.inc();
        }
    }

    /// Add a billed amount. The running total saturates instead of wrapping.
    pub fn record_cost(&self, cost: Decimal) {
        if cost <= Decimal::ZERO {
            return;
        }
        let scaled = cost
            .checked_mul(Decimal::from(10u64.pow(COST_SCALE)))
            .and_then(|v| v.trunc().to_u64())
            .unwrap_or(u64::MAX);
        self.billed_cost_scaled.add(scaled);
    }

    pub fn total_billed(&self) -> Decimal {
        Decimal::new(
            i64::try_from(self.billed_cost_scaled.get()).unwrap_or(i64::MAX),
            COST_SCALE,
        )
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            admissions_allowed: self.admissions_allowed.get(),
            admissions_denied: self.admissions_denied.get(),
            trial_uses: self.trial_uses.get(),
            plan_activations: self.plan_activations.get(),
            redemptions: self.redemptions.get(),
            redemptions_rejected: self.redemptions_rejected.get(),
            usage_records: self.usage_records.get(),
            charges: self.charges.get(),
            duplicate_charges: self.duplicate_charges.get(),
            unknown_charges: self.unknown_charges.get(),
            pending_evicted: self.pending_evicted.get(),
            pending_charges: self.pending_charges.get(),
            persist_writes: self.persist_writes.get(),
            persist_failures: self.persist_failures.get(),
            total_billed: self.total_billed(),
        }
    }
}

/// Point-in-time copy of [`LedgerMetrics`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub admissions_allowed: u64,
    pub admissions_denied: u64,
    pub trial_uses: u64,
    pub plan_activations: u64,
    pub redemptions: u64,
    pub redemptions_rejected: u64,
    pub usage_records: u64,
    pub charges: u64,
    pub duplicate_charges: u64,
    pub unknown_charges: u64,
    pub pending_evicted: u64,
    pub pending_charges: i64,
    pub persist_writes: u64,
    pub persist_failures: u64,
    pub total_billed: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        gauge.inc();
        gauge.inc();
        assert_eq!(gauge.get(), 2);
        gauge.dec();
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), -1);
    }

    #[test]
    fn test_billed_cost_keeps_four_places() {
        let metrics = LedgerMetrics::new();
        metrics.record_cost(dec!(0.2));
        metrics.record_cost(dec!(0.3001));
        assert_eq!(metrics.total_billed(), dec!(0.5001));
    }

    #[test]
    fn test_billed_cost_saturates() {
        let metrics = LedgerMetrics::new();
        metrics.record_cost(Decimal::MAX);
        metrics.record_cost(Decimal::from(u64::MAX));
        metrics.record_cost(dec!(-3));
        assert_eq!(metrics.total_billed(), Decimal::new(i64::MAX, COST_SCALE));

        let counter = Counter::new();
        counter.add(u64::MAX);
        counter.add(2);
        assert_eq!(counter.get(), u64::MAX);
    }

    #[test]
    fn test_summary() {
        let metrics = LedgerMetrics::new();
        metrics.record_admission(true);
        metrics.record_admission(false);
        metrics.record_admission(false);
        let summary = metrics.summary();
        assert_eq!(summary.admissions_allowed, 1);
        assert_eq!(summary.admissions_denied, 2);
    }
}
