//! Exactly-once billing of asynchronous tasks.
//!
//! A task is registered when it starts and charged when it finishes. Removal from
//! the pending map is the only "already billed" marker, so two completions racing
//! for the same task id bill once. Charged ids are remembered for the pending TTL
//! so that repeats can be told apart from ids that were never registered.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::billing::{BillingLedger, UsageEvent, UsageReceipt};
use crate::clock::{Clock, system_clock};
use crate::observability::LedgerMetrics;
use crate::tenant::TenantKey;
use crate::{Error, Result};

pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCharge {
    pub tenant: TenantKey,
    pub expected_duration_ms: Option<i64>,
    pub registered_at: i64,
}

#[derive(Debug)]
pub struct ChargeBridge {
    pending: DashMap<String, PendingCharge>,
    /// Task id -> charge time, kept for one TTL.
    settled: DashMap<String, i64>,
    billing: Arc<BillingLedger>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<LedgerMetrics>,
}

impl ChargeBridge {
    pub fn new(billing: Arc<BillingLedger>) -> Self {
        Self {
            pending: DashMap::new(),
            settled: DashMap::new(),
            billing,
            ttl: DEFAULT_PENDING_TTL,
            clock: system_clock(),
            metrics: Arc::new(LedgerMetrics::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<LedgerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Bind a task to a tenant. Re-registering an id replaces the earlier binding.
    pub fn register(
        &self,
        task_id: &str,
        tenant: &str,
        expected_duration_ms: Option<i64>,
    ) -> Result<()> {
        let task_id = task_id.trim();
        if task_id.is_empty() {
            return Err(Error::invalid_input("missing task id"));
        }
        let tenant =
            TenantKey::parse(tenant).ok_or_else(|| Error::invalid_input("missing baseId"))?;

        self.evict_stale();
        let now = self.clock.now_ms();
        self.settled.remove(task_id);
        let replaced = self.pending.insert(
            task_id.to_string(),
            PendingCharge {
                tenant: tenant.clone(),
                expected_duration_ms: expected_duration_ms.filter(|ms| *ms > 0),
                registered_at: now,
            },
        );
        if replaced.is_none() {
            self.metrics.pending_charges.inc();
        }
        tracing::debug!(task_id, tenant = %tenant, "Task registered for billing");
        Ok(())
    }

    /// Bill a finished task at most once.
    ///
    /// Unknown and already-charged ids return `None` without billing; they are
    /// counted as `unknown_charges` and `duplicate_charges` respectively. The
    /// registered duration wins over the observed one when it is positive.
    pub fn charge_once(
        &self,
        task_id: &str,
        observed_duration_ms: Option<i64>,
    ) -> Option<UsageReceipt> {
        let task_id = task_id.trim();
        let Some((task_id, charge)) = self.pending.remove(task_id) else {
            if self.settled.contains_key(task_id) {
                self.metrics.duplicate_charges.inc();
                tracing::debug!(task_id, "Charge skipped: task already billed");
            } else {
                self.metrics.unknown_charges.inc();
                tracing::debug!(task_id, "Charge skipped: task not registered");
            }
            return None;
        };
        self.metrics.pending_charges.dec();
        self.settled.insert(task_id.clone(), self.clock.now_ms());

        let mut event = UsageEvent::new(charge.tenant.as_str());
        if let Some(ms) = charge
            .expected_duration_ms
            .or(observed_duration_ms.filter(|ms| *ms > 0))
        {
            event = event.duration_ms(ms);
        }

        match self.billing.record_usage(&event) {
            Ok(receipt) => {
                self.metrics.charges.inc();
                tracing::debug!(
                    task_id = %task_id,
                    tenant = %charge.tenant,
                    minutes = %receipt.charged_minutes,
                    cost = %receipt.charged_cost,
                    "Task charged"
                );
                Some(receipt)
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Task charge failed");
                None
            }
        }
    }

    /// Drop pending charges older than the TTL without billing them, and forget
    /// charged ids older than the TTL.
    pub fn evict_stale(&self) -> usize {
        let ttl_ms = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_ms().saturating_sub(ttl_ms);
        let mut evicted = 0usize;
        self.pending.retain(|_, charge| {
            let keep = charge.registered_at >= cutoff;
            if !keep {
                evicted += 1;
                self.metrics.pending_charges.dec();
            }
            keep
        });
        self.settled.retain(|_, charged_at| *charged_at >= cutoff);
        if evicted > 0 {
            self.metrics.pending_evicted.add(evicted as u64);
            tracing::warn!(evicted, "Evicted stale pending charges");
        }
        evicted
    }

    pub fn pending(&self, task_id: &str) -> Option<PendingCharge> {
        self.pending.get(task_id.trim()).map(|entry| entry.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{MINUTE_MS, ManualClock};
    use crate::pricing::PricingProfile;
    use rust_decimal_macros::dec;

    const NOW: i64 = 1_700_000_000_000;

    fn bridge() -> (ChargeBridge, Arc<BillingLedger>, ManualClock) {
        let clock = ManualClock::new(NOW);
        let billing = Arc::new(
            BillingLedger::new(PricingProfile::builder().unit_price(dec!(0.1)).build())
                .with_clock(Arc::new(clock.clone())),
        );
        let bridge = ChargeBridge::new(billing.clone()).with_clock(Arc::new(clock.clone()));
        (bridge, billing, clock)
    }

    #[test]
    fn test_charge_once_bills_single_time() {
        let (bridge, billing, _) = bridge();
        bridge.register("task-1", "base-1", Some(2 * MINUTE_MS)).unwrap();

        let receipt = bridge.charge_once("task-1", None).unwrap();
        assert_eq!(receipt.charged_minutes, dec!(2));
        assert_eq!(receipt.charged_cost, dec!(0.2));

        assert!(bridge.charge_once("task-1", None).is_none());
        assert_eq!(billing.usage("base-1").count, dec!(2));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[test]
    fn test_unknown_task_charges_nothing() {
        let (bridge, billing, _) = bridge();
        assert!(bridge.charge_once("nope", Some(MINUTE_MS)).is_none());
        assert_eq!(billing.usage("base-1").count, dec!(0));
    }

    #[test]
    fn test_unknown_and_repeated_charges_counted_apart() {
        let (bridge, _, clock) = bridge();
        let metrics = Arc::new(LedgerMetrics::new());
        let bridge = bridge
            .with_ttl(Duration::from_secs(60))
            .with_metrics(metrics.clone());

        bridge.register("task-1", "base-1", None).unwrap();
        bridge.register("task-2", "base-1", None).unwrap();
        bridge.register("task-2", "base-2", None).unwrap();
        assert_eq!(metrics.pending_charges.get(), 2);

        assert!(bridge.charge_once("task-1", None).is_some());
        assert_eq!(metrics.pending_charges.get(), 1);
        assert!(bridge.charge_once("task-1", None).is_none());
        assert!(bridge.charge_once("ghost", None).is_none());
        assert!(bridge.charge_once("ghost", None).is_none());
        assert_eq!(metrics.duplicate_charges.get(), 1);
        assert_eq!(metrics.unknown_charges.get(), 2);

        // after one TTL the charged id is forgotten and task-2 is evicted
        clock.advance(2 * MINUTE_MS);
        assert_eq!(bridge.evict_stale(), 1);
        assert_eq!(metrics.pending_charges.get(), 0);
        assert!(bridge.charge_once("task-1", None).is_none());
        assert_eq!(metrics.duplicate_charges.get(), 1);
        assert_eq!(metrics.unknown_charges.get(), 3);
    }

    #[test]
    fn test_observed_duration_used_when_unregistered() {
        let (bridge, _, _) = bridge();
        bridge.register("task-1", "base-1", None).unwrap();
        let receipt = bridge.charge_once("task-1", Some(3 * MINUTE_MS + 5)).unwrap();
        assert_eq!(receipt.charged_minutes, dec!(4));

        bridge.register("task-2", "base-1", Some(0)).unwrap();
        let receipt = bridge.charge_once("task-2", None).unwrap();
        assert_eq!(receipt.charged_minutes, dec!(1));
    }

    #[test]
    fn test_register_validates_input() {
        let (bridge, _, _) = bridge();
        assert!(matches!(
            bridge.register(" ", "base-1", None),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            bridge.register("task-1", "", None),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[test]
    fn test_stale_entries_evicted_on_register() {
        let (bridge, billing, clock) = bridge();
        let bridge = bridge.with_ttl(Duration::from_secs(60));
        bridge.register("old", "base-1", Some(MINUTE_MS)).unwrap();

        clock.advance(2 * MINUTE_MS);
        bridge.register("new", "base-1", Some(MINUTE_MS)).unwrap();

        assert!(bridge.pending("old").is_none());
        assert!(bridge.pending("new").is_some());
        assert!(bridge.charge_once("old", None).is_none());
        assert_eq!(billing.usage("base-1").count, dec!(0));
    }

    #[test]
    fn test_concurrent_double_charge_bills_once() {
        let (bridge, billing, _) = bridge();
        let bridge = Arc::new(bridge);
        bridge.register("task-1", "base-1", Some(MINUTE_MS)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bridge = bridge.clone();
                std::thread::spawn(move || bridge.charge_once("task-1", None).is_some())
            })
            .collect();
        let charged = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|charged| *charged)
            .count();

        assert_eq!(charged, 1);
        assert_eq!(billing.usage("base-1").count, dec!(1));
    }
}
