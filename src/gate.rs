//! Process-wide entry point owning both ledgers, the charge bridge and the sink.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::billing::{BillingLedger, DailyUsage, UsageEvent, UsageReceipt, UsageTotal};
use crate::charge::ChargeBridge;
use crate::clock::{Clock, system_clock};
use crate::config::GateConfig;
use crate::observability::{LedgerMetrics, MetricsSummary};
use crate::persistence::{JsonFileStore, MemoryStore, PersistenceSink, SnapshotStore, SyncMode};
use crate::pricing::PricingProfile;
use crate::subscription::{AccessStatus, RedeemOutcome, SubscriptionLedger};
use crate::{Error, Result};

/// Admission, billing and charge tracking for one installation.
///
/// Build once at startup and share behind an `Arc`. Admin operations take an
/// `authorized` flag computed by the caller's own authorization check.
///
/// ```rust,no_run
/// use meter_gate::{AccessGate, GateConfig};
///
/// # async fn example() -> meter_gate::Result<()> {
/// let gate = AccessGate::open(GateConfig::from_env().await?).await?;
/// let status = gate.consume("base-1");
/// if status.allowed {
///     gate.register_task("task-42", "base-1", None)?;
///     // ... run the task ...
///     gate.charge_task("task-42", Some(95_000));
/// }
/// gate.flush().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AccessGate {
    subscription: Arc<SubscriptionLedger>,
    billing: Arc<BillingLedger>,
    charges: ChargeBridge,
    sink: PersistenceSink,
    metrics: Arc<LedgerMetrics>,
}

impl AccessGate {
    /// Open with the store named by `config.snapshot_path`, or an in-memory store.
    pub async fn open(config: GateConfig) -> Result<Self> {
        let store: Arc<dyn SnapshotStore> = match &config.snapshot_path {
            Some(path) => {
                let mode = if config.sync_on_write {
                    SyncMode::OnWrite
                } else {
                    SyncMode::None
                };
                Arc::new(JsonFileStore::new(path).sync_mode(mode))
            }
            None => Arc::new(MemoryStore::new()),
        };
        Self::open_with_store(config, store).await
    }

    pub async fn open_with_store(
        config: GateConfig,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self> {
        Self::open_with(config, store, system_clock()).await
    }

    /// Load the snapshot, seed both ledgers and start the persistence worker.
    ///
    /// Fails when the stored snapshot cannot be read; an absent snapshot starts empty.
    pub async fn open_with(
        config: GateConfig,
        store: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store_name = store.name().to_string();
        let snapshot = store.load().await?.unwrap_or_default();
        let metrics = Arc::new(LedgerMetrics::new());
        let sink = PersistenceSink::spawn(store, snapshot.clone(), metrics.clone());

        let subscription = Arc::new(
            SubscriptionLedger::new(config.trial_limit)
                .with_bypass(config.bypass)
                .with_paid_tenants(config.paid_tenants)
                .with_admin_seeds(config.admin_tenants)
                .with_clock(clock.clone())
                .with_sink(sink.clone())
                .with_metrics(metrics.clone())
                .restore(&snapshot),
        );
        let billing = Arc::new(
            BillingLedger::new(config.default_pricing)
                .with_clock(clock.clone())
                .with_sink(sink.clone())
                .with_metrics(metrics.clone())
                .restore(&snapshot),
        );
        let charges = ChargeBridge::new(billing.clone())
            .with_ttl(config.pending_ttl)
            .with_clock(clock)
            .with_metrics(metrics.clone());

        tracing::info!(
            store = %store_name,
            restored = !snapshot.is_empty(),
            trial_limit = config.trial_limit,
            bypass = config.bypass,
            "Access gate opened"
        );
        if config.bypass {
            tracing::warn!("Admission bypass enabled; every tenant is admitted");
        }

        Ok(Self {
            subscription,
            billing,
            charges,
            sink,
            metrics,
        })
    }

    pub fn subscription(&self) -> &Arc<SubscriptionLedger> {
        &self.subscription
    }

    pub fn billing(&self) -> &Arc<BillingLedger> {
        &self.billing
    }

    pub fn charges(&self) -> &ChargeBridge {
        &self.charges
    }

    pub fn status(&self, tenant: &str) -> AccessStatus {
        self.subscription.status(tenant)
    }

    pub fn consume(&self, tenant: &str) -> AccessStatus {
        self.subscription.consume(tenant)
    }

    pub fn activate_plan(
        &self,
        tenant: &str,
        duration_ms: i64,
        paid_at: Option<i64>,
    ) -> Result<i64> {
        self.subscription.activate_plan(tenant, duration_ms, paid_at)
    }

    pub fn redeem(&self, tenant: &str, code: &str) -> Result<RedeemOutcome> {
        self.subscription.redeem(tenant, code)
    }

    pub fn record_usage(&self, event: &UsageEvent) -> Result<UsageReceipt> {
        self.billing.record_usage(event)
    }

    pub fn register_task(
        &self,
        task_id: &str,
        tenant: &str,
        expected_duration_ms: Option<i64>,
    ) -> Result<()> {
        self.charges.register(task_id, tenant, expected_duration_ms)
    }

    pub fn charge_task(
        &self,
        task_id: &str,
        observed_duration_ms: Option<i64>,
    ) -> Option<UsageReceipt> {
        self.charges.charge_once(task_id, observed_duration_ms)
    }

    pub fn usage(&self, tenant: &str) -> UsageTotal {
        self.billing.usage(tenant)
    }

    pub fn daily_usage(&self, tenant: &str, date: Option<NaiveDate>) -> DailyUsage {
        self.billing.daily_usage(tenant, date)
    }

    pub fn pricing(&self, tenant: &str) -> PricingProfile {
        self.billing.pricing(tenant)
    }

    pub fn plan_price(&self, tenant: &str, plan_id: &str) -> Option<Decimal> {
        self.billing.plan_price(tenant, plan_id)
    }

    // ========================================================================
    // Admin operations
    // ========================================================================

    pub fn set_pricing(
        &self,
        authorized: bool,
        tenant: &str,
        raw: &Value,
    ) -> Result<PricingProfile> {
        require_admin(authorized, "set_pricing")?;
        self.billing.set_pricing(tenant, raw)
    }

    pub fn clear_pricing(&self, authorized: bool, tenant: &str) -> Result<bool> {
        require_admin(authorized, "clear_pricing")?;
        self.billing.clear_pricing(tenant)
    }

    pub fn set_admin(&self, authorized: bool, tenant: &str, enabled: bool) -> Result<bool> {
        require_admin(authorized, "set_admin")?;
        self.subscription.set_admin(tenant, enabled)
    }

    pub fn add_redeem_code(&self, authorized: bool, code: &str, duration_ms: i64) -> Result<()> {
        require_admin(authorized, "add_redeem_code")?;
        self.subscription.add_redeem_code(code, duration_ms)
    }

    /// Wait until every change made so far has reached the store.
    pub async fn flush(&self) {
        self.sink.flush().await;
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }
}

fn require_admin(authorized: bool, operation: &str) -> Result<()> {
    if authorized {
        return Ok(());
    }
    tracing::warn!(operation, "Admin operation rejected");
    Err(Error::unauthorized(format!("{operation} requires admin")))
}
