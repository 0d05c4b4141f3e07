use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use super::redeem::{RedeemCode, hash_code};
use crate::clock::{Clock, system_clock};
use crate::observability::LedgerMetrics;
use crate::persistence::{LedgerSnapshot, PersistenceSink};
use crate::tenant::TenantKey;
use crate::{Error, Result};

pub const DEFAULT_TRIAL_LIMIT: u32 = 3;

/// Why a tenant was (or was not) admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    Bypass,
    Admin,
    Paid,
    Trial,
    TrialExhausted,
    MissingTenant,
}

/// Admission decision for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessStatus {
    pub is_paid: bool,
    /// Free uses left; `None` means unlimited.
    pub free_remaining: Option<u32>,
    pub allowed: bool,
    pub message: String,
    pub paid_until: Option<i64>,
    pub reason: AccessReason,
}

impl AccessStatus {
    fn missing_tenant() -> Self {
        Self {
            is_paid: false,
            free_remaining: Some(0),
            allowed: false,
            message: "Missing baseId".into(),
            paid_until: None,
            reason: AccessReason::MissingTenant,
        }
    }

    fn trial(remaining: u32, paid_until: Option<i64>) -> Self {
        if remaining > 0 {
            Self::trial_spent(remaining, paid_until)
        } else {
            Self {
                is_paid: false,
                free_remaining: Some(0),
                allowed: false,
                message: "Free trial used up; purchase a plan or redeem a code to continue"
                    .into(),
                paid_until,
                reason: AccessReason::TrialExhausted,
            }
        }
    }

    /// Admitted on a trial use; `remaining` may already be zero.
    fn trial_spent(remaining: u32, paid_until: Option<i64>) -> Self {
        Self {
            is_paid: false,
            free_remaining: Some(remaining),
            allowed: true,
            message: format!("Free trial: {} use(s) remaining", remaining),
            paid_until,
            reason: AccessReason::Trial,
        }
    }
}

/// Result of a successful redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemOutcome {
    pub paid_until: i64,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    trial_usage: HashMap<TenantKey, u32>,
    paid_until: BTreeMap<TenantKey, i64>,
    admins: BTreeSet<TenantKey>,
    redeem_codes: Vec<RedeemCode>,
}

impl SubscriptionState {
    fn trial_used(&self, tenant: &TenantKey) -> u32 {
        self.trial_usage.get(tenant).copied().unwrap_or(0)
    }

    fn snapshot_patch(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            paid_until_by_tenant: Some(
                self.paid_until
                    .iter()
                    .map(|(tenant, until)| (tenant.to_string(), *until))
                    .collect(),
            ),
            admin_tenant_list: Some(self.admins.iter().map(TenantKey::to_string).collect()),
            redeem_codes: Some(self.redeem_codes.clone()),
            ..Default::default()
        }
    }
}

/// Trial counters, paid periods, the admin allow-list and redeem codes.
///
/// Every operation takes the state lock for its whole read-modify-write, so
/// `consume` and `redeem` are atomic with respect to each other.
#[derive(Debug)]
pub struct SubscriptionLedger {
    state: RwLock<SubscriptionState>,
    trial_limit: u32,
    bypass: bool,
    static_paid: HashSet<TenantKey>,
    clock: Arc<dyn Clock>,
    sink: PersistenceSink,
    metrics: Arc<LedgerMetrics>,
}

impl Default for SubscriptionLedger {
    fn default() -> Self {
        Self::new(DEFAULT_TRIAL_LIMIT)
    }
}

impl SubscriptionLedger {
    /// In-memory ledger on the system clock.
    pub fn new(trial_limit: u32) -> Self {
        Self {
            state: RwLock::new(SubscriptionState::default()),
            trial_limit,
            bypass: false,
            static_paid: HashSet::new(),
            clock: system_clock(),
            sink: PersistenceSink::disabled(),
            metrics: Arc::new(LedgerMetrics::new()),
        }
    }

    /// Admit everyone without counting trial uses (non-production override).
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_paid_tenants(mut self, tenants: impl IntoIterator<Item = TenantKey>) -> Self {
        self.static_paid.extend(tenants);
        self
    }

    pub fn with_admin_seeds(mut self, tenants: impl IntoIterator<Item = TenantKey>) -> Self {
        self.state_mut().admins.extend(tenants);
        self
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

    /// Seed persisted state. Admins are unioned with any seeds already present.
    pub fn restore(mut self, snapshot: &LedgerSnapshot) -> Self {
        let state = self.state_mut();
        if let Some(paid) = &snapshot.paid_until_by_tenant {
            state.paid_until.extend(
                paid.iter()
                    .filter_map(|(tenant, until)| Some((TenantKey::parse(tenant)?, *until))),
            );
        }
        if let Some(admins) = &snapshot.admin_tenant_list {
            state
                .admins
                .extend(admins.iter().filter_map(|t| TenantKey::parse(t)));
        }
        if let Some(codes) = &snapshot.redeem_codes {
            state.redeem_codes = codes.clone();
        }
        self
    }

    fn state_mut(&mut self) -> &mut SubscriptionState {
        self.state.get_mut().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, SubscriptionState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SubscriptionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn trial_limit(&self) -> u32 {
        self.trial_limit
    }

    pub fn is_bypass(&self) -> bool {
        self.bypass
    }

    /// Admission check without side effects.
    pub fn status(&self, tenant: &str) -> AccessStatus {
        let Some(tenant) = TenantKey::parse(tenant) else {
            return AccessStatus::missing_tenant();
        };
        let state = self.read();
        let now = self.clock.now_ms();
        self.privileged_status(&state, &tenant, now)
            .unwrap_or_else(|| {
                let remaining = self.remaining(&state, &tenant);
                AccessStatus::trial(remaining, state.paid_until.get(&tenant).copied())
            })
    }

    /// Admission check that spends one free use when the tenant is on trial.
    pub fn consume(&self, tenant: &str) -> AccessStatus {
        let Some(tenant) = TenantKey::parse(tenant) else {
            self.metrics.record_admission(false);
            return AccessStatus::missing_tenant();
        };
        let mut state = self.write();
        let now = self.clock.now_ms();

        if let Some(status) = self.privileged_status(&state, &tenant, now) {
            self.metrics.record_admission(true);
            return status;
        }

        let paid_until = state.paid_until.get(&tenant).copied();
        let remaining = self.remaining(&state, &tenant);
        if remaining == 0 {
            self.metrics.record_admission(false);
            tracing::debug!(tenant = %tenant, "Free trial exhausted");
            return AccessStatus::trial(0, paid_until);
        }

        let used = state.trial_usage.entry(tenant.clone()).or_insert(0);
        *used += 1;
        let remaining = self.trial_limit.saturating_sub(*used);
        self.metrics.record_admission(true);
        self.metrics.trial_uses.inc();
        tracing::debug!(tenant = %tenant, remaining, "Consumed free trial use");

        AccessStatus::trial_spent(remaining, paid_until)
    }

    fn remaining(&self, state: &SubscriptionState, tenant: &TenantKey) -> u32 {
        self.trial_limit.saturating_sub(state.trial_used(tenant))
    }

    fn privileged_status(
        &self,
        state: &SubscriptionState,
        tenant: &TenantKey,
        now: i64,
    ) -> Option<AccessStatus> {
        let paid_until = state.paid_until.get(tenant).copied();

        if self.bypass {
            return Some(AccessStatus {
                is_paid: true,
                free_remaining: None,
                allowed: true,
                message: "Access check bypassed".into(),
                paid_until,
                reason: AccessReason::Bypass,
            });
        }

        if state.admins.contains(tenant) {
            return Some(AccessStatus {
                is_paid: true,
                free_remaining: None,
                allowed: true,
                message: "Admin account".into(),
                paid_until,
                reason: AccessReason::Admin,
            });
        }

        let active_period = paid_until.filter(|until| *until >= now);
        if self.static_paid.contains(tenant) || active_period.is_some() {
            let message = match active_period {
                Some(until) => format!("Paid until {}", format_epoch_ms(until)),
                None => "Paid account".into(),
            };
            return Some(AccessStatus {
                is_paid: true,
                free_remaining: Some(self.remaining(state, tenant)),
                allowed: true,
                message,
                paid_until,
                reason: AccessReason::Paid,
            });
        }

        None
    }

    /// Extend a tenant's paid period by `duration_ms`.
    ///
    /// The extension starts from the latest of now, `paid_at` and the current
    /// expiry, so stacked purchases never lose unexpired time.
    pub fn activate_plan(
        &self,
        tenant: &str,
        duration_ms: i64,
        paid_at: Option<i64>,
    ) -> Result<i64> {
        let tenant = TenantKey::parse(tenant)
            .ok_or_else(|| Error::invalid_input("missing baseId"))?;
        if duration_ms <= 0 {
            return Err(Error::invalid_input("duration must be positive"));
        }

        let mut state = self.write();
        let paid_until = self.activate_locked(&mut state, &tenant, duration_ms, paid_at);
        self.sink.persist(state.snapshot_patch());
        Ok(paid_until)
    }

    fn activate_locked(
        &self,
        state: &mut SubscriptionState,
        tenant: &TenantKey,
        duration_ms: i64,
        paid_at: Option<i64>,
    ) -> i64 {
        let now = self.clock.now_ms();
        let current = state.paid_until.get(tenant).copied().unwrap_or(0);
        let start = now.max(paid_at.unwrap_or(now)).max(current);
        let paid_until = start.saturating_add(duration_ms);

        state.paid_until.insert(tenant.clone(), paid_until);
        self.metrics.plan_activations.inc();
        tracing::info!(
            tenant = %tenant,
            duration_ms,
            paid_until,
            "Activated paid period"
        );
        paid_until
    }

    /// Add or remove a tenant from the admin allow-list. Returns whether the set changed.
    pub fn set_admin(&self, tenant: &str, enabled: bool) -> Result<bool> {
        let tenant = TenantKey::parse(tenant)
            .ok_or_else(|| Error::invalid_input("missing baseId"))?;

        let mut state = self.write();
        let changed = if enabled {
            state.admins.insert(tenant.clone())
        } else {
            state.admins.remove(&tenant)
        };
        if changed {
            tracing::info!(tenant = %tenant, enabled, "Admin allow-list updated");
            self.sink.persist(state.snapshot_patch());
        }
        Ok(changed)
    }

    pub fn is_admin(&self, tenant: &str) -> bool {
        TenantKey::parse(tenant).is_some_and(|t| self.read().admins.contains(&t))
    }

    pub fn paid_until(&self, tenant: &str) -> Option<i64> {
        let tenant = TenantKey::parse(tenant)?;
        self.read().paid_until.get(&tenant).copied()
    }

    pub fn trial_used(&self, tenant: &str) -> u32 {
        TenantKey::parse(tenant)
            .map(|t| self.read().trial_used(&t))
            .unwrap_or(0)
    }

    /// Register a new single-use code worth `duration_ms` of paid time.
    pub fn add_redeem_code(&self, code: &str, duration_ms: i64) -> Result<()> {
        if code.trim().is_empty() {
            return Err(Error::invalid_input("missing code"));
        }
        if duration_ms <= 0 {
            return Err(Error::invalid_input("duration must be positive"));
        }

        let mut state = self.write();
        state.redeem_codes.push(RedeemCode::new(code, duration_ms));
        tracing::info!(duration_ms, "Redeem code added");
        self.sink.persist(state.snapshot_patch());
        Ok(())
    }

    /// Exchange a code for a paid-period extension.
    ///
    /// Lookup, activation and marking the code used all happen under one write
    /// lock, so two concurrent redemptions of the same code cannot both succeed.
    pub fn redeem(&self, tenant: &str, code: &str) -> Result<RedeemOutcome> {
        let tenant = TenantKey::parse(tenant)
            .ok_or_else(|| Error::invalid_input("missing baseId"))?;
        if code.trim().is_empty() {
            return Err(Error::invalid_input("missing code"));
        }
        let code_hash = hash_code(code);

        let mut state = self.write();
        let position = state
            .redeem_codes
            .iter()
            .position(|c| c.code_hash == code_hash && !c.is_used());

        let Some(position) = position else {
            self.metrics.redemptions_rejected.inc();
            let known = state.redeem_codes.iter().any(|c| c.code_hash == code_hash);
            tracing::warn!(tenant = %tenant, known, "Redeem code rejected");
            return Err(if known {
                Error::conflict("already used")
            } else {
                Error::not_found("invalid code")
            });
        };

        let duration_ms = state.redeem_codes[position].duration_ms;
        let paid_until = self.activate_locked(&mut state, &tenant, duration_ms, None);
        let now = self.clock.now_ms();
        state.redeem_codes[position].mark_used(tenant.as_str(), now);

        self.metrics.redemptions.inc();
        tracing::info!(tenant = %tenant, paid_until, "Redeem code used");
        self.sink.persist(state.snapshot_patch());
        Ok(RedeemOutcome { paid_until })
    }

    pub fn redeem_codes(&self) -> Vec<RedeemCode> {
        self.read().redeem_codes.clone()
    }
}

fn format_epoch_ms(epoch_ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(epoch_ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| epoch_ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DAY_MS, ManualClock};

    const NOW: i64 = 1_700_000_000_000;

    fn ledger(limit: u32) -> (SubscriptionLedger, ManualClock) {
        let clock = ManualClock::new(NOW);
        let ledger = SubscriptionLedger::new(limit).with_clock(Arc::new(clock.clone()));
        (ledger, clock)
    }

    fn key(raw: &str) -> TenantKey {
        TenantKey::parse(raw).unwrap()
    }

    #[test]
    fn test_trial_counts_down_then_denies() {
        let (ledger, _) = ledger(2);

        let first = ledger.consume("base-1");
        assert!(first.allowed);
        assert_eq!(first.free_remaining, Some(1));

        let second = ledger.consume("base-1");
        assert!(second.allowed);
        assert_eq!(second.free_remaining, Some(0));

        for _ in 0..3 {
            let denied = ledger.consume("base-1");
            assert!(!denied.allowed);
            assert_eq!(denied.free_remaining, Some(0));
            assert_eq!(denied.reason, AccessReason::TrialExhausted);
        }
        assert_eq!(ledger.trial_used("base-1"), 2);
    }

    #[test]
    fn test_status_is_read_only() {
        let (ledger, _) = ledger(1);
        for _ in 0..3 {
            let status = ledger.status("base-1");
            assert!(status.allowed);
            assert_eq!(status.free_remaining, Some(1));
        }
        assert_eq!(ledger.trial_used("base-1"), 0);
    }

    #[test]
    fn test_tenant_is_normalized() {
        let (ledger, _) = ledger(2);
        ledger.consume(" base-1 ");
        assert_eq!(ledger.status("base-1").free_remaining, Some(1));
    }

    #[test]
    fn test_missing_tenant() {
        let (ledger, _) = ledger(2);
        let status = ledger.consume("   ");
        assert!(!status.allowed);
        assert_eq!(status.reason, AccessReason::MissingTenant);
        assert!(ledger.activate_plan("", DAY_MS, None).is_err());
        assert!(ledger.set_admin(" ", true).is_err());
        assert!(ledger.redeem("", "code").is_err());
    }

    #[test]
    fn test_bypass_wins() {
        let (ledger, _) = ledger(0);
        let ledger = ledger.with_bypass(true);
        let status = ledger.consume("anyone");
        assert!(status.allowed);
        assert_eq!(status.free_remaining, None);
        assert_eq!(status.reason, AccessReason::Bypass);
        assert_eq!(ledger.trial_used("anyone"), 0);
    }

    #[test]
    fn test_admin_unlimited() {
        let (ledger, _) = ledger(0);
        assert!(ledger.set_admin("root", true).unwrap());
        assert!(!ledger.set_admin("root", true).unwrap());

        let status = ledger.consume("root");
        assert!(status.allowed && status.is_paid);
        assert_eq!(status.free_remaining, None);

        assert!(ledger.set_admin("root", false).unwrap());
        assert!(!ledger.consume("root").allowed);
    }

    #[test]
    fn test_static_paid_list() {
        let (ledger, _) = ledger(0);
        let ledger = ledger.with_paid_tenants([key("vip")]);
        let status = ledger.consume("vip");
        assert!(status.allowed && status.is_paid);
        assert_eq!(status.reason, AccessReason::Paid);
        assert_eq!(ledger.trial_used("vip"), 0);
    }

    #[test]
    fn test_activation_stacks() {
        let (ledger, _) = ledger(0);
        let first = ledger.activate_plan("base-1", 30 * DAY_MS, Some(NOW)).unwrap();
        let second = ledger.activate_plan("base-1", 30 * DAY_MS, Some(NOW)).unwrap();
        assert_eq!(first, NOW + 30 * DAY_MS);
        assert_eq!(second, first + 30 * DAY_MS);
    }

    #[test]
    fn test_activation_uses_latest_start() {
        let (ledger, clock) = ledger(0);
        // paid_at in the future
        let until = ledger
            .activate_plan("base-1", DAY_MS, Some(NOW + DAY_MS))
            .unwrap();
        assert_eq!(until, NOW + 2 * DAY_MS);

        // expired period restarts from now
        clock.advance(10 * DAY_MS);
        let until = ledger.activate_plan("base-1", DAY_MS, Some(NOW)).unwrap();
        assert_eq!(until, NOW + 11 * DAY_MS);
    }

    #[test]
    fn test_activation_rejects_bad_duration() {
        let (ledger, _) = ledger(0);
        assert!(matches!(
            ledger.activate_plan("base-1", 0, None),
            Err(Error::InvalidInput(_))
        ));
        assert!(ledger.activate_plan("base-1", -5, None).is_err());
        assert_eq!(ledger.paid_until("base-1"), None);
    }

    #[test]
    fn test_paid_expires() {
        let (ledger, clock) = ledger(0);
        ledger.activate_plan("base-1", DAY_MS, None).unwrap();
        assert!(ledger.status("base-1").is_paid);

        clock.advance(DAY_MS);
        assert!(ledger.status("base-1").is_paid, "inclusive at the boundary");

        clock.advance(1);
        let status = ledger.status("base-1");
        assert!(!status.is_paid);
        assert!(!status.allowed);
        assert_eq!(status.paid_until, Some(NOW + DAY_MS));
    }

    #[test]
    fn test_redeem_once() {
        let (ledger, _) = ledger(0);
        ledger.add_redeem_code("VIP-30", 30 * DAY_MS).unwrap();

        let outcome = ledger.redeem("base-1", " VIP-30 ").unwrap();
        assert_eq!(outcome.paid_until, NOW + 30 * DAY_MS);
        assert!(ledger.status("base-1").is_paid);

        let again = ledger.redeem("base-2", "VIP-30").unwrap_err();
        assert!(matches!(again, Error::Conflict(ref m) if m == "already used"));
        assert_eq!(ledger.paid_until("base-2"), None);

        let codes = ledger.redeem_codes();
        assert_eq!(codes[0].used_by.as_deref(), Some("base-1"));
        assert_eq!(codes[0].used_at, NOW);
    }

    #[test]
    fn test_redeem_unknown_code() {
        let (ledger, _) = ledger(0);
        let err = ledger.redeem("base-1", "nope").unwrap_err();
        assert!(matches!(err, Error::NotFound(ref m) if m == "invalid code"));
    }

    #[test]
    fn test_duplicate_codes_redeem_independently() {
        let (ledger, _) = ledger(0);
        ledger.add_redeem_code("DUP", DAY_MS).unwrap();
        ledger.add_redeem_code("DUP", DAY_MS).unwrap();
        assert!(ledger.redeem("a", "DUP").is_ok());
        assert!(ledger.redeem("b", "DUP").is_ok());
        assert!(ledger.redeem("c", "DUP").is_err());
    }

    #[test]
    fn test_add_redeem_code_validation() {
        let (ledger, _) = ledger(0);
        assert!(ledger.add_redeem_code("  ", DAY_MS).is_err());
        assert!(ledger.add_redeem_code("X", 0).is_err());
        assert!(ledger.redeem_codes().is_empty());
    }

    #[test]
    fn test_concurrent_redeem_single_winner() {
        let (ledger, _) = ledger(0);
        ledger.add_redeem_code("RACE", DAY_MS).unwrap();
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.redeem(&format!("tenant-{}", i), "RACE").is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_consume_never_overspends() {
        let (ledger, _) = ledger(5);
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    (0..10).filter(|_| ledger.consume("shared").allowed).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 5);
        assert_eq!(ledger.status("shared").free_remaining, Some(0));
    }

    #[test]
    fn test_restore_merges_admin_seeds() {
        let snapshot = LedgerSnapshot {
            paid_until_by_tenant: Some(BTreeMap::from([("base-1".to_string(), NOW + DAY_MS)])),
            admin_tenant_list: Some(vec!["persisted".to_string()]),
            ..Default::default()
        };
        let (ledger, _) = ledger(0);
        let ledger = ledger.with_admin_seeds([key("seeded")]).restore(&snapshot);

        assert!(ledger.is_admin("seeded"));
        assert!(ledger.is_admin("persisted"));
        assert!(ledger.status("base-1").is_paid);
    }
}
