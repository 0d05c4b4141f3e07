//! Durable snapshot of both ledgers.
//!
//! Ledgers hand partial [`LedgerSnapshot`]s to the [`PersistenceSink`], which merges
//! them onto its cached copy and writes the result through a [`SnapshotStore`].
//!
//! # File format
//!
//! ```text
//! { "paidUntilByTenant": {tenant: epochMs},
//!   "adminTenantList": [tenant, ...],
//!   "redeemCodes": [{"codeHash", "durationMs", "usedAt", "usedBy"}],
//!   "pricingByTenant": {tenant: {"planPriceById", "modelUnitPrice",
//!                                "modelUnitLabel", "tieredPrices"}},
//!   "usageByTenant": {tenant: {"count", "cost"}},
//!   "dailyUsageByTenant": {tenant: {"YYYY-MM-DD": {"minutes", "cost"}}} }
//! ```
//!
//! Every key is optional on read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::billing::{DailyUsage, UsageTotal};
use crate::pricing::PricingOverride;
use crate::subscription::RedeemCode;

mod sink;
mod store;

pub use sink::PersistenceSink;
pub use store::{JsonFileStore, MemoryStore, SnapshotStore, SyncMode};

pub type DailyUsageByDay = BTreeMap<String, DailyUsage>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_until_by_tenant: Option<BTreeMap<String, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_tenant_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeem_codes: Option<Vec<RedeemCode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing_by_tenant: Option<BTreeMap<String, PricingOverride>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_by_tenant: Option<BTreeMap<String, UsageTotal>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_usage_by_tenant: Option<BTreeMap<String, DailyUsageByDay>>,
}

impl LedgerSnapshot {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply `patch` field by field. Fields absent from the patch keep their value.
    ///
    /// Usage maps are upserted per tenant (and per day), since ledgers only send
    /// the entries an event touched. Every other field is replaced wholesale.
    pub fn merge(&mut self, patch: LedgerSnapshot) {
        let LedgerSnapshot {
            paid_until_by_tenant,
            admin_tenant_list,
            redeem_codes,
            pricing_by_tenant,
            usage_by_tenant,
            daily_usage_by_tenant,
        } = patch;

        if paid_until_by_tenant.is_some() {
            self.paid_until_by_tenant = paid_until_by_tenant;
        }
        if admin_tenant_list.is_some() {
            self.admin_tenant_list = admin_tenant_list;
        }
        if redeem_codes.is_some() {
            self.redeem_codes = redeem_codes;
        }
        if pricing_by_tenant.is_some() {
            self.pricing_by_tenant = pricing_by_tenant;
        }
        if let Some(usage) = usage_by_tenant {
            self.usage_by_tenant.get_or_insert_default().extend(usage);
        }
        if let Some(daily) = daily_usage_by_tenant {
            let merged = self.daily_usage_by_tenant.get_or_insert_default();
            for (tenant, days) in daily {
                merged.entry(tenant).or_default().extend(days);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_merge_keeps_missing_fields() {
        let mut base = LedgerSnapshot {
            paid_until_by_tenant: Some(BTreeMap::from([("a".to_string(), 10)])),
            admin_tenant_list: Some(vec!["root".to_string()]),
            ..Default::default()
        };

        base.merge(LedgerSnapshot {
            paid_until_by_tenant: Some(BTreeMap::from([("a".to_string(), 20)])),
            ..Default::default()
        });

        assert_eq!(base.paid_until_by_tenant.as_ref().unwrap()["a"], 20);
        assert_eq!(base.admin_tenant_list, Some(vec!["root".to_string()]));
        assert!(base.usage_by_tenant.is_none());
    }

    #[test]
    fn test_merge_upserts_usage_entries() {
        let day = |minutes| DailyUsage {
            minutes,
            cost: dec!(0),
        };
        let mut base = LedgerSnapshot {
            usage_by_tenant: Some(BTreeMap::from([(
                "a".to_string(),
                UsageTotal {
                    count: dec!(1),
                    cost: dec!(0.1),
                },
            )])),
            daily_usage_by_tenant: Some(BTreeMap::from([(
                "a".to_string(),
                BTreeMap::from([("2024-03-01".to_string(), day(dec!(1)))]),
            )])),
            ..Default::default()
        };

        base.merge(LedgerSnapshot {
            usage_by_tenant: Some(BTreeMap::from([(
                "b".to_string(),
                UsageTotal {
                    count: dec!(2),
                    cost: dec!(0.2),
                },
            )])),
            daily_usage_by_tenant: Some(BTreeMap::from([(
                "a".to_string(),
                BTreeMap::from([("2024-03-02".to_string(), day(dec!(4)))]),
            )])),
            ..Default::default()
        });

        let usage = base.usage_by_tenant.unwrap();
        assert_eq!(usage["a"].count, dec!(1));
        assert_eq!(usage["b"].count, dec!(2));
        let days = &base.daily_usage_by_tenant.unwrap()["a"];
        assert_eq!(days.len(), 2);
        assert_eq!(days["2024-03-02"].minutes, dec!(4));
    }

    #[test]
    fn test_deserialize_partial_snapshot() {
        let snapshot: LedgerSnapshot = serde_json::from_str(
            r#"{"usageByTenant":{"t":{"count":3,"cost":0.45}},"unknownKey":true}"#,
        )
        .unwrap();
        let usage = snapshot.usage_by_tenant.unwrap()["t"];
        assert_eq!(usage.count, dec!(3));
        assert_eq!(usage.cost, dec!(0.45));
        assert!(snapshot.paid_until_by_tenant.is_none());
    }

    #[test]
    fn test_serialize_skips_absent_fields() {
        let snapshot = LedgerSnapshot {
            admin_tenant_list: Some(vec![]),
            ..Default::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(json, r#"{"adminTenantList":[]}"#);
        assert!(LedgerSnapshot::default().is_empty());
    }
}
