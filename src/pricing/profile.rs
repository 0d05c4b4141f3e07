//! Pricing profile definitions and normalization of raw overrides.
//!
//! Tenant overrides arrive as loosely shaped JSON from an admin surface. Tier
//! boundaries may be expressed in minutes, hours or a generic `upTo`/`limit`
//! field; entries without a usable price are dropped, and the surviving tiers are
//! sorted ascending with the unbounded tier last.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{DEFAULT_UNIT_LABEL, tiers};
use crate::{Error, Result};

const MINUTE_BOUNDARY_KEYS: &[&str] = &["upToMinutes", "maxMinutes", "minutes"];
const HOUR_BOUNDARY_KEYS: &[&str] = &["upToHours", "maxHours", "hours"];
const GENERIC_BOUNDARY_KEYS: &[&str] = &["upTo", "limit", "max"];
const PRICE_KEYS: &[&str] = &["unitPrice", "price"];

/// One band of a tiered schedule. `up_to_minutes == None` is the unbounded tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TieredPrice {
    pub up_to_minutes: Option<Decimal>,
    pub unit_price: Decimal,
}

impl TieredPrice {
    pub fn up_to(minutes: Decimal, unit_price: Decimal) -> Self {
        Self {
            up_to_minutes: Some(minutes),
            unit_price,
        }
    }

    pub fn unbounded(unit_price: Decimal) -> Self {
        Self {
            up_to_minutes: None,
            unit_price,
        }
    }

    fn boundary_order(&self, other: &Self) -> Ordering {
        match (self.up_to_minutes, other.up_to_minutes) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// Canonical price schedule for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingProfile {
    #[serde(default)]
    pub plan_price_by_id: BTreeMap<String, Decimal>,
    pub model_unit_price: Decimal,
    pub model_unit_label: String,
    #[serde(default)]
    pub tiered_prices: Vec<TieredPrice>,
}

impl Default for PricingProfile {
    fn default() -> Self {
        Self {
            plan_price_by_id: BTreeMap::new(),
            model_unit_price: Decimal::ZERO,
            model_unit_label: DEFAULT_UNIT_LABEL.to_string(),
            tiered_prices: Vec::new(),
        }
    }
}

impl PricingProfile {
    pub fn builder() -> PricingProfileBuilder {
        PricingProfileBuilder::default()
    }

    pub fn is_tiered(&self) -> bool {
        !self.tiered_prices.is_empty()
    }

    /// Cost of adding `added_minutes` on top of `previous_minutes` already used today.
    /// `None` on arithmetic overflow.
    pub fn cost_for(&self, previous_minutes: Decimal, added_minutes: Decimal) -> Option<Decimal> {
        tiers::tier_crossing_cost(
            &self.tiered_prices,
            previous_minutes,
            added_minutes,
            self.model_unit_price,
        )
    }

    pub fn unit_price_at(&self, total_minutes: Decimal) -> Decimal {
        tiers::resolve_current_tier_unit_price(
            &self.tiered_prices,
            total_minutes,
            self.model_unit_price,
        )
    }

    pub fn plan_price(&self, plan_id: &str) -> Option<Decimal> {
        self.plan_price_by_id.get(plan_id.trim()).copied()
    }
}

#[derive(Debug, Default)]
pub struct PricingProfileBuilder {
    plan_prices: BTreeMap<String, Decimal>,
    unit_price: Option<Decimal>,
    unit_label: Option<String>,
    tiers: Vec<TieredPrice>,
}

impl PricingProfileBuilder {
    pub fn unit_price(mut self, price: Decimal) -> Self {
        self.unit_price = Some(price);
        self
    }

    pub fn unit_label(mut self, label: impl Into<String>) -> Self {
        self.unit_label = Some(label.into());
        self
    }

    pub fn tier(mut self, up_to_minutes: Decimal, unit_price: Decimal) -> Self {
        self.tiers.push(TieredPrice::up_to(up_to_minutes, unit_price));
        self
    }

    pub fn terminal_tier(mut self, unit_price: Decimal) -> Self {
        self.tiers.push(TieredPrice::unbounded(unit_price));
        self
    }

    pub fn tiers(mut self, tiers: impl IntoIterator<Item = TieredPrice>) -> Self {
        self.tiers.extend(tiers);
        self
    }

    pub fn plan(mut self, plan_id: impl Into<String>, price: Decimal) -> Self {
        self.plan_prices.insert(plan_id.into(), price);
        self
    }

    pub fn build(self) -> PricingProfile {
        let default = PricingProfile::default();
        PricingProfile {
            plan_price_by_id: self.plan_prices,
            model_unit_price: self.unit_price.unwrap_or(default.model_unit_price),
            model_unit_label: self.unit_label.unwrap_or(default.model_unit_label),
            tiered_prices: sort_tiers(self.tiers),
        }
    }
}

/// Tenant-specific override as stored in the snapshot. Absent fields inherit the
/// installation default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_price_by_id: Option<BTreeMap<String, Decimal>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_unit_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_unit_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiered_prices: Option<Vec<TieredPrice>>,
}

impl PricingOverride {
    /// Normalize a raw admin-supplied override.
    ///
    /// Rejects anything that is not an object, a negative or non-numeric unit price,
    /// and a non-array tier list. Individual malformed tiers or plan prices are
    /// dropped rather than failing the whole override.
    pub fn from_value(raw: &Value) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| Error::invalid_input("pricing must be a JSON object"))?;

        let model_unit_price = match lookup(obj, &["modelUnitPrice", "unitPrice"]) {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                to_decimal(value)
                    .filter(|price| !price.is_sign_negative())
                    .ok_or_else(|| {
                        Error::invalid_input("modelUnitPrice must be a non-negative number")
                    })?,
            ),
        };

        let model_unit_label = lookup(obj, &["modelUnitLabel", "unitLabel"])
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string);

        let plan_price_by_id = match lookup(obj, &["planPriceById", "planPrices"]) {
            None | Some(Value::Null) => None,
            Some(Value::Object(plans)) => Some(normalize_plan_prices(plans)),
            Some(_) => return Err(Error::invalid_input("planPriceById must be an object")),
        };

        let tiered_prices = match lookup(obj, &["tieredPrices", "tiers"]) {
            None | Some(Value::Null) => None,
            Some(Value::Array(entries)) => Some(normalize_tiers(entries)),
            Some(_) => return Err(Error::invalid_input("tieredPrices must be an array")),
        };

        Ok(Self {
            plan_price_by_id,
            model_unit_price,
            model_unit_label,
            tiered_prices,
        })
    }

    /// Merge this override over the installation default.
    pub fn apply(&self, default: &PricingProfile) -> PricingProfile {
        let mut plan_price_by_id = default.plan_price_by_id.clone();
        if let Some(plans) = &self.plan_price_by_id {
            plan_price_by_id.extend(plans.iter().map(|(id, price)| (id.clone(), *price)));
        }

        PricingProfile {
            plan_price_by_id,
            model_unit_price: self.model_unit_price.unwrap_or(default.model_unit_price),
            model_unit_label: self
                .model_unit_label
                .clone()
                .unwrap_or_else(|| default.model_unit_label.clone()),
            tiered_prices: match &self.tiered_prices {
                Some(tiers) => sort_tiers(tiers.clone()),
                None => default.tiered_prices.clone(),
            },
        }
    }
}

/// Normalize a raw tier list: drop entries without a usable price or boundary,
/// convert hour boundaries to minutes, sort ascending with the unbounded tier last.
pub(crate) fn normalize_tiers(entries: &[Value]) -> Vec<TieredPrice> {
    let tiers = entries.iter().filter_map(|entry| {
        let obj = entry.as_object()?;
        let unit_price = lookup(obj, PRICE_KEYS)
            .and_then(to_decimal)
            .filter(|price| !price.is_sign_negative())?;
        let up_to_minutes = tier_boundary(obj)?;
        Some(TieredPrice {
            up_to_minutes,
            unit_price,
        })
    });
    sort_tiers(tiers.collect())
}

pub(crate) fn normalize_plan_prices(plans: &Map<String, Value>) -> BTreeMap<String, Decimal> {
    plans
        .iter()
        .filter_map(|(plan_id, price)| {
            let plan_id = plan_id.trim();
            let price = to_decimal(price).filter(|p| !p.is_sign_negative())?;
            (!plan_id.is_empty()).then(|| (plan_id.to_string(), price))
        })
        .collect()
}

fn sort_tiers(mut tiers: Vec<TieredPrice>) -> Vec<TieredPrice> {
    tiers.sort_by(TieredPrice::boundary_order);
    tiers
}

/// `Some(None)` is an unbounded tier, `None` an unusable boundary.
fn tier_boundary(obj: &Map<String, Value>) -> Option<Option<Decimal>> {
    if let Some(value) = lookup(obj, MINUTE_BOUNDARY_KEYS) {
        return parse_boundary(value, Decimal::ONE);
    }
    if let Some(value) = lookup(obj, HOUR_BOUNDARY_KEYS) {
        return parse_boundary(value, Decimal::from(60));
    }
    if let Some(value) = lookup(obj, GENERIC_BOUNDARY_KEYS) {
        return parse_boundary(value, Decimal::ONE);
    }
    Some(None)
}

fn parse_boundary(value: &Value, minutes_per_unit: Decimal) -> Option<Option<Decimal>> {
    if value.is_null() {
        return Some(None);
    }
    if let Some(s) = value.as_str() {
        let s = s.trim().to_ascii_lowercase();
        if matches!(s.as_str(), "inf" | "infinity" | "+infinity" | "unlimited") {
            return Some(None);
        }
    }
    let bound = to_decimal(value)?;
    if bound <= Decimal::ZERO {
        return None;
    }
    bound.checked_mul(minutes_per_unit).map(Some)
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key))
}

pub(crate) fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_decimal(s.trim()),
        _ => None,
    }
}

pub(crate) fn parse_decimal(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}
