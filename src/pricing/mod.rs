//! Per-tenant price schedules and the tier-crossing cost rule.

use rust_decimal::{Decimal, RoundingStrategy};

mod profile;
mod tiers;

pub use profile::{PricingOverride, PricingProfile, PricingProfileBuilder, TieredPrice};
pub use tiers::{resolve_current_tier_unit_price, tier_crossing_cost};

pub(crate) use profile::{normalize_plan_prices, normalize_tiers, parse_decimal};

/// Money precision kept by both ledgers.
pub const MONEY_SCALE: u32 = 4;

pub const DEFAULT_UNIT_LABEL: &str = "per minute";

pub fn round_money(value: Decimal) -> Decimal {
    value
        .round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_money() {
        assert_eq!(round_money(dec!(0.12345)), dec!(0.1235));
        assert_eq!(round_money(dec!(0.12344)), dec!(0.1234));
        assert_eq!(round_money(dec!(1.50000)), dec!(1.5));
    }
}
