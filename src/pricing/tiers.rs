use rust_decimal::Decimal;

use super::profile::TieredPrice;

/// Cost of adding `added_minutes` to a running total of `previous_minutes`.
///
/// `tiers` must be sorted ascending by boundary with the infinite tier last (as
/// produced by [`super::PricingProfile`] normalization). A single addition is split
/// across every boundary it crosses; minutes left over once the tiers are exhausted
/// are billed at `fallback_unit_price`. Returns `None` when the cost does not fit
/// in a `Decimal`.
pub fn tier_crossing_cost(
    tiers: &[TieredPrice],
    previous_minutes: Decimal,
    added_minutes: Decimal,
    fallback_unit_price: Decimal,
) -> Option<Decimal> {
    if tiers.is_empty() {
        return added_minutes.checked_mul(fallback_unit_price);
    }

    let mut remaining = added_minutes;
    let mut cursor = previous_minutes;
    let mut cost = Decimal::ZERO;

    for tier in tiers {
        if remaining <= Decimal::ZERO {
            break;
        }
        let used = match tier.up_to_minutes {
            None => remaining,
            Some(boundary) => {
                let available = boundary.checked_sub(cursor)?;
                if available <= Decimal::ZERO {
                    continue;
                }
                remaining.min(available)
            }
        };
        cost = cost.checked_add(used.checked_mul(tier.unit_price)?)?;
        remaining -= used;
        cursor = cursor.checked_add(used)?;
    }

    if remaining > Decimal::ZERO {
        cost = cost.checked_add(remaining.checked_mul(fallback_unit_price)?)?;
    }
    Some(cost)
}

/// Unit price in effect once a tenant has used `total_minutes` today.
pub fn resolve_current_tier_unit_price(
    tiers: &[TieredPrice],
    total_minutes: Decimal,
    fallback_unit_price: Decimal,
) -> Decimal {
    tiers
        .iter()
        .find(|tier| tier.up_to_minutes.is_none_or(|b| b >= total_minutes))
        .or_else(|| tiers.last())
        .map(|tier| tier.unit_price)
        .unwrap_or(fallback_unit_price)
}
