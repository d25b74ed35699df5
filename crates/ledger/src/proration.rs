//! Proration calculator
//!
//! Pure, side-effect-free day-weighted money math. Everything here takes
//! calendar dates and two-decimal amounts and returns rounded currency;
//! no clock reads, no database.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use time::Date;

use crate::catalog::BillingCycle;

/// Round to the nearest whole currency unit, half away from zero.
pub fn round_to_unit(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// Normalize to two-decimal currency.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Whole days in a reference period. Negative when `end < start`.
pub fn period_days(start: Date, end: Date) -> i64 {
    (end - start).whole_days()
}

/// Whole days from `effective` to `end`, floored at zero.
pub fn remaining_days(end: Date, effective: Date) -> i64 {
    (end - effective).whole_days().max(0)
}

/// Days already consumed between the period start and the effective date.
pub fn elapsed_days(start: Date, effective: Date) -> i64 {
    (effective - start).whole_days().max(0)
}

/// Intermediate values of a proration, recorded in audit metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProrationBreakdown {
    pub total_days: i64,
    pub remaining_days: i64,
    pub daily_rate: Decimal,
    pub prorated_amount: Decimal,
}

/// Prorate `amount` over `[start, end)` for the remainder after `effective`.
///
/// Degenerate periods (`end <= start`, which covers malformed `end < start`)
/// return the full amount unprorated. An effective date before the period
/// start counts the whole period; one at or past the end yields zero. The
/// result is rounded to a whole currency unit, half-up, and is never
/// negative.
pub fn calculate_proration(amount: Decimal, start: Date, end: Date, effective: Date) -> Decimal {
    prorate_with_breakdown(amount, start, end, effective).prorated_amount
}

/// Same as [`calculate_proration`], keeping the intermediate values.
pub fn prorate_with_breakdown(
    amount: Decimal,
    start: Date,
    end: Date,
    effective: Date,
) -> ProrationBreakdown {
    let total = period_days(start, end);
    if total <= 0 {
        return ProrationBreakdown {
            total_days: total,
            remaining_days: 0,
            daily_rate: Decimal::ZERO,
            prorated_amount: amount,
        };
    }

    let remaining = remaining_days(end, effective).min(total);
    let daily_rate = amount / Decimal::from(total);
    let prorated = round_to_unit(amount * Decimal::from(remaining) / Decimal::from(total));

    ProrationBreakdown {
        total_days: total,
        remaining_days: remaining,
        daily_rate,
        prorated_amount: prorated,
    }
}

/// Result of a billing-cycle change proration.
///
/// `delta` is signed: positive means an additional charge for the new
/// cycle, negative means credit owed for unused value on the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleChange {
    /// Remaining value of the old cycle, at its daily rate
    pub old_remaining_value: Decimal,
    /// Cost of the new cycle for the same remaining days
    pub new_remaining_cost: Decimal,
    /// `new_remaining_cost - old_remaining_value`
    pub delta: Decimal,
    pub remaining_days: i64,
}

/// Compute the signed proration delta for switching billing cycles
/// mid-period.
///
/// Each side uses its cycle-specific day base (30 monthly, 365 yearly)
/// for the daily rate, weighted by the days remaining between
/// `effective` and `period_end`.
pub fn calculate_cycle_change(
    old_amount: Decimal,
    old_cycle: BillingCycle,
    new_amount: Decimal,
    new_cycle: BillingCycle,
    period_end: Date,
    effective: Date,
) -> CycleChange {
    let remaining = remaining_days(period_end, effective);

    let old_remaining_value = round_to_unit(
        old_amount * Decimal::from(remaining) / Decimal::from(old_cycle.day_base()),
    );
    let new_remaining_cost = round_to_unit(
        new_amount * Decimal::from(remaining) / Decimal::from(new_cycle.day_base()),
    );

    CycleChange {
        delta: new_remaining_cost - old_remaining_value,
        old_remaining_value,
        new_remaining_cost,
        remaining_days: remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::date;

    #[test]
    fn test_full_period_at_start() {
        let amount = calculate_proration(
            dec!(1000.00),
            date!(2025 - 01 - 01),
            date!(2025 - 01 - 31),
            date!(2025 - 01 - 01),
        );
        assert_eq!(amount, dec!(1000));
    }

    #[test]
    fn test_zero_at_period_end() {
        let amount = calculate_proration(
            dec!(1000.00),
            date!(2025 - 01 - 01),
            date!(2025 - 01 - 31),
            date!(2025 - 01 - 31),
        );
        assert_eq!(amount, Decimal::ZERO);
    }

    #[test]
    fn test_midpoint_is_half() {
        let amount = calculate_proration(
            dec!(1000.00),
            date!(2025 - 01 - 01),
            date!(2025 - 01 - 31),
            date!(2025 - 01 - 16),
        );
        assert_eq!(amount, dec!(500));
    }

    #[test]
    fn test_rounds_half_up_to_whole_unit() {
        // 1000 * 7 / 30 = 233.33.. -> 233; 1000 * 11 / 16 = 687.5 -> 688
        let a = calculate_proration(
            dec!(1000.00),
            date!(2025 - 03 - 01),
            date!(2025 - 03 - 31),
            date!(2025 - 03 - 24),
        );
        assert_eq!(a, dec!(233));

        let b = calculate_proration(
            dec!(1000.00),
            date!(2025 - 03 - 01),
            date!(2025 - 03 - 17),
            date!(2025 - 03 - 06),
        );
        assert_eq!(b, dec!(688));
    }

    #[test]
    fn test_degenerate_period_returns_full_amount() {
        // end == start
        let same = calculate_proration(
            dec!(750.00),
            date!(2025 - 05 - 10),
            date!(2025 - 05 - 10),
            date!(2025 - 05 - 10),
        );
        assert_eq!(same, dec!(750.00));

        // end < start is treated as a degenerate period, not an error
        let inverted = calculate_proration(
            dec!(750.00),
            date!(2025 - 05 - 10),
            date!(2025 - 05 - 01),
            date!(2025 - 05 - 05),
        );
        assert_eq!(inverted, dec!(750.00));
    }

    #[test]
    fn test_effective_after_end_is_zero() {
        let amount = calculate_proration(
            dec!(300.00),
            date!(2025 - 02 - 01),
            date!(2025 - 02 - 28),
            date!(2025 - 03 - 15),
        );
        assert_eq!(amount, Decimal::ZERO);
    }

    #[test]
    fn test_effective_before_start_clamps_to_full_amount() {
        let amount = calculate_proration(
            dec!(300.00),
            date!(2025 - 02 - 01),
            date!(2025 - 02 - 28),
            date!(2025 - 01 - 01),
        );
        assert_eq!(amount, dec!(300));
    }

    #[test]
    fn test_never_negative() {
        let b = prorate_with_breakdown(
            dec!(100.00),
            date!(2025 - 01 - 01),
            date!(2025 - 12 - 31),
            date!(2026 - 06 - 01),
        );
        assert!(b.prorated_amount >= Decimal::ZERO);
        assert_eq!(b.remaining_days, 0);
    }

    #[test]
    fn test_cycle_change_monthly_to_yearly_midpoint() {
        // Monthly 1000, yearly 10x monthly, 15 of 30 days remaining.
        // Old value: 1000 * 15/30 = 500. New cost: 10000 * 15/365 = 410.96 -> 411.
        let change = calculate_cycle_change(
            dec!(1000.00),
            BillingCycle::Monthly,
            dec!(10000.00),
            BillingCycle::Yearly,
            date!(2025 - 01 - 31),
            date!(2025 - 01 - 16),
        );
        assert_eq!(change.remaining_days, 15);
        assert_eq!(change.old_remaining_value, dec!(500));
        assert_eq!(change.new_remaining_cost, dec!(411));
        assert_eq!(change.delta, dec!(-89));
    }

    #[test]
    fn test_cycle_change_yearly_to_monthly_charges() {
        // Yearly 3650 (daily 10), monthly 600 (daily 20), 10 days remaining.
        let change = calculate_cycle_change(
            dec!(3650.00),
            BillingCycle::Yearly,
            dec!(600.00),
            BillingCycle::Monthly,
            date!(2025 - 06 - 30),
            date!(2025 - 06 - 20),
        );
        assert_eq!(change.old_remaining_value, dec!(100));
        assert_eq!(change.new_remaining_cost, dec!(200));
        assert_eq!(change.delta, dec!(100));
    }

    #[test]
    fn test_cycle_change_nothing_remaining_is_zero_delta() {
        let change = calculate_cycle_change(
            dec!(1000.00),
            BillingCycle::Monthly,
            dec!(10000.00),
            BillingCycle::Yearly,
            date!(2025 - 01 - 31),
            date!(2025 - 01 - 31),
        );
        assert_eq!(change.delta, Decimal::ZERO);
    }
}
