// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Ledger
//!
//! Tests critical boundary conditions in:
//! - Proration (LED-P01 to LED-P06)
//! - Credit drain (LED-C01 to LED-C05)
//! - Invoice adjustments (LED-A01 to LED-A06)
//! - Refund headroom and review states (LED-R01 to LED-R05)
//! - Billing date arithmetic (LED-D01 to LED-D03)

#[cfg(test)]
mod proration_tests {
    use crate::catalog::BillingCycle;
    use crate::proration::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use time::macros::date;

    // =========================================================================
    // LED-P01: Change effective on the period end date - nothing to prorate
    // =========================================================================
    #[test]
    fn test_effective_at_period_end_is_zero() {
        let amount = calculate_proration(
            dec!(1000.00),
            date!(2025 - 01 - 01),
            date!(2025 - 01 - 31),
            date!(2025 - 01 - 31),
        );
        assert_eq!(amount, Decimal::ZERO);
    }

    // =========================================================================
    // LED-P02: Change effective on the period start date - full amount
    // =========================================================================
    #[test]
    fn test_effective_at_period_start_is_full_amount() {
        let amount = calculate_proration(
            dec!(1000.00),
            date!(2025 - 01 - 01),
            date!(2025 - 01 - 31),
            date!(2025 - 01 - 01),
        );
        assert_eq!(amount, dec!(1000));
    }

    // =========================================================================
    // LED-P03: Effective after period end - clamps to zero, never negative
    // =========================================================================
    #[test]
    fn test_effective_after_period_end_clamps_to_zero() {
        let amount = calculate_proration(
            dec!(1000.00),
            date!(2025 - 01 - 01),
            date!(2025 - 01 - 31),
            date!(2025 - 02 - 10),
        );
        assert_eq!(amount, Decimal::ZERO);
    }

    // =========================================================================
    // LED-P04: Exact half units round away from zero
    // =========================================================================
    #[test]
    fn test_half_units_round_away_from_zero() {
        // 1375 * 15/30 = 687.5 -> 688
        let amount = calculate_proration(
            dec!(1375.00),
            date!(2025 - 06 - 01),
            date!(2025 - 07 - 01),
            date!(2025 - 06 - 16),
        );
        assert_eq!(amount, dec!(688));
    }

    // =========================================================================
    // LED-P05: Degenerate period (end before start) - full amount, no panic
    // =========================================================================
    #[test]
    fn test_degenerate_period_returns_full_amount() {
        let amount = calculate_proration(
            dec!(500.00),
            date!(2025 - 03 - 10),
            date!(2025 - 03 - 01),
            date!(2025 - 03 - 05),
        );
        assert_eq!(amount, dec!(500.00));
    }

    // =========================================================================
    // LED-P06: Cycle change at the period midpoint settles the delta
    // =========================================================================
    #[test]
    fn test_cycle_change_midpoint_delta() {
        // Monthly 1000 (30-day base) vs yearly 10000 (365-day base),
        // 15 days remaining: old value 500, new cost 411, delta -89.
        let change = calculate_cycle_change(
            dec!(1000.00),
            BillingCycle::Monthly,
            dec!(10000.00),
            BillingCycle::Yearly,
            date!(2025 - 05 - 16),
            date!(2025 - 05 - 01),
        );
        assert_eq!(change.remaining_days, 15);
        assert_eq!(change.old_remaining_value, dec!(500));
        assert_eq!(change.new_remaining_cost, dec!(411));
        assert_eq!(change.delta, dec!(-89));
    }
}

#[cfg(test)]
mod credit_drain_tests {
    use crate::credits::plan_drain;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    // =========================================================================
    // LED-C01: Drain spans credits in order and splits the last one
    // =========================================================================
    #[test]
    fn test_drain_spans_credits_in_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let plan = plan_drain(
            &[(a, dec!(200.00)), (b, dec!(300.00)), (c, dec!(500.00))],
            dec!(600.00),
        );

        assert_eq!(plan.total_applied, dec!(600.00));
        assert_eq!(plan.draws.len(), 3);
        assert_eq!(plan.draws[0].amount_consumed, dec!(200.00));
        assert_eq!(plan.draws[1].amount_consumed, dec!(300.00));
        assert_eq!(plan.draws[2].amount_consumed, dec!(100.00));
        assert_eq!(plan.draws[2].credit_id, c);
    }

    // =========================================================================
    // LED-C02: Need exceeds the pool - applies everything, no overdraw
    // =========================================================================
    #[test]
    fn test_drain_caps_at_pool_total() {
        let plan = plan_drain(
            &[(Uuid::new_v4(), dec!(120.00)), (Uuid::new_v4(), dec!(80.00))],
            dec!(1000.00),
        );
        assert_eq!(plan.total_applied, dec!(200.00));
    }

    // =========================================================================
    // LED-C03: Conservation - draws always sum to total_applied
    // =========================================================================
    #[test]
    fn test_drain_conserves_amounts() {
        let pool = vec![
            (Uuid::new_v4(), dec!(33.33)),
            (Uuid::new_v4(), dec!(0.01)),
            (Uuid::new_v4(), dec!(250.00)),
            (Uuid::new_v4(), dec!(9.99)),
        ];
        for needed in [dec!(0.01), dec!(33.34), dec!(100.00), dec!(293.33), dec!(999.00)] {
            let plan = plan_drain(&pool, needed);
            let drawn: Decimal = plan.draws.iter().map(|d| d.amount_consumed).sum();
            assert_eq!(drawn, plan.total_applied, "draws must sum to total for {}", needed);
            assert!(plan.total_applied <= needed);
        }
    }

    // =========================================================================
    // LED-C04: No single draw exceeds its credit's remaining amount
    // =========================================================================
    #[test]
    fn test_no_draw_exceeds_its_credit() {
        let pool = vec![
            (Uuid::new_v4(), dec!(50.00)),
            (Uuid::new_v4(), dec!(75.50)),
            (Uuid::new_v4(), dec!(25.00)),
        ];
        let plan = plan_drain(&pool, dec!(140.00));
        for draw in &plan.draws {
            let (_, remaining) = pool.iter().find(|(id, _)| *id == draw.credit_id).unwrap();
            assert!(draw.amount_consumed <= *remaining);
            assert!(draw.amount_consumed > Decimal::ZERO);
        }
    }

    // =========================================================================
    // LED-C05: Exhausted records in the pool are skipped, not drawn at zero
    // =========================================================================
    #[test]
    fn test_exhausted_credits_are_skipped() {
        let empty = Uuid::new_v4();
        let live = Uuid::new_v4();
        let plan = plan_drain(&[(empty, Decimal::ZERO), (live, dec!(40.00))], dec!(25.00));
        assert_eq!(plan.draws.len(), 1);
        assert_eq!(plan.draws[0].credit_id, live);
    }
}

#[cfg(test)]
mod adjustment_tests {
    use crate::invoices::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn record(ty: &str, amount: Decimal, original: Decimal, new: Decimal) -> InvoiceAdjustment {
        InvoiceAdjustment {
            id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            adjustment_type: ty.to_string(),
            amount,
            original_amount: original,
            new_amount: new,
            reason: "edge case".to_string(),
            adjustment_reference: None,
            created_by: Uuid::new_v4(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    // =========================================================================
    // LED-A01: Discount exactly equal to the amount - lands on zero, allowed
    // =========================================================================
    #[test]
    fn test_discount_to_exactly_zero_is_allowed() {
        let new = amount_after_adjustment(dec!(350.00), AdjustmentType::Discount, dec!(350.00)).unwrap();
        assert_eq!(new, Decimal::ZERO);
    }

    // =========================================================================
    // LED-A02: One cent past zero - rejected, not clamped
    // =========================================================================
    #[test]
    fn test_one_cent_below_zero_is_rejected() {
        let result = amount_after_adjustment(dec!(350.00), AdjustmentType::Discount, dec!(350.01));
        assert!(result.is_err());
    }

    // =========================================================================
    // LED-A03: Long mixed trail replays to the current amount
    // =========================================================================
    #[test]
    fn test_long_mixed_trail_replays() {
        // 2000 -d 500-> 1500 +s 120-> 1620 -c 1620-> 0 +s 75-> 75
        let trail = vec![
            record("discount", dec!(500.00), dec!(2000.00), dec!(1500.00)),
            record("surcharge", dec!(120.00), dec!(1500.00), dec!(1620.00)),
            record("credit", dec!(1620.00), dec!(1620.00), dec!(0.00)),
            record("surcharge", dec!(75.00), dec!(0.00), dec!(75.00)),
        ];
        assert_eq!(replay_adjustments(dec!(2000.00), &trail), dec!(75.00));
    }

    // =========================================================================
    // LED-A04: Void mid-trail resets the replay cursor to zero
    // =========================================================================
    #[test]
    fn test_void_resets_replay() {
        let trail = vec![
            record("surcharge", dec!(100.00), dec!(900.00), dec!(1000.00)),
            record("void", dec!(1000.00), dec!(1000.00), dec!(0.00)),
        ];
        assert_eq!(replay_adjustments(dec!(900.00), &trail), Decimal::ZERO);
    }

    // =========================================================================
    // LED-A05: Proration deltas replay in both directions
    // =========================================================================
    #[test]
    fn test_signed_proration_deltas_replay() {
        let trail = vec![
            record("proration", dec!(89.00), dec!(1000.00), dec!(911.00)),
            record("proration", dec!(40.00), dec!(911.00), dec!(951.00)),
        ];
        assert_eq!(replay_adjustments(dec!(1000.00), &trail), dec!(951.00));
    }

    // =========================================================================
    // LED-A06: Voided invoices refuse every further adjustment type
    // =========================================================================
    #[test]
    fn test_void_is_terminal() {
        assert!(ensure_adjustable("voided").is_err());
        assert!(ensure_items_editable("voided").is_err());
    }
}

#[cfg(test)]
mod refund_tests {
    use crate::refunds::{validate_refund_amount, RefundMethod, RefundStatus};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    // =========================================================================
    // LED-R01: Sequential partial refunds may sum to exactly the payment
    // =========================================================================
    #[test]
    fn test_partials_may_sum_to_payment() {
        let payment = dec!(1200.00);
        let mut refunded = Decimal::ZERO;
        for part in [dec!(400.00), dec!(400.00), dec!(400.00)] {
            validate_refund_amount(payment, refunded, part).unwrap();
            refunded += part;
        }
        assert_eq!(refunded, payment);
    }

    // =========================================================================
    // LED-R02: The refund after full reservation is rejected
    // =========================================================================
    #[test]
    fn test_refund_after_exhaustion_rejected() {
        assert!(validate_refund_amount(dec!(1200.00), dec!(1200.00), dec!(0.01)).is_err());
    }

    // =========================================================================
    // LED-R03: Pending reservations block a competing over-refund
    // =========================================================================
    #[test]
    fn test_pending_reservation_blocks_overrefund() {
        // 900 of 1000 reserved by a pending request; 200 more must fail
        assert!(validate_refund_amount(dec!(1000.00), dec!(900.00), dec!(200.00)).is_err());
        assert!(validate_refund_amount(dec!(1000.00), dec!(900.00), dec!(100.00)).is_ok());
    }

    // =========================================================================
    // LED-R04: Refund of the full payment in one step is valid
    // =========================================================================
    #[test]
    fn test_full_refund_in_one_step() {
        assert!(validate_refund_amount(dec!(750.00), Decimal::ZERO, dec!(750.00)).is_ok());
    }

    // =========================================================================
    // LED-R05: Only a bank transfer passes through the approved state
    // =========================================================================
    #[test]
    fn test_only_bank_transfers_wait_in_approved() {
        assert_eq!(
            RefundMethod::BankTransfer.status_after_approval(),
            RefundStatus::Approved
        );
        for method in [RefundMethod::Credit, RefundMethod::OriginalMethod] {
            assert_eq!(method.status_after_approval(), RefundStatus::Completed);
        }
    }
}

#[cfg(test)]
mod billing_date_tests {
    use crate::catalog::BillingCycle;
    use crate::subscriptions::add_cycle;
    use time::macros::date;

    // =========================================================================
    // LED-D01: Month-end anchors clamp instead of spilling into next month
    // =========================================================================
    #[test]
    fn test_month_end_anchor_clamps() {
        assert_eq!(add_cycle(date!(2025 - 01 - 30), BillingCycle::Monthly), date!(2025 - 02 - 28));
        assert_eq!(add_cycle(date!(2025 - 05 - 31), BillingCycle::Monthly), date!(2025 - 06 - 30));
    }

    // =========================================================================
    // LED-D02: A clamped anchor stays clamped on subsequent cycles
    // =========================================================================
    #[test]
    fn test_clamped_anchor_is_stable() {
        // Jan 31 -> Feb 28 -> Mar 28: the anchor does not jump back to 31
        let feb = add_cycle(date!(2025 - 01 - 31), BillingCycle::Monthly);
        let mar = add_cycle(feb, BillingCycle::Monthly);
        assert_eq!(mar, date!(2025 - 03 - 28));
    }

    // =========================================================================
    // LED-D03: Yearly renewal from Feb 29 lands on Feb 28
    // =========================================================================
    #[test]
    fn test_yearly_from_leap_day() {
        assert_eq!(add_cycle(date!(2024 - 02 - 29), BillingCycle::Yearly), date!(2025 - 02 - 28));
    }
}
