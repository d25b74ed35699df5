//! Ledger invariant checks
//!
//! Consistency scans run over the whole ledger, intended for a
//! scheduled audit or an operator command. Each check returns
//! violations rather than failing fast, so one bad row does not hide
//! the rest.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::invoices::{replay_adjustments, InvoiceAdjustment};

/// How bad a violation is. Critical means money is wrong; warning means
/// bookkeeping drift that does not change what anyone is charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Warning,
    Critical,
}

/// One failed consistency check.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub check: &'static str,
    pub severity: ViolationSeverity,
    pub entity_id: Uuid,
    pub detail: String,
}

/// Result of a full invariant sweep.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantReport {
    pub checked_at: OffsetDateTime,
    pub violations: Vec<InvariantViolation>,
}

impl InvariantReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn critical_count(&self) -> usize {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Critical)
            .count()
    }
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and collect the violations.
    pub async fn run_all(&self) -> LedgerResult<InvariantReport> {
        let mut violations = Vec::new();
        violations.extend(self.check_invoice_amounts().await?);
        violations.extend(self.check_voided_invoices().await?);
        violations.extend(self.check_credit_bounds().await?);
        violations.extend(self.check_refund_totals().await?);
        violations.extend(self.check_cancelled_addons().await?);
        violations.extend(self.check_adjustment_replay().await?);

        for violation in &violations {
            tracing::warn!(
                check = violation.check,
                entity_id = %violation.entity_id,
                detail = %violation.detail,
                "Ledger invariant violated"
            );
        }

        Ok(InvariantReport {
            checked_at: OffsetDateTime::now_utc(),
            violations,
        })
    }

    /// Invoice amounts never go below zero.
    pub async fn check_invoice_amounts(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, Decimal)> =
            sqlx::query_as("SELECT id, amount FROM invoices WHERE amount < 0")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, amount)| InvariantViolation {
                check: "invoice_amount_non_negative",
                severity: ViolationSeverity::Critical,
                entity_id: id,
                detail: format!("invoice amount is {}", amount),
            })
            .collect())
    }

    /// A voided invoice stays at zero forever.
    pub async fn check_voided_invoices(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, Decimal)> = sqlx::query_as(
            "SELECT id, amount FROM invoices WHERE status = 'voided' AND amount <> 0",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, amount)| InvariantViolation {
                check: "voided_invoice_zeroed",
                severity: ViolationSeverity::Critical,
                entity_id: id,
                detail: format!("voided invoice still carries amount {}", amount),
            })
            .collect())
    }

    /// 0 <= remaining <= original, and a used credit has nothing left.
    pub async fn check_credit_bounds(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, Decimal, Decimal, String)> = sqlx::query_as(
            r#"
            SELECT id, original_amount, remaining_amount, status
            FROM tenant_credits
            WHERE remaining_amount < 0
               OR remaining_amount > original_amount
               OR (status = 'used' AND remaining_amount <> 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, original, remaining, status)| InvariantViolation {
                check: "credit_remaining_bounds",
                severity: ViolationSeverity::Critical,
                entity_id: id,
                detail: format!(
                    "credit is {} with remaining {} of original {}",
                    status, remaining, original
                ),
            })
            .collect())
    }

    /// Reserved refunds never exceed the payment, and the reservation
    /// matches the sum of non-rejected refund rows.
    pub async fn check_refund_totals(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, Decimal, Decimal, Decimal)> = sqlx::query_as(
            r#"
            SELECT p.id, p.amount, p.refunded_amount,
                   COALESCE(SUM(r.amount) FILTER (WHERE r.status <> 'rejected'), 0)
            FROM payments p
            LEFT JOIN payment_refunds r ON r.payment_id = p.id
            GROUP BY p.id, p.amount, p.refunded_amount
            HAVING p.refunded_amount > p.amount
                OR p.refunded_amount <> COALESCE(SUM(r.amount) FILTER (WHERE r.status <> 'rejected'), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, amount, reserved, refund_sum)| InvariantViolation {
                check: "refunds_within_payment",
                severity: ViolationSeverity::Critical,
                entity_id: id,
                detail: format!(
                    "payment of {} has {} reserved but {} in refund rows",
                    amount, reserved, refund_sum
                ),
            })
            .collect())
    }

    /// Cancelled subscriptions carry no active add-ons.
    pub async fn check_cancelled_addons(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT s.id, COUNT(*)
            FROM subscriptions s
            JOIN subscription_features sf ON sf.subscription_id = s.id AND sf.is_active = TRUE
            WHERE s.status IN ('cancelled', 'expired')
            GROUP BY s.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, count)| InvariantViolation {
                check: "no_addons_after_cancellation",
                severity: ViolationSeverity::Warning,
                entity_id: id,
                detail: format!("cancelled subscription still has {} active add-on(s)", count),
            })
            .collect())
    }

    /// Replaying an invoice's adjustment trail from its pre-adjustment
    /// amount reproduces the current amount.
    pub async fn check_adjustment_replay(&self) -> LedgerResult<Vec<InvariantViolation>> {
        let invoices: Vec<(Uuid, Decimal, Decimal)> = sqlx::query_as(
            r#"
            SELECT id, original_amount, amount
            FROM invoices
            WHERE original_amount IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut violations = Vec::new();
        for (invoice_id, original, current) in invoices {
            let trail: Vec<InvoiceAdjustment> = sqlx::query_as(
                r#"
                SELECT id, invoice_id, adjustment_type, amount, original_amount, new_amount,
                       reason, adjustment_reference, created_by, created_at
                FROM invoice_adjustments
                WHERE invoice_id = $1
                ORDER BY created_at ASC
                "#,
            )
            .bind(invoice_id)
            .fetch_all(&self.pool)
            .await?;

            let replayed = replay_adjustments(original, &trail);
            if replayed != current {
                violations.push(InvariantViolation {
                    check: "adjustment_replay",
                    severity: ViolationSeverity::Critical,
                    entity_id: invoice_id,
                    detail: format!(
                        "replaying {} adjustment(s) from {} gives {}, invoice says {}",
                        trail.len(),
                        original,
                        replayed,
                        current
                    ),
                });
            }
        }

        Ok(violations)
    }
}
