//! Refund workflow
//!
//! Refunds are requested against a recorded payment and run through a
//! pending -> approved/rejected review, with bank transfers parking in
//! `approved` until the transfer is confirmed. The refundable headroom
//! is reserved on the payment row at request time, so two concurrent
//! requests cannot both claim the same remainder; a rejection releases
//! the reservation. Credit-method refunds skip review: the tenant
//! credit is issued and the refund completes in the same transaction.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{CreditService, CreditType, IssueCreditParams, TenantCredit};
use crate::error::{LedgerError, LedgerResult};
use crate::history::{BillingEventType, BillingHistoryBuilder, HistoryService};
use crate::invoices::{generate_reference, Payment};
use crate::proration::round_money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    /// Review passed; the transfer has not been executed yet
    Approved,
    Completed,
    Rejected,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Approved => "approved",
            RefundStatus::Completed => "completed",
            RefundStatus::Rejected => "rejected",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "completed" => Some(Self::Completed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the money goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundMethod {
    /// Issued as tenant credit; completes immediately
    Credit,
    /// Returned through the payment's original method. The return is
    /// executed out of band; the ledger records it at approval.
    OriginalMethod,
    /// Manual bank transfer; needs review, bank details, and a
    /// confirmation step once the transfer is executed
    BankTransfer,
}

impl RefundMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundMethod::Credit => "credit",
            RefundMethod::OriginalMethod => "original_method",
            RefundMethod::BankTransfer => "bank_transfer",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(Self::Credit),
            "original_method" => Some(Self::OriginalMethod),
            "bank_transfer" => Some(Self::BankTransfer),
            _ => None,
        }
    }

    /// Status a pending refund moves to on approval. Bank transfers
    /// wait in `approved` until the transfer is confirmed; the other
    /// methods complete at approval time.
    pub fn status_after_approval(&self) -> RefundStatus {
        match self {
            RefundMethod::BankTransfer => RefundStatus::Approved,
            RefundMethod::Credit | RefundMethod::OriginalMethod => RefundStatus::Completed,
        }
    }
}

impl std::fmt::Display for RefundMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Destination account for a bank-transfer refund.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankDetails {
    pub account_name: String,
    pub bank_name: String,
    pub account_number: String,
}

/// Refund record against a payment.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentRefund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub tenant_id: Uuid,
    pub refund_no: String,
    pub amount: Decimal,
    pub method: String,
    pub status: String,
    pub reason: String,
    pub bank_details: Option<serde_json::Value>,
    pub processed_at: Option<OffsetDateTime>,
    pub processed_by: Option<Uuid>,
    pub created_by: Uuid,
    pub created_at: OffsetDateTime,
}

/// Check a requested refund against the payment's remaining headroom.
///
/// Completed and pending refunds both count against the headroom, so
/// the sum of refunds can never exceed the payment.
pub fn validate_refund_amount(
    payment_amount: Decimal,
    already_refunded: Decimal,
    requested: Decimal,
) -> LedgerResult<()> {
    if requested <= Decimal::ZERO {
        return Err(LedgerError::InvalidAdjustment(format!(
            "refund amount must be positive, got {}",
            requested
        )));
    }
    if already_refunded + requested > payment_amount {
        return Err(LedgerError::InvalidAdjustment(format!(
            "refund of {} exceeds the refundable remainder ({} of {} already refunded)",
            requested, already_refunded, payment_amount
        )));
    }
    Ok(())
}

/// Parameters for [`RefundService::create_refund`].
#[derive(Debug, Clone)]
pub struct CreateRefundParams {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub method: RefundMethod,
    pub reason: String,
    /// Required for bank-transfer refunds
    pub bank_details: Option<BankDetails>,
    pub created_by: Uuid,
}

/// Outcome of a refund request.
#[derive(Debug, Clone, Serialize)]
pub struct RefundOutcome {
    pub success: bool,
    pub message: String,
    pub refund: PaymentRefund,
    /// Issued immediately for credit-method refunds
    pub credit: Option<TenantCredit>,
}

/// Totals across a payment's refunds.
#[derive(Debug, Clone, Serialize)]
pub struct RefundSummary {
    pub payment: Payment,
    pub refunds: Vec<PaymentRefund>,
    pub completed_total: Decimal,
    /// Pending and approved refunds; both hold a reservation
    pub pending_total: Decimal,
    pub refundable_remainder: Decimal,
}

pub struct RefundService {
    pool: PgPool,
}

impl RefundService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Request a refund against a payment. Reserves the amount on the
    /// payment row; a credit-method refund also completes immediately.
    pub async fn create_refund(&self, params: CreateRefundParams) -> LedgerResult<RefundOutcome> {
        if params.method == RefundMethod::BankTransfer && params.bank_details.is_none() {
            return Err(LedgerError::InvalidAdjustment(
                "bank-transfer refunds require bank details".to_string(),
            ));
        }

        let amount = round_money(params.amount);
        let mut tx = self.pool.begin().await?;
        let payment = Self::lock_payment(&mut tx, params.payment_id).await?;

        validate_refund_amount(payment.amount, payment.refunded_amount, amount)?;

        let reserved = payment.refunded_amount + amount;
        sqlx::query(
            r#"
            UPDATE payments
            SET refunded_amount = $2,
                status = CASE WHEN $2 >= amount THEN 'refunded' ELSE 'partially_refunded' END
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(reserved)
        .execute(&mut *tx)
        .await?;

        let instant = params.method == RefundMethod::Credit;
        let bank_json = params
            .bank_details
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| LedgerError::InvalidAdjustment(format!("invalid bank details: {}", e)))?;

        let refund: PaymentRefund = sqlx::query_as(
            r#"
            INSERT INTO payment_refunds (
                payment_id, tenant_id, refund_no, amount, method, status,
                reason, bank_details, processed_at, processed_by, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8,
                    CASE WHEN $6 = 'completed' THEN NOW() END,
                    CASE WHEN $6 = 'completed' THEN $9 END,
                    $9)
            RETURNING
                id, payment_id, tenant_id, refund_no, amount, method, status,
                reason, bank_details, processed_at, processed_by, created_by, created_at
            "#,
        )
        .bind(payment.id)
        .bind(payment.tenant_id)
        .bind(generate_reference("REF"))
        .bind(amount)
        .bind(params.method.as_str())
        .bind(if instant { "completed" } else { "pending" })
        .bind(&params.reason)
        .bind(bank_json)
        .bind(params.created_by)
        .fetch_one(&mut *tx)
        .await?;

        let credit = if instant {
            Some(
                CreditService::issue_in_tx(
                    &mut tx,
                    IssueCreditParams {
                        tenant_id: payment.tenant_id,
                        amount,
                        credit_type: CreditType::Refund,
                        description: Some(format!("Refund {} of payment {}", refund.refund_no, payment.payment_no)),
                        reference_type: Some("payment_refund".to_string()),
                        reference_id: Some(refund.id),
                        expires_at: None,
                        created_by: params.created_by,
                    },
                )
                .await?,
            )
        } else {
            None
        };

        let subscription_id = Self::subscription_of_payment(&mut tx, payment.invoice_id).await?;
        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(
                subscription_id,
                if instant {
                    BillingEventType::RefundProcessed
                } else {
                    BillingEventType::RefundRequested
                },
                params.created_by,
            )
            .invoice(payment.invoice_id)
            .metadata(serde_json::json!({
                "refund_no": refund.refund_no,
                "amount": amount,
                "method": params.method.as_str(),
                "credit_id": credit.as_ref().map(|c| c.id),
            })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            payment_id = %payment.id,
            refund_no = %refund.refund_no,
            amount = %amount,
            method = %params.method,
            status = %refund.status,
            "Created refund"
        );

        Ok(RefundOutcome {
            success: true,
            message: if instant {
                format!("Refunded {} as tenant credit ({})", amount, refund.refund_no)
            } else {
                format!("Refund {} of {} is pending review", refund.refund_no, amount)
            },
            refund,
            credit,
        })
    }

    /// Approve or reject a pending refund. Approval moves a bank
    /// transfer to `approved` (confirmed later via
    /// [`complete_refund`](Self::complete_refund)) and completes any
    /// other method. A rejection releases the reservation on the
    /// payment.
    pub async fn process_refund(
        &self,
        refund_id: Uuid,
        approve: bool,
        decision_reason: Option<String>,
        processed_by: Uuid,
    ) -> LedgerResult<PaymentRefund> {
        let mut tx = self.pool.begin().await?;

        // Resolve the payment first so the payment row is always locked
        // before the refund row (consistent lock order with create).
        let owner: Option<(Uuid,)> =
            sqlx::query_as("SELECT payment_id FROM payment_refunds WHERE id = $1")
                .bind(refund_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (payment_id,) =
            owner.ok_or_else(|| LedgerError::NotFound(format!("refund {}", refund_id)))?;

        let payment = Self::lock_payment(&mut tx, payment_id).await?;

        let refund: PaymentRefund = sqlx::query_as(
            r#"
            SELECT id, payment_id, tenant_id, refund_no, amount, method, status,
                   reason, bank_details, processed_at, processed_by, created_by, created_at
            FROM payment_refunds
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(refund_id)
        .fetch_one(&mut *tx)
        .await?;

        if refund.status != "pending" {
            return Err(LedgerError::InvalidState(format!(
                "refund {} is {} and can no longer be processed",
                refund.refund_no, refund.status
            )));
        }

        let method = RefundMethod::from_str(&refund.method).ok_or_else(|| {
            LedgerError::InvalidState(format!(
                "refund {} has unknown method '{}'",
                refund.refund_no, refund.method
            ))
        })?;
        let new_status = if approve {
            method.status_after_approval().as_str()
        } else {
            "rejected"
        };
        let updated: PaymentRefund = sqlx::query_as(
            r#"
            UPDATE payment_refunds
            SET status = $2, processed_at = NOW(), processed_by = $3
            WHERE id = $1
            RETURNING
                id, payment_id, tenant_id, refund_no, amount, method, status,
                reason, bank_details, processed_at, processed_by, created_by, created_at
            "#,
        )
        .bind(refund.id)
        .bind(new_status)
        .bind(processed_by)
        .fetch_one(&mut *tx)
        .await?;

        if !approve {
            let released = payment.refunded_amount - refund.amount;
            sqlx::query(
                r#"
                UPDATE payments
                SET refunded_amount = $2,
                    status = CASE
                        WHEN $2 <= 0 THEN 'paid'
                        WHEN $2 >= amount THEN 'refunded'
                        ELSE 'partially_refunded'
                    END
                WHERE id = $1
                "#,
            )
            .bind(payment.id)
            .bind(released.max(Decimal::ZERO))
            .execute(&mut *tx)
            .await?;
        }

        let subscription_id = Self::subscription_of_payment(&mut tx, payment.invoice_id).await?;
        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(subscription_id, BillingEventType::RefundProcessed, processed_by)
                .invoice(payment.invoice_id)
                .metadata(serde_json::json!({
                    "refund_no": refund.refund_no,
                    "amount": refund.amount,
                    "decision": new_status,
                    "decision_reason": decision_reason,
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            refund_no = %refund.refund_no,
            decision = new_status,
            processed_by = %processed_by,
            "Processed refund"
        );

        Ok(updated)
    }

    /// Confirm an approved bank-transfer refund once the transfer has
    /// been executed.
    pub async fn complete_refund(
        &self,
        refund_id: Uuid,
        processed_by: Uuid,
    ) -> LedgerResult<PaymentRefund> {
        let mut tx = self.pool.begin().await?;

        // Same lock order as process_refund: payment before refund.
        let owner: Option<(Uuid,)> =
            sqlx::query_as("SELECT payment_id FROM payment_refunds WHERE id = $1")
                .bind(refund_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (payment_id,) =
            owner.ok_or_else(|| LedgerError::NotFound(format!("refund {}", refund_id)))?;

        let payment = Self::lock_payment(&mut tx, payment_id).await?;

        let refund: PaymentRefund = sqlx::query_as(
            r#"
            SELECT id, payment_id, tenant_id, refund_no, amount, method, status,
                   reason, bank_details, processed_at, processed_by, created_by, created_at
            FROM payment_refunds
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(refund_id)
        .fetch_one(&mut *tx)
        .await?;

        if refund.status != "approved" {
            return Err(LedgerError::InvalidState(format!(
                "refund {} is {}; only an approved refund can be completed",
                refund.refund_no, refund.status
            )));
        }

        let updated: PaymentRefund = sqlx::query_as(
            r#"
            UPDATE payment_refunds
            SET status = 'completed', processed_at = NOW(), processed_by = $2
            WHERE id = $1
            RETURNING
                id, payment_id, tenant_id, refund_no, amount, method, status,
                reason, bank_details, processed_at, processed_by, created_by, created_at
            "#,
        )
        .bind(refund.id)
        .bind(processed_by)
        .fetch_one(&mut *tx)
        .await?;

        let subscription_id = Self::subscription_of_payment(&mut tx, payment.invoice_id).await?;
        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(subscription_id, BillingEventType::RefundProcessed, processed_by)
                .invoice(payment.invoice_id)
                .metadata(serde_json::json!({
                    "refund_no": refund.refund_no,
                    "amount": refund.amount,
                    "decision": "completed",
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            refund_no = %refund.refund_no,
            processed_by = %processed_by,
            "Completed refund"
        );

        Ok(updated)
    }

    /// Refunds against a payment, newest first.
    pub async fn list_refunds(&self, payment_id: Uuid) -> LedgerResult<Vec<PaymentRefund>> {
        let refunds: Vec<PaymentRefund> = sqlx::query_as(
            r#"
            SELECT id, payment_id, tenant_id, refund_no, amount, method, status,
                   reason, bank_details, processed_at, processed_by, created_by, created_at
            FROM payment_refunds
            WHERE payment_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(refunds)
    }

    /// All refunds for a tenant, newest first, capped to `limit`.
    pub async fn list_tenant_refunds(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> LedgerResult<Vec<PaymentRefund>> {
        let refunds: Vec<PaymentRefund> = sqlx::query_as(
            r#"
            SELECT id, payment_id, tenant_id, refund_no, amount, method, status,
                   reason, bank_details, processed_at, processed_by, created_by, created_at
            FROM payment_refunds
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit.clamp(1, 50))
        .fetch_all(&self.pool)
        .await?;

        Ok(refunds)
    }

    /// Payment with its refund trail and remaining headroom.
    pub async fn refund_summary(&self, payment_id: Uuid) -> LedgerResult<RefundSummary> {
        let payment: Option<Payment> = sqlx::query_as(
            r#"
            SELECT id, invoice_id, tenant_id, payment_no, amount, refunded_amount,
                   status, method, paid_at, created_by, created_at
            FROM payments
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        let payment =
            payment.ok_or_else(|| LedgerError::NotFound(format!("payment {}", payment_id)))?;

        let refunds = self.list_refunds(payment_id).await?;

        let completed_total: Decimal = refunds
            .iter()
            .filter(|r| r.status == "completed")
            .map(|r| r.amount)
            .sum();
        let pending_total: Decimal = refunds
            .iter()
            .filter(|r| r.status == "pending" || r.status == "approved")
            .map(|r| r.amount)
            .sum();

        Ok(RefundSummary {
            refundable_remainder: payment.amount - payment.refunded_amount,
            payment,
            refunds,
            completed_total,
            pending_total,
        })
    }

    async fn lock_payment(
        tx: &mut Transaction<'_, Postgres>,
        payment_id: Uuid,
    ) -> LedgerResult<Payment> {
        let payment: Option<Payment> = sqlx::query_as(
            r#"
            SELECT id, invoice_id, tenant_id, payment_no, amount, refunded_amount,
                   status, method, paid_at, created_by, created_at
            FROM payments
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&mut **tx)
        .await?;

        payment.ok_or_else(|| LedgerError::NotFound(format!("payment {}", payment_id)))
    }

    async fn subscription_of_payment(
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
    ) -> LedgerResult<Uuid> {
        let row: (Uuid,) = sqlx::query_as("SELECT subscription_id FROM invoices WHERE id = $1")
            .bind(invoice_id)
            .fetch_one(&mut **tx)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_refund_within_headroom_is_accepted() {
        assert!(validate_refund_amount(dec!(1000.00), dec!(0.00), dec!(400.00)).is_ok());
        assert!(validate_refund_amount(dec!(1000.00), dec!(400.00), dec!(600.00)).is_ok());
    }

    #[test]
    fn test_refund_exceeding_payment_is_rejected() {
        assert!(matches!(
            validate_refund_amount(dec!(1000.00), dec!(0.00), dec!(1000.01)),
            Err(LedgerError::InvalidAdjustment(_))
        ));
        // Pending reservations count against the headroom too
        assert!(matches!(
            validate_refund_amount(dec!(1000.00), dec!(700.00), dec!(400.00)),
            Err(LedgerError::InvalidAdjustment(_))
        ));
    }

    #[test]
    fn test_zero_and_negative_refunds_are_rejected() {
        assert!(matches!(
            validate_refund_amount(dec!(1000.00), dec!(0.00), Decimal::ZERO),
            Err(LedgerError::InvalidAdjustment(_))
        ));
        assert!(matches!(
            validate_refund_amount(dec!(1000.00), dec!(0.00), dec!(-50.00)),
            Err(LedgerError::InvalidAdjustment(_))
        ));
    }

    #[test]
    fn test_method_roundtrip() {
        for method in [
            RefundMethod::Credit,
            RefundMethod::OriginalMethod,
            RefundMethod::BankTransfer,
        ] {
            assert_eq!(RefundMethod::from_str(method.as_str()), Some(method));
        }
        assert_eq!(RefundMethod::from_str("cheque"), None);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            RefundStatus::Pending,
            RefundStatus::Approved,
            RefundStatus::Completed,
            RefundStatus::Rejected,
        ] {
            assert_eq!(RefundStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(RefundStatus::from_str("reversed"), None);
    }

    #[test]
    fn test_approval_routes_by_method() {
        // Bank transfers wait for transfer confirmation; credit and
        // original-method refunds finish at approval.
        assert_eq!(
            RefundMethod::BankTransfer.status_after_approval(),
            RefundStatus::Approved
        );
        assert_eq!(
            RefundMethod::Credit.status_after_approval(),
            RefundStatus::Completed
        );
        assert_eq!(
            RefundMethod::OriginalMethod.status_after_approval(),
            RefundStatus::Completed
        );
    }

    #[test]
    fn test_bank_details_serialize_as_json() {
        let details = BankDetails {
            account_name: "Harbor View Hotel Ltd".to_string(),
            bank_name: "First National".to_string(),
            account_number: "00012345".to_string(),
        };
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["account_name"], "Harbor View Hotel Ltd");
        assert_eq!(value["account_number"], "00012345");
    }
}
