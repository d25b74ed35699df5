//! Invoice engine
//!
//! Line items, adjustments, void, and recompute-on-edit, with an
//! append-only `invoice_adjustments` audit trail. All mutations lock the
//! invoice row (`FOR UPDATE`) before computing the new amount, so two
//! concurrent adjustments cannot both read a stale total. The invoice
//! amount is the final safety net: it is never allowed below zero.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::credits::{CreditConsumption, CreditOrder, CreditService, CreditType, IssueCreditParams, TenantCredit};
use crate::error::{LedgerError, LedgerResult};
use crate::history::{BillingEventType, BillingHistoryBuilder, HistoryService};
use crate::proration::round_money;

/// Invoice lifecycle state. `Voided` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Rejected,
    Voided,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Rejected => "rejected",
            InvoiceStatus::Voided => "voided",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            "rejected" => Some(Self::Rejected),
            "voided" => Some(Self::Voided),
            _ => None,
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of invoice adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    Discount,
    Credit,
    Surcharge,
    Proration,
    Void,
    Refund,
}

impl AdjustmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentType::Discount => "discount",
            AdjustmentType::Credit => "credit",
            AdjustmentType::Surcharge => "surcharge",
            AdjustmentType::Proration => "proration",
            AdjustmentType::Void => "void",
            AdjustmentType::Refund => "refund",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "discount" => Some(Self::Discount),
            "credit" => Some(Self::Credit),
            "surcharge" => Some(Self::Surcharge),
            "proration" => Some(Self::Proration),
            "void" => Some(Self::Void),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

impl std::fmt::Display for AdjustmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Invoice header.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_no: String,
    /// Current amount; mutated only through adjustments and item edits
    pub amount: Decimal,
    /// Amount before the first adjustment; set once, then immutable
    pub original_amount: Option<Decimal>,
    /// Mirrors `amount` once any adjustment has been applied
    pub adjusted_amount: Option<Decimal>,
    pub status: String,
    pub due_date: Date,
    pub voided_at: Option<OffsetDateTime>,
    pub voided_reason: Option<String>,
    pub created_by: Uuid,
    pub created_at: OffsetDateTime,
}

/// Invoice line item.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvoiceItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub amount: Decimal,
    /// Amount before the first manual edit
    pub original_amount: Option<Decimal>,
    pub is_adjusted: bool,
    pub created_at: OffsetDateTime,
}

/// Append-only adjustment audit record. Never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvoiceAdjustment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub adjustment_type: String,
    /// Absolute value of the adjustment
    pub amount: Decimal,
    /// Invoice amount before this adjustment
    pub original_amount: Decimal,
    /// Invoice amount after this adjustment
    pub new_amount: Decimal,
    pub reason: String,
    /// Credit-memo reference when the adjustment reduced the amount
    pub adjustment_reference: Option<String>,
    pub created_by: Uuid,
    pub created_at: OffsetDateTime,
}

/// New line item for invoice creation.
#[derive(Debug, Clone, Deserialize)]
pub struct NewInvoiceItem {
    pub description: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Invoice with its line items.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceWithItems {
    pub invoice: Invoice,
    pub items: Vec<InvoiceItem>,
}

/// Recorded payment against an invoice. Payments are recorded, not
/// processed; gateway integration is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub payment_no: String,
    pub amount: Decimal,
    pub refunded_amount: Decimal,
    pub status: String,
    pub method: Option<String>,
    pub paid_at: OffsetDateTime,
    pub created_by: Uuid,
    pub created_at: OffsetDateTime,
}

/// Generate a human-facing reference number (`INV-…`, `REF-…`, `CM-…`).
pub(crate) fn generate_reference(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, id[..12].to_uppercase())
}

/// Compute the invoice amount after applying an adjustment.
///
/// Discount, credit and refund adjustments subtract their absolute
/// amount; surcharges add it; proration deltas are signed; void zeroes.
/// Fails with `InvalidAdjustment` when the result would be negative —
/// invalid amounts are rejected, never clamped.
pub fn amount_after_adjustment(
    current: Decimal,
    adjustment_type: AdjustmentType,
    amount: Decimal,
) -> LedgerResult<Decimal> {
    let next = match adjustment_type {
        AdjustmentType::Discount | AdjustmentType::Credit | AdjustmentType::Refund => {
            current - amount.abs()
        }
        AdjustmentType::Surcharge => current + amount.abs(),
        AdjustmentType::Proration => current + amount,
        AdjustmentType::Void => Decimal::ZERO,
    };

    if next < Decimal::ZERO {
        return Err(LedgerError::InvalidAdjustment(format!(
            "{} of {} would take invoice amount below zero (current {})",
            adjustment_type, amount, current
        )));
    }

    Ok(round_money(next))
}

/// Guard: voided invoices reject all adjustments.
pub fn ensure_adjustable(status: &str) -> LedgerResult<()> {
    if status == "voided" {
        return Err(LedgerError::InvalidState(
            "invoice is voided and can no longer be adjusted".to_string(),
        ));
    }
    Ok(())
}

/// Guard: line items of paid or voided invoices cannot be edited
/// (use an adjustment or void instead).
pub fn ensure_items_editable(status: &str) -> LedgerResult<()> {
    if status == "paid" || status == "voided" {
        return Err(LedgerError::InvalidState(format!(
            "line items of a {} invoice cannot be edited",
            status
        )));
    }
    Ok(())
}

/// Replay an invoice's ordered adjustment trail from a starting amount.
///
/// Each record is applied by direction (its `new_amount` vs
/// `original_amount` snapshot), with `void` resetting to zero. For a
/// consistent trail the result equals the invoice's current amount —
/// the audit-idempotence property the invariant checker verifies.
pub fn replay_adjustments(starting_amount: Decimal, trail: &[InvoiceAdjustment]) -> Decimal {
    let mut running = starting_amount;
    for record in trail {
        if record.adjustment_type == "void" {
            running = Decimal::ZERO;
        } else if record.new_amount >= record.original_amount {
            running += record.amount.abs();
        } else {
            running -= record.amount.abs();
        }
    }
    running
}

/// Resolve how much a credit application targets. A missing amount
/// means "cover the whole invoice"; an explicit amount must be
/// positive and within the invoice balance — never clamped.
pub fn credit_application_target(
    invoice_amount: Decimal,
    requested: Option<Decimal>,
) -> LedgerResult<Decimal> {
    let target = requested.unwrap_or(invoice_amount);
    if target <= Decimal::ZERO {
        return Err(LedgerError::InvalidAdjustment(
            "there is no outstanding amount to apply credit against".to_string(),
        ));
    }
    if target > invoice_amount {
        return Err(LedgerError::InvalidAdjustment(format!(
            "credit of {} exceeds the invoice balance of {}",
            target, invoice_amount
        )));
    }
    Ok(target)
}

/// Parameters for [`InvoiceService::apply_adjustment`].
#[derive(Debug, Clone)]
pub struct AdjustInvoiceParams {
    pub invoice_id: Uuid,
    pub adjustment_type: AdjustmentType,
    pub amount: Decimal,
    pub reason: String,
    /// Generate a credit-memo reference when the adjustment reduces the amount
    pub generate_memo: bool,
    pub created_by: Uuid,
}

/// Outcome of an adjustment; carries the resulting state so the caller
/// need not re-query.
#[derive(Debug, Clone, Serialize)]
pub struct AdjustmentOutcome {
    pub success: bool,
    pub message: String,
    pub invoice_id: Uuid,
    pub adjustment_id: Uuid,
    pub original_amount: Decimal,
    pub new_amount: Decimal,
    pub adjustment_reference: Option<String>,
}

/// Parameters for [`InvoiceService::apply_credit`].
#[derive(Debug, Clone)]
pub struct ApplyCreditParams {
    pub invoice_id: Uuid,
    /// Amount to apply; defaults to the full invoice amount
    pub amount: Option<Decimal>,
    /// Restrict consumption to a single credit
    pub credit_id: Option<Uuid>,
    pub order: CreditOrder,
    pub created_by: Uuid,
}

/// Outcome of applying tenant credit to an invoice.
#[derive(Debug, Clone, Serialize)]
pub struct CreditApplicationOutcome {
    pub success: bool,
    pub message: String,
    pub invoice_id: Uuid,
    pub amount_applied: Decimal,
    pub new_amount: Decimal,
    pub consumption: CreditConsumption,
}

/// Outcome of voiding an invoice.
#[derive(Debug, Clone, Serialize)]
pub struct VoidOutcome {
    pub success: bool,
    pub message: String,
    pub invoice_id: Uuid,
    pub voided_amount: Decimal,
    pub credit: Option<TenantCredit>,
}

/// Parameters for [`InvoiceService::update_line_item`].
#[derive(Debug, Clone)]
pub struct UpdateLineItemParams {
    pub item_id: Uuid,
    pub new_quantity: Option<i32>,
    pub new_unit_price: Option<Decimal>,
    pub new_description: Option<String>,
    pub created_by: Uuid,
}

/// Outcome of a line-item edit.
#[derive(Debug, Clone, Serialize)]
pub struct LineItemOutcome {
    pub success: bool,
    pub message: String,
    pub item_id: Uuid,
    pub item_amount: Decimal,
    pub invoice_amount: Decimal,
    /// Set when the edit changed the invoice total
    pub adjustment_id: Option<Uuid>,
}

/// Outcome of recording a payment.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentOutcome {
    pub success: bool,
    pub message: String,
    pub payment: Payment,
    pub invoice_status: String,
}

/// Invoice engine service.
pub struct InvoiceService {
    pool: PgPool,
}

impl InvoiceService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create an invoice with line items.
    pub async fn create_invoice(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        items: &[NewInvoiceItem],
        due_date: Date,
        created_by: Uuid,
    ) -> LedgerResult<Invoice> {
        let mut tx = self.pool.begin().await?;
        let invoice =
            Self::create_in_tx(&mut tx, tenant_id, subscription_id, items, due_date, created_by)
                .await?;

        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(subscription_id, BillingEventType::InvoiceCreated, created_by)
                .invoice(invoice.id)
                .amount_change(Decimal::ZERO, invoice.amount)
                .metadata(serde_json::json!({ "invoice_no": invoice.invoice_no })),
        )
        .await?;

        tx.commit().await?;
        Ok(invoice)
    }

    /// Create an invoice inside the caller's transaction (used by the
    /// add-on and subscription flows so the invoice commits with them).
    pub async fn create_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        subscription_id: Uuid,
        items: &[NewInvoiceItem],
        due_date: Date,
        created_by: Uuid,
    ) -> LedgerResult<Invoice> {
        if items.is_empty() {
            return Err(LedgerError::InvalidAdjustment(
                "an invoice needs at least one line item".to_string(),
            ));
        }
        for item in items {
            if item.quantity < 1 {
                return Err(LedgerError::InvalidAdjustment(format!(
                    "line item quantity must be at least 1, got {}",
                    item.quantity
                )));
            }
            if item.unit_price < Decimal::ZERO {
                return Err(LedgerError::InvalidAdjustment(format!(
                    "line item unit price cannot be negative, got {}",
                    item.unit_price
                )));
            }
        }

        let total: Decimal = items
            .iter()
            .map(|i| round_money(Decimal::from(i.quantity) * i.unit_price))
            .sum();
        let invoice_no = generate_reference("INV");

        let invoice: Invoice = sqlx::query_as(
            r#"
            INSERT INTO invoices (tenant_id, subscription_id, invoice_no, amount, status, due_date, created_by)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6)
            RETURNING
                id, tenant_id, subscription_id, invoice_no, amount, original_amount,
                adjusted_amount, status, due_date, voided_at, voided_reason,
                created_by, created_at
            "#,
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(&invoice_no)
        .bind(total)
        .bind(due_date)
        .bind(created_by)
        .fetch_one(&mut **tx)
        .await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO invoice_items (invoice_id, description, quantity, unit_price, amount)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(invoice.id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(round_money(Decimal::from(item.quantity) * item.unit_price))
            .execute(&mut **tx)
            .await?;
        }

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %subscription_id,
            invoice_no = %invoice.invoice_no,
            amount = %invoice.amount,
            "Created invoice"
        );

        Ok(invoice)
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> LedgerResult<Invoice> {
        let invoice: Option<Invoice> = sqlx::query_as(
            r#"
            SELECT
                id, tenant_id, subscription_id, invoice_no, amount, original_amount,
                adjusted_amount, status, due_date, voided_at, voided_reason,
                created_by, created_at
            FROM invoices
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        invoice.ok_or_else(|| LedgerError::NotFound(format!("invoice {}", invoice_id)))
    }

    pub async fn get_invoice_with_items(&self, invoice_id: Uuid) -> LedgerResult<InvoiceWithItems> {
        let invoice = self.get_invoice(invoice_id).await?;

        let items: Vec<InvoiceItem> = sqlx::query_as(
            r#"
            SELECT id, invoice_id, description, quantity, unit_price, amount,
                   original_amount, is_adjusted, created_at
            FROM invoice_items
            WHERE invoice_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(InvoiceWithItems { invoice, items })
    }

    /// Adjustment trail for an invoice, oldest first.
    pub async fn adjustment_history(&self, invoice_id: Uuid) -> LedgerResult<Vec<InvoiceAdjustment>> {
        let adjustments: Vec<InvoiceAdjustment> = sqlx::query_as(
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

        Ok(adjustments)
    }

    /// Apply a discount/credit/surcharge adjustment to an invoice.
    pub async fn apply_adjustment(&self, params: AdjustInvoiceParams) -> LedgerResult<AdjustmentOutcome> {
        if params.amount == Decimal::ZERO {
            return Err(LedgerError::InvalidAdjustment(
                "adjustment amount cannot be zero".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let invoice = Self::lock_invoice(&mut tx, params.invoice_id).await?;
        ensure_adjustable(&invoice.status)?;

        let current = invoice.amount;
        let new_amount = amount_after_adjustment(current, params.adjustment_type, params.amount)?;

        let reference = if params.generate_memo && new_amount < current {
            Some(generate_reference("CM"))
        } else {
            None
        };

        sqlx::query(
            r#"
            UPDATE invoices
            SET amount = $2,
                adjusted_amount = $2,
                original_amount = COALESCE(original_amount, $3)
            WHERE id = $1
            "#,
        )
        .bind(invoice.id)
        .bind(new_amount)
        .bind(current)
        .execute(&mut *tx)
        .await?;

        let adjustment_id = Self::insert_adjustment(
            &mut tx,
            invoice.id,
            params.adjustment_type,
            params.amount.abs(),
            current,
            new_amount,
            &params.reason,
            reference.as_deref(),
            params.created_by,
        )
        .await?;

        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(
                invoice.subscription_id,
                BillingEventType::InvoiceAdjusted,
                params.created_by,
            )
            .invoice(invoice.id)
            .amount_change(current, new_amount)
            .metadata(serde_json::json!({
                "adjustment_type": params.adjustment_type.as_str(),
                "reason": params.reason,
            })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            invoice_id = %invoice.id,
            adjustment_type = %params.adjustment_type,
            amount = %params.amount,
            old_amount = %current,
            new_amount = %new_amount,
            "Applied invoice adjustment"
        );

        Ok(AdjustmentOutcome {
            success: true,
            message: format!(
                "Applied {} of {}; invoice amount {} -> {}",
                params.adjustment_type, params.amount.abs(), current, new_amount
            ),
            invoice_id: invoice.id,
            adjustment_id,
            original_amount: current,
            new_amount,
            adjustment_reference: reference,
        })
    }

    /// Apply tenant credit to a pending invoice, draining the credit pool
    /// and recording a `credit` adjustment in one transaction.
    pub async fn apply_credit(&self, params: ApplyCreditParams) -> LedgerResult<CreditApplicationOutcome> {
        let mut tx = self.pool.begin().await?;
        let invoice = Self::lock_invoice(&mut tx, params.invoice_id).await?;

        if invoice.status != "pending" {
            return Err(LedgerError::InvalidState(format!(
                "credit can only be applied to a pending invoice (status is {})",
                invoice.status
            )));
        }

        let needed = credit_application_target(invoice.amount, params.amount)?;

        let consumption = CreditService::consume_in_tx(
            &mut tx,
            invoice.tenant_id,
            needed,
            params.credit_id,
            params.order,
        )
        .await?;

        let applied = consumption.total_applied;
        let current = invoice.amount;
        let new_amount = amount_after_adjustment(current, AdjustmentType::Credit, applied)?;

        sqlx::query(
            r#"
            UPDATE invoices
            SET amount = $2,
                adjusted_amount = $2,
                original_amount = COALESCE(original_amount, $3)
            WHERE id = $1
            "#,
        )
        .bind(invoice.id)
        .bind(new_amount)
        .bind(current)
        .execute(&mut *tx)
        .await?;

        Self::insert_adjustment(
            &mut tx,
            invoice.id,
            AdjustmentType::Credit,
            applied,
            current,
            new_amount,
            &format!("tenant credit applied across {} credit(s)", consumption.draws.len()),
            None,
            params.created_by,
        )
        .await?;

        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(
                invoice.subscription_id,
                BillingEventType::CreditConsumed,
                params.created_by,
            )
            .invoice(invoice.id)
            .amount_change(current, new_amount)
            .metadata(serde_json::json!({
                "requested": consumption.requested,
                "applied": applied,
                "credits_drained": consumption.draws.len(),
            })),
        )
        .await?;

        tx.commit().await?;

        Ok(CreditApplicationOutcome {
            success: true,
            message: format!("Applied {} of tenant credit; invoice amount {} -> {}", applied, current, new_amount),
            invoice_id: invoice.id,
            amount_applied: applied,
            new_amount,
            consumption,
        })
    }

    /// Void an invoice. Terminal: no further amount mutation afterwards.
    ///
    /// A paid invoice voided with `create_credit` issues exactly one
    /// tenant credit for the voided amount.
    pub async fn void_invoice(
        &self,
        invoice_id: Uuid,
        reason: &str,
        create_credit: bool,
        created_by: Uuid,
    ) -> LedgerResult<VoidOutcome> {
        let mut tx = self.pool.begin().await?;
        let invoice = Self::lock_invoice(&mut tx, invoice_id).await?;

        if invoice.status == "voided" {
            return Err(LedgerError::InvalidState(format!(
                "invoice {} is already voided",
                invoice.invoice_no
            )));
        }

        let was_paid = invoice.status == "paid";
        let voided_amount = invoice.amount;

        sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'voided',
                amount = 0,
                adjusted_amount = 0,
                original_amount = COALESCE(original_amount, $2),
                voided_at = NOW(),
                voided_reason = $3
            WHERE id = $1
            "#,
        )
        .bind(invoice.id)
        .bind(voided_amount)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        Self::insert_adjustment(
            &mut tx,
            invoice.id,
            AdjustmentType::Void,
            voided_amount,
            voided_amount,
            Decimal::ZERO,
            reason,
            None,
            created_by,
        )
        .await?;

        let credit = if was_paid && create_credit && voided_amount > Decimal::ZERO {
            Some(
                CreditService::issue_in_tx(
                    &mut tx,
                    IssueCreditParams {
                        tenant_id: invoice.tenant_id,
                        amount: voided_amount,
                        credit_type: CreditType::Refund,
                        description: Some(format!("Voided paid invoice {}", invoice.invoice_no)),
                        reference_type: Some("invoice".to_string()),
                        reference_id: Some(invoice.id),
                        expires_at: None,
                        created_by,
                    },
                )
                .await?,
            )
        } else {
            None
        };

        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(
                invoice.subscription_id,
                BillingEventType::InvoiceVoided,
                created_by,
            )
            .invoice(invoice.id)
            .amount_change(voided_amount, Decimal::ZERO)
            .metadata(serde_json::json!({
                "reason": reason,
                "was_paid": was_paid,
                "credit_issued": credit.as_ref().map(|c| c.id),
            })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            invoice_id = %invoice.id,
            invoice_no = %invoice.invoice_no,
            voided_amount = %voided_amount,
            credit_issued = credit.is_some(),
            "Voided invoice"
        );

        Ok(VoidOutcome {
            success: true,
            message: format!("Voided invoice {} ({})", invoice.invoice_no, reason),
            invoice_id: invoice.id,
            voided_amount,
            credit,
        })
    }

    /// Edit a line item of a pending invoice and recompute the invoice
    /// total. Records a `proration`-type adjustment when the total moved.
    pub async fn update_line_item(&self, params: UpdateLineItemParams) -> LedgerResult<LineItemOutcome> {
        let mut tx = self.pool.begin().await?;

        // Resolve the owning invoice first so the invoice row is always
        // locked before the item row (consistent lock order).
        let owner: Option<(Uuid,)> =
            sqlx::query_as("SELECT invoice_id FROM invoice_items WHERE id = $1")
                .bind(params.item_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (invoice_id,) = owner
            .ok_or_else(|| LedgerError::NotFound(format!("invoice item {}", params.item_id)))?;

        let invoice = Self::lock_invoice(&mut tx, invoice_id).await?;
        ensure_items_editable(&invoice.status)?;

        let item: InvoiceItem = sqlx::query_as(
            r#"
            SELECT id, invoice_id, description, quantity, unit_price, amount,
                   original_amount, is_adjusted, created_at
            FROM invoice_items
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(params.item_id)
        .fetch_one(&mut *tx)
        .await?;

        let quantity = params.new_quantity.unwrap_or(item.quantity);
        if quantity < 1 {
            return Err(LedgerError::InvalidAdjustment(format!(
                "line item quantity must be at least 1, got {}",
                quantity
            )));
        }
        let unit_price = params.new_unit_price.unwrap_or(item.unit_price);
        if unit_price < Decimal::ZERO {
            return Err(LedgerError::InvalidAdjustment(format!(
                "line item unit price cannot be negative, got {}",
                unit_price
            )));
        }

        let new_item_amount = round_money(Decimal::from(quantity) * unit_price);

        sqlx::query(
            r#"
            UPDATE invoice_items
            SET quantity = $2,
                unit_price = $3,
                description = COALESCE($4, description),
                amount = $5,
                original_amount = COALESCE(original_amount, $6),
                is_adjusted = TRUE
            WHERE id = $1
            "#,
        )
        .bind(item.id)
        .bind(quantity)
        .bind(unit_price)
        .bind(&params.new_description)
        .bind(new_item_amount)
        .bind(item.amount)
        .execute(&mut *tx)
        .await?;

        // Invoice total reconciles with the sum of its items; the
        // invoice-level clamp to >= 0 is the final safety net.
        let (items_total,): (Decimal,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0) FROM invoice_items WHERE invoice_id = $1",
        )
        .bind(invoice.id)
        .fetch_one(&mut *tx)
        .await?;

        let old_total = invoice.amount;
        let new_total = round_money(items_total.max(Decimal::ZERO));

        let adjustment_id = if new_total != old_total {
            sqlx::query(
                r#"
                UPDATE invoices
                SET amount = $2,
                    adjusted_amount = $2,
                    original_amount = COALESCE(original_amount, $3)
                WHERE id = $1
                "#,
            )
            .bind(invoice.id)
            .bind(new_total)
            .bind(old_total)
            .execute(&mut *tx)
            .await?;

            let id = Self::insert_adjustment(
                &mut tx,
                invoice.id,
                AdjustmentType::Proration,
                (new_total - old_total).abs(),
                old_total,
                new_total,
                &format!("line item '{}' edited", item.description),
                None,
                params.created_by,
            )
            .await?;

            HistoryService::log_in_tx(
                &mut tx,
                BillingHistoryBuilder::new(
                    invoice.subscription_id,
                    BillingEventType::InvoiceAdjusted,
                    params.created_by,
                )
                .invoice(invoice.id)
                .amount_change(old_total, new_total)
                .metadata(serde_json::json!({
                    "item_id": item.id,
                    "quantity": quantity,
                    "unit_price": unit_price,
                })),
            )
            .await?;

            Some(id)
        } else {
            None
        };

        tx.commit().await?;

        Ok(LineItemOutcome {
            success: true,
            message: format!(
                "Updated line item; invoice amount {} -> {}",
                old_total, new_total
            ),
            item_id: item.id,
            item_amount: new_item_amount,
            invoice_amount: new_total,
            adjustment_id,
        })
    }

    /// Record a payment against an invoice. Marks the invoice paid once
    /// recorded payments cover the full amount.
    pub async fn record_payment(
        &self,
        invoice_id: Uuid,
        amount: Decimal,
        method: Option<String>,
        created_by: Uuid,
    ) -> LedgerResult<PaymentOutcome> {
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAdjustment(format!(
                "payment amount must be positive, got {}",
                amount
            )));
        }

        let mut tx = self.pool.begin().await?;
        let invoice = Self::lock_invoice(&mut tx, invoice_id).await?;

        if invoice.status == "voided" {
            return Err(LedgerError::InvalidState(
                "cannot record a payment against a voided invoice".to_string(),
            ));
        }

        let payment: Payment = sqlx::query_as(
            r#"
            INSERT INTO payments (invoice_id, tenant_id, payment_no, amount, refunded_amount, status, method, paid_at, created_by)
            VALUES ($1, $2, $3, $4, 0, 'paid', $5, NOW(), $6)
            RETURNING
                id, invoice_id, tenant_id, payment_no, amount, refunded_amount,
                status, method, paid_at, created_by, created_at
            "#,
        )
        .bind(invoice.id)
        .bind(invoice.tenant_id)
        .bind(generate_reference("PAY"))
        .bind(round_money(amount))
        .bind(&method)
        .bind(created_by)
        .fetch_one(&mut *tx)
        .await?;

        let (paid_total,): (Decimal,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount - refunded_amount), 0) FROM payments WHERE invoice_id = $1",
        )
        .bind(invoice.id)
        .fetch_one(&mut *tx)
        .await?;

        let invoice_status = if paid_total >= invoice.amount {
            "paid"
        } else {
            invoice.status.as_str()
        };
        sqlx::query("UPDATE invoices SET status = $2 WHERE id = $1")
            .bind(invoice.id)
            .bind(invoice_status)
            .execute(&mut *tx)
            .await?;

        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(
                invoice.subscription_id,
                BillingEventType::PaymentRecorded,
                created_by,
            )
            .invoice(invoice.id)
            .metadata(serde_json::json!({
                "payment_no": payment.payment_no,
                "amount": payment.amount,
                "invoice_status": invoice_status,
            })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            invoice_id = %invoice.id,
            payment_no = %payment.payment_no,
            amount = %payment.amount,
            invoice_status = %invoice_status,
            "Recorded payment"
        );

        Ok(PaymentOutcome {
            success: true,
            message: format!("Recorded payment of {} against {}", payment.amount, invoice.invoice_no),
            payment,
            invoice_status: invoice_status.to_string(),
        })
    }

    /// Fetch an invoice with a row lock inside the caller's transaction.
    pub(crate) async fn lock_invoice(
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
    ) -> LedgerResult<Invoice> {
        let invoice: Option<Invoice> = sqlx::query_as(
            r#"
            SELECT
                id, tenant_id, subscription_id, invoice_no, amount, original_amount,
                adjusted_amount, status, due_date, voided_at, voided_reason,
                created_by, created_at
            FROM invoices
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&mut **tx)
        .await?;

        invoice.ok_or_else(|| LedgerError::NotFound(format!("invoice {}", invoice_id)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_adjustment(
        tx: &mut Transaction<'_, Postgres>,
        invoice_id: Uuid,
        adjustment_type: AdjustmentType,
        amount_abs: Decimal,
        original_amount: Decimal,
        new_amount: Decimal,
        reason: &str,
        reference: Option<&str>,
        created_by: Uuid,
    ) -> LedgerResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO invoice_adjustments (
                invoice_id, adjustment_type, amount, original_amount, new_amount,
                reason, adjustment_reference, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(invoice_id)
        .bind(adjustment_type.to_string())
        .bind(amount_abs.abs())
        .bind(original_amount)
        .bind(new_amount)
        .bind(reason)
        .bind(reference)
        .bind(created_by)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(ty: &str, amount: Decimal, original: Decimal, new: Decimal) -> InvoiceAdjustment {
        InvoiceAdjustment {
            id: Uuid::new_v4(),
            invoice_id: Uuid::new_v4(),
            adjustment_type: ty.to_string(),
            amount,
            original_amount: original,
            new_amount: new,
            reason: "test".to_string(),
            adjustment_reference: None,
            created_by: Uuid::new_v4(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_discount_subtracts_absolute_amount() {
        let new = amount_after_adjustment(dec!(1000.00), AdjustmentType::Discount, dec!(200.00)).unwrap();
        assert_eq!(new, dec!(800.00));

        // A negative input still subtracts its absolute value
        let new = amount_after_adjustment(dec!(1000.00), AdjustmentType::Discount, dec!(-200.00)).unwrap();
        assert_eq!(new, dec!(800.00));
    }

    #[test]
    fn test_surcharge_adds() {
        let new = amount_after_adjustment(dec!(1000.00), AdjustmentType::Surcharge, dec!(150.00)).unwrap();
        assert_eq!(new, dec!(1150.00));
    }

    #[test]
    fn test_proration_delta_is_signed() {
        let up = amount_after_adjustment(dec!(1000.00), AdjustmentType::Proration, dec!(50.00)).unwrap();
        assert_eq!(up, dec!(1050.00));

        let down = amount_after_adjustment(dec!(1000.00), AdjustmentType::Proration, dec!(-50.00)).unwrap();
        assert_eq!(down, dec!(950.00));
    }

    #[test]
    fn test_negative_result_is_rejected_not_clamped() {
        let err = amount_after_adjustment(dec!(100.00), AdjustmentType::Discount, dec!(250.00));
        assert!(matches!(err, Err(LedgerError::InvalidAdjustment(_))));
    }

    #[test]
    fn test_void_zeroes() {
        let new = amount_after_adjustment(dec!(875.50), AdjustmentType::Void, dec!(875.50)).unwrap();
        assert_eq!(new, Decimal::ZERO);
    }

    #[test]
    fn test_voided_invoice_rejects_adjustments() {
        assert!(ensure_adjustable("pending").is_ok());
        assert!(ensure_adjustable("paid").is_ok());
        assert!(matches!(
            ensure_adjustable("voided"),
            Err(LedgerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_paid_and_voided_invoices_lock_item_edits() {
        assert!(ensure_items_editable("pending").is_ok());
        assert!(matches!(
            ensure_items_editable("paid"),
            Err(LedgerError::InvalidState(_))
        ));
        assert!(matches!(
            ensure_items_editable("voided"),
            Err(LedgerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_replay_reproduces_current_amount() {
        // 1000 -discount 200-> 800 +surcharge 50-> 850 -credit 100-> 750
        let trail = vec![
            record("discount", dec!(200.00), dec!(1000.00), dec!(800.00)),
            record("surcharge", dec!(50.00), dec!(800.00), dec!(850.00)),
            record("credit", dec!(100.00), dec!(850.00), dec!(750.00)),
        ];
        assert_eq!(replay_adjustments(dec!(1000.00), &trail), dec!(750.00));
    }

    #[test]
    fn test_replay_handles_void_reset() {
        let trail = vec![
            record("discount", dec!(200.00), dec!(1000.00), dec!(800.00)),
            record("void", dec!(800.00), dec!(800.00), dec!(0.00)),
        ];
        assert_eq!(replay_adjustments(dec!(1000.00), &trail), Decimal::ZERO);
    }

    #[test]
    fn test_replay_of_empty_trail_is_identity() {
        assert_eq!(replay_adjustments(dec!(420.00), &[]), dec!(420.00));
    }

    #[test]
    fn test_reference_numbers_carry_prefix() {
        let inv = generate_reference("INV");
        assert!(inv.starts_with("INV-"));
        assert_eq!(inv.len(), "INV-".len() + 12);

        let memo = generate_reference("CM");
        assert!(memo.starts_with("CM-"));
    }

    #[test]
    fn test_credit_target_defaults_to_full_balance() {
        assert_eq!(
            credit_application_target(dec!(800.00), None).unwrap(),
            dec!(800.00)
        );
        assert_eq!(
            credit_application_target(dec!(800.00), Some(dec!(250.00))).unwrap(),
            dec!(250.00)
        );
    }

    #[test]
    fn test_credit_target_above_balance_is_rejected_not_clamped() {
        assert!(matches!(
            credit_application_target(dec!(800.00), Some(dec!(800.01))),
            Err(LedgerError::InvalidAdjustment(_))
        ));
    }

    #[test]
    fn test_credit_target_rejects_nonpositive_amounts() {
        assert!(matches!(
            credit_application_target(dec!(800.00), Some(Decimal::ZERO)),
            Err(LedgerError::InvalidAdjustment(_))
        ));
        assert!(matches!(
            credit_application_target(Decimal::ZERO, None),
            Err(LedgerError::InvalidAdjustment(_))
        ));
    }
}
