//! Billing history
//!
//! Append-only event trail for subscriptions. Every mutating ledger
//! operation writes at least one entry with enough before/after state to
//! reconstruct the change without re-deriving it from current rows.
//! Entries are never updated or deleted.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::LedgerResult;

/// Maximum page size for history queries.
pub const HISTORY_PAGE_CAP: i64 = 50;

/// What happened to the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Subscription lifecycle
    Created,
    Renewed,
    Upgraded,
    Downgraded,
    CycleChanged,
    Cancelled,
    RenewalCancelled,
    Reactivated,
    Expired,

    // Add-on lifecycle
    FeatureAdded,
    FeatureUpdated,
    FeatureRemoved,

    // Invoice ledger
    InvoiceCreated,
    InvoiceAdjusted,
    InvoiceVoided,
    PaymentRecorded,

    // Refunds and credits
    RefundRequested,
    RefundProcessed,
    CreditIssued,
    CreditConsumed,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::Created => "CREATED",
            BillingEventType::Renewed => "RENEWED",
            BillingEventType::Upgraded => "UPGRADED",
            BillingEventType::Downgraded => "DOWNGRADED",
            BillingEventType::CycleChanged => "CYCLE_CHANGED",
            BillingEventType::Cancelled => "CANCELLED",
            BillingEventType::RenewalCancelled => "RENEWAL_CANCELLED",
            BillingEventType::Reactivated => "REACTIVATED",
            BillingEventType::Expired => "EXPIRED",
            BillingEventType::FeatureAdded => "FEATURE_ADDED",
            BillingEventType::FeatureUpdated => "FEATURE_UPDATED",
            BillingEventType::FeatureRemoved => "FEATURE_REMOVED",
            BillingEventType::InvoiceCreated => "INVOICE_CREATED",
            BillingEventType::InvoiceAdjusted => "INVOICE_ADJUSTED",
            BillingEventType::InvoiceVoided => "INVOICE_VOIDED",
            BillingEventType::PaymentRecorded => "PAYMENT_RECORDED",
            BillingEventType::RefundRequested => "REFUND_REQUESTED",
            BillingEventType::RefundProcessed => "REFUND_PROCESSED",
            BillingEventType::CreditIssued => "CREDIT_ISSUED",
            BillingEventType::CreditConsumed => "CREDIT_CONSUMED",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A billing history record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingHistory {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_id: Option<Uuid>,
    pub event_type: String,
    pub old_plan_id: Option<Uuid>,
    pub new_plan_id: Option<Uuid>,
    pub old_billing_cycle: Option<String>,
    pub new_billing_cycle: Option<String>,
    pub old_amount: Option<Decimal>,
    pub new_amount: Option<Decimal>,
    pub period_start: Option<Date>,
    pub period_end: Option<Date>,
    pub metadata: serde_json::Value,
    pub created_by: Uuid,
    pub created_at: OffsetDateTime,
}

/// Builder for history entries.
pub struct BillingHistoryBuilder {
    subscription_id: Uuid,
    event_type: BillingEventType,
    created_by: Uuid,
    invoice_id: Option<Uuid>,
    old_plan_id: Option<Uuid>,
    new_plan_id: Option<Uuid>,
    old_billing_cycle: Option<String>,
    new_billing_cycle: Option<String>,
    old_amount: Option<Decimal>,
    new_amount: Option<Decimal>,
    period_start: Option<Date>,
    period_end: Option<Date>,
    metadata: serde_json::Value,
}

impl BillingHistoryBuilder {
    pub fn new(subscription_id: Uuid, event_type: BillingEventType, created_by: Uuid) -> Self {
        Self {
            subscription_id,
            event_type,
            created_by,
            invoice_id: None,
            old_plan_id: None,
            new_plan_id: None,
            old_billing_cycle: None,
            new_billing_cycle: None,
            old_amount: None,
            new_amount: None,
            period_start: None,
            period_end: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn invoice(mut self, invoice_id: Uuid) -> Self {
        self.invoice_id = Some(invoice_id);
        self
    }

    pub fn plan_change(mut self, old: Uuid, new: Uuid) -> Self {
        self.old_plan_id = Some(old);
        self.new_plan_id = Some(new);
        self
    }

    pub fn cycle_change(mut self, old: impl Into<String>, new: impl Into<String>) -> Self {
        self.old_billing_cycle = Some(old.into());
        self.new_billing_cycle = Some(new.into());
        self
    }

    pub fn amount_change(mut self, old: Decimal, new: Decimal) -> Self {
        self.old_amount = Some(old);
        self.new_amount = Some(new);
        self
    }

    pub fn period(mut self, start: Date, end: Date) -> Self {
        self.period_start = Some(start);
        self.period_end = Some(end);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Service for writing and querying billing history.
pub struct HistoryService {
    pool: PgPool,
}

impl HistoryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one entry outside any caller transaction.
    pub async fn log(&self, builder: BillingHistoryBuilder) -> LedgerResult<Uuid> {
        let mut tx = self.pool.begin().await?;
        let id = Self::log_in_tx(&mut tx, builder).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Append one entry inside the caller's transaction.
    ///
    /// Compound operations (add-on + invoice + history) use this so the
    /// entry commits or rolls back with the rest of the group.
    pub async fn log_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        builder: BillingHistoryBuilder,
    ) -> LedgerResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_history (
                subscription_id,
                invoice_id,
                event_type,
                old_plan_id,
                new_plan_id,
                old_billing_cycle,
                new_billing_cycle,
                old_amount,
                new_amount,
                period_start,
                period_end,
                metadata,
                created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id
            "#,
        )
        .bind(builder.subscription_id)
        .bind(builder.invoice_id)
        .bind(builder.event_type.to_string())
        .bind(builder.old_plan_id)
        .bind(builder.new_plan_id)
        .bind(&builder.old_billing_cycle)
        .bind(&builder.new_billing_cycle)
        .bind(builder.old_amount)
        .bind(builder.new_amount)
        .bind(builder.period_start)
        .bind(builder.period_end)
        .bind(&builder.metadata)
        .bind(builder.created_by)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id.0)
    }

    /// History for a subscription, newest first, page size capped at 50.
    pub async fn history(
        &self,
        subscription_id: Uuid,
        page: i64,
        per_page: i64,
    ) -> LedgerResult<Vec<BillingHistory>> {
        let limit = per_page.clamp(1, HISTORY_PAGE_CAP);
        let offset = (page.max(1) - 1) * limit;

        let entries: Vec<BillingHistory> = sqlx::query_as(
            r#"
            SELECT
                id,
                subscription_id,
                invoice_id,
                event_type,
                old_plan_id,
                new_plan_id,
                old_billing_cycle,
                new_billing_cycle,
                old_amount,
                new_amount,
                period_start,
                period_end,
                metadata,
                created_by,
                created_at
            FROM billing_history
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(subscription_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::macros::date;

    #[test]
    fn test_event_type_display() {
        assert_eq!(BillingEventType::CycleChanged.to_string(), "CYCLE_CHANGED");
        assert_eq!(BillingEventType::FeatureRemoved.to_string(), "FEATURE_REMOVED");
        assert_eq!(BillingEventType::RefundRequested.to_string(), "REFUND_REQUESTED");
    }

    #[test]
    fn test_builder_collects_snapshots() {
        let sub = Uuid::new_v4();
        let admin = Uuid::new_v4();
        let invoice = Uuid::new_v4();

        let b = BillingHistoryBuilder::new(sub, BillingEventType::CycleChanged, admin)
            .invoice(invoice)
            .cycle_change("monthly", "yearly")
            .amount_change(dec!(1000.00), dec!(10000.00))
            .period(date!(2025 - 01 - 01), date!(2025 - 12 - 31))
            .metadata(serde_json::json!({"reason": "admin request"}));

        assert_eq!(b.subscription_id, sub);
        assert_eq!(b.invoice_id, Some(invoice));
        assert_eq!(b.old_billing_cycle.as_deref(), Some("monthly"));
        assert_eq!(b.new_amount, Some(dec!(10000.00)));
        assert_eq!(b.period_end, Some(date!(2025 - 12 - 31)));
    }
}
