//! Subscription lifecycle
//!
//! Renewal, cycle change, cancellation, and the billing summary. Date
//! arithmetic clamps to month ends (Jan 31 + 1 month = Feb 28), so a
//! renewal anchor never drifts forward past the original day-of-month.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{BillingCycle, Plan};
use crate::credits::{CreditService, CreditType, IssueCreditParams, TenantCredit};
use crate::error::{LedgerError, LedgerResult};
use crate::history::{BillingEventType, BillingHistoryBuilder, HistoryService};
use crate::invoices::{Invoice, InvoiceService, NewInvoiceItem};
use crate::proration::{calculate_cycle_change, calculate_proration, round_money, CycleChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Created but not yet activated; not billable
    Pending,
    Trial,
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "trial" => Some(Self::Trial),
            "active" => Some(Self::Active),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan_id: Uuid,
    pub billing_cycle: String,
    /// Plan price per period at the current cycle
    pub amount: Decimal,
    pub status: String,
    pub start_date: Date,
    /// End of the current billing period; always after `start_date`
    pub end_date: Date,
    pub next_billing_date: Date,
    /// The original anchor; renewal dates derive their day-of-month
    /// from it rather than from a previously clamped date
    pub billing_anchor_date: Date,
    pub last_renewed_at: Option<OffsetDateTime>,
    pub renewed_count: i32,
    pub auto_renew: bool,
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Current billing period: the last renewal date (or the start
    /// date before any renewal) through the period end.
    pub fn current_period(&self) -> (Date, Date) {
        let start = self
            .last_renewed_at
            .map(|ts| ts.date())
            .unwrap_or(self.start_date);
        (start, self.end_date)
    }

    pub fn cycle(&self) -> LedgerResult<BillingCycle> {
        BillingCycle::from_str(&self.billing_cycle).ok_or_else(|| {
            LedgerError::InvalidState(format!(
                "subscription {} has unknown billing cycle '{}'",
                self.id, self.billing_cycle
            ))
        })
    }

    /// Billable means trial or active; pending, cancelled, and
    /// expired subscriptions reject billing mutations.
    pub fn ensure_billable(&self) -> LedgerResult<()> {
        match self.status.as_str() {
            "trial" | "active" => Ok(()),
            other => Err(LedgerError::InvalidState(format!(
                "subscription {} is {} and cannot be billed",
                self.id, other
            ))),
        }
    }
}

/// Advance a date by one billing cycle, clamping the day to the target
/// month's length.
pub fn add_cycle(date: Date, cycle: BillingCycle) -> Date {
    let mut year = date.year();
    let mut month = date.month() as u8 as i32;

    month += cycle.months();
    while month > 12 {
        month -= 12;
        year += 1;
    }

    // month is 1..=12 here so the conversion cannot fail
    let month = Month::try_from(month as u8).unwrap_or(date.month());
    let day = date.day().min(month.length(year));

    Date::from_calendar_date(year, month, day).unwrap_or(date)
}

/// Whether a cancellation should credit back the unused remainder of
/// the period. Only an active subscription whose current period was
/// actually paid gets one; a trial was never invoiced, and crediting
/// against a still-pending invoice would hand out money never
/// received.
fn unused_period_credit_due(status: &str, period_paid: bool) -> bool {
    status == "active" && period_paid
}

/// Outcome of a billing-cycle change.
#[derive(Debug, Clone, Serialize)]
pub struct CycleChangeOutcome {
    pub success: bool,
    pub message: String,
    pub subscription_id: Uuid,
    pub old_cycle: String,
    pub new_cycle: String,
    pub old_amount: Decimal,
    pub new_amount: Decimal,
    pub breakdown: CycleChange,
    /// Issued when the remainder-of-period delta is positive
    pub invoice: Option<Invoice>,
    /// Issued when the delta is negative
    pub credit: Option<TenantCredit>,
}

/// Outcome of a renewal.
#[derive(Debug, Clone, Serialize)]
pub struct RenewalOutcome {
    pub success: bool,
    pub message: String,
    pub subscription_id: Uuid,
    pub invoice: Invoice,
    pub period_start: Date,
    pub period_end: Date,
}

/// Outcome of a cancellation.
#[derive(Debug, Clone, Serialize)]
pub struct CancellationOutcome {
    pub success: bool,
    pub message: String,
    pub subscription_id: Uuid,
    pub unused_amount: Decimal,
    pub credit: Option<TenantCredit>,
    pub features_deactivated: u64,
}

/// Billing summary for a subscription.
#[derive(Debug, Clone, Serialize)]
pub struct BillingInfo {
    pub subscription: Subscription,
    pub plan_name: String,
    pub period_start: Date,
    pub period_end: Date,
    pub days_remaining: i64,
    /// Plan amount plus active add-ons, per period
    pub period_total: Decimal,
    pub active_feature_count: i64,
    pub available_credit: Decimal,
    /// Sum of this subscription's pending invoices
    pub pending_invoice_total: Decimal,
}

pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_subscription(&self, subscription_id: Uuid) -> LedgerResult<Subscription> {
        let subscription: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, plan_id, billing_cycle, amount, status,
                   start_date, end_date, next_billing_date, billing_anchor_date,
                   last_renewed_at, renewed_count, auto_renew, cancelled_at,
                   cancellation_reason, created_at, updated_at
            FROM subscriptions
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        subscription
            .ok_or_else(|| LedgerError::NotFound(format!("subscription {}", subscription_id)))
    }

    /// Change the billing cycle effective immediately.
    ///
    /// The remainder of the current period is settled by delta: unused
    /// old-cycle value is compared with the cost of the new cycle over
    /// the same days. A positive delta produces an invoice, a negative
    /// one a proration credit, zero settles silently.
    pub async fn update_billing_cycle(
        &self,
        subscription_id: Uuid,
        new_cycle: BillingCycle,
        effective: Date,
        created_by: Uuid,
    ) -> LedgerResult<CycleChangeOutcome> {
        let mut tx = self.pool.begin().await?;
        let subscription = Self::lock_subscription(&mut tx, subscription_id).await?;
        subscription.ensure_billable()?;

        let old_cycle = subscription.cycle()?;
        if old_cycle == new_cycle {
            return Err(LedgerError::InvalidState(format!(
                "subscription is already on the {} cycle",
                new_cycle
            )));
        }

        let plan = Self::plan_in_tx(&mut tx, subscription.plan_id).await?;
        let old_amount = subscription.amount;
        let new_amount = plan.price_for_cycle(new_cycle);

        let (_, period_end) = subscription.current_period();
        let breakdown = calculate_cycle_change(
            old_amount, old_cycle, new_amount, new_cycle, period_end, effective,
        );

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET billing_cycle = $2, amount = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(new_cycle.as_str())
        .bind(new_amount)
        .execute(&mut *tx)
        .await?;

        let mut invoice = None;
        let mut credit = None;

        if breakdown.delta > Decimal::ZERO {
            invoice = Some(
                InvoiceService::create_in_tx(
                    &mut tx,
                    subscription.tenant_id,
                    subscription.id,
                    &[NewInvoiceItem {
                        description: format!(
                            "Billing cycle change {} -> {} ({} days remaining)",
                            old_cycle, new_cycle, breakdown.remaining_days
                        ),
                        quantity: 1,
                        unit_price: breakdown.delta,
                    }],
                    period_end,
                    created_by,
                )
                .await?,
            );
        } else if breakdown.delta < Decimal::ZERO {
            credit = Some(
                CreditService::issue_in_tx(
                    &mut tx,
                    IssueCreditParams {
                        tenant_id: subscription.tenant_id,
                        amount: breakdown.delta.abs(),
                        credit_type: CreditType::Proration,
                        description: Some(format!(
                            "Billing cycle change {} -> {}",
                            old_cycle, new_cycle
                        )),
                        reference_type: Some("subscription".to_string()),
                        reference_id: Some(subscription.id),
                        expires_at: None,
                        created_by,
                    },
                )
                .await?,
            );
        }

        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(subscription.id, BillingEventType::CycleChanged, created_by)
                .cycle_change(old_cycle.as_str(), new_cycle.as_str())
                .amount_change(old_amount, new_amount)
                .metadata(serde_json::json!({
                    "delta": breakdown.delta,
                    "remaining_days": breakdown.remaining_days,
                    "invoice_id": invoice.as_ref().map(|i| i.id),
                    "credit_id": credit.as_ref().map(|c| c.id),
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            old_cycle = %old_cycle,
            new_cycle = %new_cycle,
            delta = %breakdown.delta,
            "Changed billing cycle"
        );

        Ok(CycleChangeOutcome {
            success: true,
            message: format!(
                "Changed billing cycle from {} to {}; period delta {}",
                old_cycle, new_cycle, breakdown.delta
            ),
            subscription_id: subscription.id,
            old_cycle: old_cycle.as_str().to_string(),
            new_cycle: new_cycle.as_str().to_string(),
            old_amount,
            new_amount,
            breakdown,
            invoice,
            credit,
        })
    }

    /// Renew a subscription for one more period. Generates the renewal
    /// invoice (plan plus active add-ons) and advances the anchor.
    pub async fn renew_subscription(
        &self,
        subscription_id: Uuid,
        created_by: Uuid,
    ) -> LedgerResult<RenewalOutcome> {
        let mut tx = self.pool.begin().await?;
        let subscription = Self::lock_subscription(&mut tx, subscription_id).await?;
        subscription.ensure_billable()?;

        if !subscription.auto_renew {
            return Err(LedgerError::InvalidState(format!(
                "auto-renew is off for subscription {}; it expires at period end",
                subscription.id
            )));
        }

        let cycle = subscription.cycle()?;
        let period_start = subscription.end_date;
        let period_end = add_cycle(period_start, cycle);

        let plan = Self::plan_in_tx(&mut tx, subscription.plan_id).await?;

        let mut items = vec![NewInvoiceItem {
            description: format!("{} plan ({} renewal)", plan.name, cycle),
            quantity: 1,
            unit_price: subscription.amount,
        }];

        let features: Vec<(String, Decimal, i32)> = sqlx::query_as(
            r#"
            SELECT f.name, sf.price, sf.quantity
            FROM subscription_features sf
            JOIN features f ON f.id = sf.feature_id
            WHERE sf.subscription_id = $1 AND sf.is_active = TRUE
            ORDER BY sf.created_at ASC
            "#,
        )
        .bind(subscription.id)
        .fetch_all(&mut *tx)
        .await?;

        for (name, price, quantity) in &features {
            items.push(NewInvoiceItem {
                description: format!("{} add-on", name),
                quantity: *quantity,
                unit_price: *price,
            });
        }

        let invoice = InvoiceService::create_in_tx(
            &mut tx,
            subscription.tenant_id,
            subscription.id,
            &items,
            period_start,
            created_by,
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'active',
                last_renewed_at = NOW(),
                renewed_count = renewed_count + 1,
                end_date = $2,
                next_billing_date = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(period_end)
        .execute(&mut *tx)
        .await?;

        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(subscription.id, BillingEventType::Renewed, created_by)
                .invoice(invoice.id)
                .period(period_start, period_end)
                .metadata(serde_json::json!({
                    "invoice_no": invoice.invoice_no,
                    "addon_count": features.len(),
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            invoice_no = %invoice.invoice_no,
            amount = %invoice.amount,
            period_end = %period_end,
            "Renewed subscription"
        );

        Ok(RenewalOutcome {
            success: true,
            message: format!(
                "Renewed through {} (invoice {})",
                period_end, invoice.invoice_no
            ),
            subscription_id: subscription.id,
            invoice,
            period_start,
            period_end,
        })
    }

    /// Cancel a subscription immediately. Active add-ons are
    /// deactivated, and the unused remainder of the current period
    /// (plan plus add-ons, prorated by day) is issued as one credit.
    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        reason: &str,
        effective: Date,
        created_by: Uuid,
    ) -> LedgerResult<CancellationOutcome> {
        let mut tx = self.pool.begin().await?;
        let subscription = Self::lock_subscription(&mut tx, subscription_id).await?;

        if subscription.status == "cancelled" || subscription.status == "expired" {
            return Err(LedgerError::InvalidState(format!(
                "subscription {} is already {}",
                subscription.id, subscription.status
            )));
        }

        let (period_start, period_end) = subscription.current_period();

        // Money only comes back when the period was actually paid for.
        let (period_paid,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM invoices
                WHERE subscription_id = $1
                  AND status = 'paid'
                  AND due_date >= $2 AND due_date <= $3
            )
            "#,
        )
        .bind(subscription.id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&mut *tx)
        .await?;
        let credit_due = unused_period_credit_due(&subscription.status, period_paid);

        let mut unused = calculate_proration(subscription.amount, period_start, period_end, effective);

        let addon_prices: Vec<(Decimal, i32)> = sqlx::query_as(
            r#"
            SELECT price, quantity
            FROM subscription_features
            WHERE subscription_id = $1 AND is_active = TRUE
            "#,
        )
        .bind(subscription.id)
        .fetch_all(&mut *tx)
        .await?;
        for (price, quantity) in &addon_prices {
            let per_period = *price * Decimal::from(*quantity);
            unused += calculate_proration(per_period, period_start, period_end, effective);
        }
        let unused = round_money(unused);

        let deactivated = sqlx::query(
            r#"
            UPDATE subscription_features
            SET is_active = FALSE, removed_at = NOW()
            WHERE subscription_id = $1 AND is_active = TRUE
            "#,
        )
        .bind(subscription.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'cancelled', cancelled_at = NOW(),
                cancellation_reason = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        let credit = if credit_due && unused > Decimal::ZERO {
            Some(
                CreditService::issue_in_tx(
                    &mut tx,
                    IssueCreditParams {
                        tenant_id: subscription.tenant_id,
                        amount: unused,
                        credit_type: CreditType::Cancellation,
                        description: Some(format!("Unused period after cancellation: {}", reason)),
                        reference_type: Some("subscription".to_string()),
                        reference_id: Some(subscription.id),
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
            BillingHistoryBuilder::new(subscription.id, BillingEventType::Cancelled, created_by)
                .period(period_start, period_end)
                .metadata(serde_json::json!({
                    "reason": reason,
                    "unused_amount": unused,
                    "period_paid": period_paid,
                    "features_deactivated": deactivated,
                    "credit_id": credit.as_ref().map(|c| c.id),
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            unused_amount = %unused,
            features_deactivated = deactivated,
            "Cancelled subscription"
        );

        Ok(CancellationOutcome {
            success: true,
            message: match &credit {
                Some(c) => format!(
                    "Cancelled subscription; {} credited for the unused period",
                    c.remaining_amount
                ),
                None => "Cancelled subscription; no unused-period credit due".to_string(),
            },
            subscription_id: subscription.id,
            unused_amount: unused,
            credit,
            features_deactivated: deactivated,
        })
    }

    /// Turn off auto-renew; the subscription stays billable until the
    /// end of the current period, then expires instead of renewing.
    pub async fn cancel_renewal(&self, subscription_id: Uuid, created_by: Uuid) -> LedgerResult<()> {
        self.set_auto_renew(subscription_id, false, BillingEventType::RenewalCancelled, created_by)
            .await
    }

    /// Turn auto-renew back on before the period ends.
    pub async fn reactivate_renewal(&self, subscription_id: Uuid, created_by: Uuid) -> LedgerResult<()> {
        self.set_auto_renew(subscription_id, true, BillingEventType::Reactivated, created_by)
            .await
    }

    async fn set_auto_renew(
        &self,
        subscription_id: Uuid,
        auto_renew: bool,
        event: BillingEventType,
        created_by: Uuid,
    ) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        let subscription = Self::lock_subscription(&mut tx, subscription_id).await?;
        subscription.ensure_billable()?;

        if subscription.auto_renew == auto_renew {
            return Err(LedgerError::InvalidState(format!(
                "auto-renew for subscription {} is already {}",
                subscription.id,
                if auto_renew { "on" } else { "off" }
            )));
        }

        sqlx::query("UPDATE subscriptions SET auto_renew = $2, updated_at = NOW() WHERE id = $1")
            .bind(subscription.id)
            .bind(auto_renew)
            .execute(&mut *tx)
            .await?;

        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(subscription.id, event, created_by)
                .metadata(serde_json::json!({ "auto_renew": auto_renew })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            auto_renew,
            "Updated auto-renew flag"
        );

        Ok(())
    }

    /// Billing summary: current period, per-period total with add-ons,
    /// and the tenant's available credit.
    pub async fn billing_info(&self, subscription_id: Uuid, today: Date) -> LedgerResult<BillingInfo> {
        let subscription = self.get_subscription(subscription_id).await?;
        let (period_start, period_end) = subscription.current_period();

        let (plan_name,): (String,) = sqlx::query_as("SELECT name FROM plans WHERE id = $1")
            .bind(subscription.plan_id)
            .fetch_one(&self.pool)
            .await?;

        let (addon_total, active_feature_count): (Decimal, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(price * quantity), 0), COUNT(*)
            FROM subscription_features
            WHERE subscription_id = $1 AND is_active = TRUE
            "#,
        )
        .bind(subscription.id)
        .fetch_one(&self.pool)
        .await?;

        let (pending_invoice_total,): (Decimal,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM invoices
            WHERE subscription_id = $1 AND status = 'pending'
            "#,
        )
        .bind(subscription.id)
        .fetch_one(&self.pool)
        .await?;

        let (available_credit,): (Decimal,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(remaining_amount), 0)
            FROM tenant_credits
            WHERE tenant_id = $1 AND status = 'available'
            "#,
        )
        .bind(subscription.tenant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(BillingInfo {
            days_remaining: (period_end - today).whole_days().max(0),
            period_total: round_money(subscription.amount + addon_total),
            subscription,
            plan_name,
            period_start,
            period_end,
            active_feature_count,
            available_credit,
            pending_invoice_total,
        })
    }

    pub(crate) async fn lock_subscription(
        tx: &mut Transaction<'_, Postgres>,
        subscription_id: Uuid,
    ) -> LedgerResult<Subscription> {
        let subscription: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, plan_id, billing_cycle, amount, status,
                   start_date, end_date, next_billing_date, billing_anchor_date,
                   last_renewed_at, renewed_count, auto_renew, cancelled_at,
                   cancellation_reason, created_at, updated_at
            FROM subscriptions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&mut **tx)
        .await?;

        subscription
            .ok_or_else(|| LedgerError::NotFound(format!("subscription {}", subscription_id)))
    }

    pub(crate) async fn plan_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        plan_id: Uuid,
    ) -> LedgerResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT id, name, price_monthly, price_yearly, trial_days, is_active, created_at
            FROM plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&mut **tx)
        .await?;

        plan.ok_or_else(|| LedgerError::NotFound(format!("plan {}", plan_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn subscription(status: &str, cycle: &str) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            billing_cycle: cycle.to_string(),
            amount: Decimal::from(1000),
            status: status.to_string(),
            start_date: date!(2025 - 01 - 15),
            end_date: date!(2025 - 02 - 15),
            next_billing_date: date!(2025 - 02 - 15),
            billing_anchor_date: date!(2025 - 01 - 15),
            last_renewed_at: None,
            renewed_count: 0,
            auto_renew: true,
            cancelled_at: None,
            cancellation_reason: None,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_add_cycle_monthly_plain() {
        assert_eq!(add_cycle(date!(2025 - 03 - 15), BillingCycle::Monthly), date!(2025 - 04 - 15));
    }

    #[test]
    fn test_add_cycle_clamps_to_month_end() {
        assert_eq!(add_cycle(date!(2025 - 01 - 31), BillingCycle::Monthly), date!(2025 - 02 - 28));
        assert_eq!(add_cycle(date!(2024 - 01 - 31), BillingCycle::Monthly), date!(2024 - 02 - 29));
        assert_eq!(add_cycle(date!(2025 - 03 - 31), BillingCycle::Monthly), date!(2025 - 04 - 30));
    }

    #[test]
    fn test_add_cycle_december_rolls_year() {
        assert_eq!(add_cycle(date!(2025 - 12 - 10), BillingCycle::Monthly), date!(2026 - 01 - 10));
    }

    #[test]
    fn test_add_cycle_yearly_leap_day() {
        assert_eq!(add_cycle(date!(2024 - 02 - 29), BillingCycle::Yearly), date!(2025 - 02 - 28));
    }

    #[test]
    fn test_current_period_before_first_renewal() {
        let sub = subscription("active", "monthly");
        assert_eq!(sub.current_period(), (date!(2025 - 01 - 15), date!(2025 - 02 - 15)));
    }

    #[test]
    fn test_current_period_after_renewal() {
        let mut sub = subscription("active", "monthly");
        sub.last_renewed_at = Some(
            date!(2025 - 02 - 15)
                .midnight()
                .assume_utc(),
        );
        sub.end_date = date!(2025 - 03 - 15);
        sub.next_billing_date = date!(2025 - 03 - 15);
        assert_eq!(sub.current_period(), (date!(2025 - 02 - 15), date!(2025 - 03 - 15)));
    }

    #[test]
    fn test_billable_guard() {
        assert!(subscription("active", "monthly").ensure_billable().is_ok());
        assert!(subscription("trial", "monthly").ensure_billable().is_ok());
        for status in ["pending", "cancelled", "expired"] {
            assert!(matches!(
                subscription(status, "monthly").ensure_billable(),
                Err(LedgerError::InvalidState(_))
            ));
        }
    }

    #[test]
    fn test_status_roundtrip_includes_pending() {
        for status in [
            SubscriptionStatus::Pending,
            SubscriptionStatus::Trial,
            SubscriptionStatus::Active,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(SubscriptionStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(SubscriptionStatus::from_str("paused"), None);
    }

    #[test]
    fn test_cancellation_credit_requires_paid_active_period() {
        assert!(unused_period_credit_due("active", true));
        // A trial never paid anything, so there is nothing to return
        assert!(!unused_period_credit_due("trial", true));
        assert!(!unused_period_credit_due("trial", false));
        // An outstanding (unpaid) period must not be credited back
        assert!(!unused_period_credit_due("active", false));
    }

    #[test]
    fn test_unknown_cycle_is_invalid_state() {
        let sub = subscription("active", "fortnightly");
        assert!(matches!(sub.cycle(), Err(LedgerError::InvalidState(_))));
    }
}
