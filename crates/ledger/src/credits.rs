//! Tenant credit ledger
//!
//! Issuance, expiry, and ordered consumption of tenant credit records.
//! Credits are the main point of contention across concurrent invoices
//! and refunds, so every drain locks the affected rows (`FOR UPDATE`)
//! inside the caller's transaction before computing the new balances.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::proration::round_money;

/// What generated a credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditType {
    Manual,
    Refund,
    Proration,
    Promotion,
    Cancellation,
}

impl CreditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditType::Manual => "manual",
            CreditType::Refund => "refund",
            CreditType::Proration => "proration",
            CreditType::Promotion => "promotion",
            CreditType::Cancellation => "cancellation",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "refund" => Some(Self::Refund),
            "proration" => Some(Self::Proration),
            "promotion" => Some(Self::Promotion),
            "cancellation" => Some(Self::Cancellation),
            _ => None,
        }
    }
}

impl std::fmt::Display for CreditType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Credit lifecycle state. `Used` is reached only when the remaining
/// amount hits zero; a partially drained credit stays `Available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditStatus {
    Available,
    Used,
    Expired,
    Cancelled,
}

impl CreditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditStatus::Available => "available",
            CreditStatus::Used => "used",
            CreditStatus::Expired => "expired",
            CreditStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for CreditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Consumption ordering for the available-credit list.
///
/// Defaults to oldest-first; expiry-first prefers draining credits
/// closest to their expiry date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditOrder {
    #[default]
    OldestFirst,
    ExpiryFirst,
}

/// Tenant credit record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantCredit {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub credit_type: String,
    pub status: String,
    pub description: Option<String>,
    pub original_amount: Decimal,
    pub remaining_amount: Decimal,
    pub expires_at: Option<Date>,
    /// What generated this credit (e.g. "payment_refund", "subscription_feature")
    pub reference_type: Option<String>,
    pub reference_id: Option<Uuid>,
    pub used_at: Option<OffsetDateTime>,
    pub created_by: Uuid,
    pub created_at: OffsetDateTime,
}

/// Parameters for issuing a credit.
#[derive(Debug, Clone)]
pub struct IssueCreditParams {
    pub tenant_id: Uuid,
    pub amount: Decimal,
    pub credit_type: CreditType,
    pub description: Option<String>,
    pub reference_type: Option<String>,
    pub reference_id: Option<Uuid>,
    pub expires_at: Option<Date>,
    pub created_by: Uuid,
}

/// One credit drained during a consumption.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditDraw {
    pub credit_id: Uuid,
    pub amount_consumed: Decimal,
}

/// Outcome of a consumption. `total_applied` may be less than
/// `requested` when the tenant's credits are insufficient; the caller
/// decides whether partial application is acceptable.
#[derive(Debug, Clone, Serialize)]
pub struct CreditConsumption {
    pub requested: Decimal,
    pub total_applied: Decimal,
    pub draws: Vec<CreditDraw>,
}

/// Greedily plan draws against an ordered list of `(credit_id, remaining)`
/// balances until `needed` is satisfied or the list is exhausted.
///
/// Never plans more than a record's remaining amount, so applying the
/// plan can never push a balance negative.
pub fn plan_drain(available: &[(Uuid, Decimal)], needed: Decimal) -> CreditConsumption {
    let mut draws = Vec::new();
    let mut outstanding = needed;

    for (credit_id, remaining) in available {
        if outstanding <= Decimal::ZERO {
            break;
        }
        if *remaining <= Decimal::ZERO {
            continue;
        }
        let take = outstanding.min(*remaining);
        draws.push(CreditDraw {
            credit_id: *credit_id,
            amount_consumed: take,
        });
        outstanding -= take;
    }

    CreditConsumption {
        requested: needed,
        total_applied: needed - outstanding,
        draws,
    }
}

/// Service for tenant credit operations.
pub struct CreditService {
    pool: PgPool,
}

impl CreditService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Issue a new credit. The amount must be positive.
    pub async fn issue_credit(&self, params: IssueCreditParams) -> LedgerResult<TenantCredit> {
        let mut tx = self.pool.begin().await?;
        let credit = Self::issue_in_tx(&mut tx, params).await?;
        tx.commit().await?;
        Ok(credit)
    }

    /// Issue a credit inside the caller's transaction (used by invoice
    /// void, add-on removal, and credit-method refunds).
    pub async fn issue_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        params: IssueCreditParams,
    ) -> LedgerResult<TenantCredit> {
        if params.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAdjustment(format!(
                "credit amount must be positive, got {}",
                params.amount
            )));
        }

        let amount = round_money(params.amount);
        let credit: TenantCredit = sqlx::query_as(
            r#"
            INSERT INTO tenant_credits (
                tenant_id,
                credit_type,
                status,
                description,
                original_amount,
                remaining_amount,
                expires_at,
                reference_type,
                reference_id,
                created_by
            )
            VALUES ($1, $2, 'available', $3, $4, $4, $5, $6, $7, $8)
            RETURNING
                id, tenant_id, credit_type, status, description,
                original_amount, remaining_amount, expires_at,
                reference_type, reference_id, used_at, created_by, created_at
            "#,
        )
        .bind(params.tenant_id)
        .bind(params.credit_type.to_string())
        .bind(&params.description)
        .bind(amount)
        .bind(params.expires_at)
        .bind(&params.reference_type)
        .bind(params.reference_id)
        .bind(params.created_by)
        .fetch_one(&mut **tx)
        .await?;

        tracing::info!(
            tenant_id = %params.tenant_id,
            credit_id = %credit.id,
            credit_type = %params.credit_type,
            amount = %amount,
            "Issued tenant credit"
        );

        Ok(credit)
    }

    /// Available credits for a tenant in consumption order.
    pub async fn list_available_credits(
        &self,
        tenant_id: Uuid,
        order: CreditOrder,
    ) -> LedgerResult<Vec<TenantCredit>> {
        let sql = match order {
            CreditOrder::OldestFirst => {
                r#"
                SELECT
                    id, tenant_id, credit_type, status, description,
                    original_amount, remaining_amount, expires_at,
                    reference_type, reference_id, used_at, created_by, created_at
                FROM tenant_credits
                WHERE tenant_id = $1 AND status = 'available'
                ORDER BY created_at ASC
                "#
            }
            CreditOrder::ExpiryFirst => {
                r#"
                SELECT
                    id, tenant_id, credit_type, status, description,
                    original_amount, remaining_amount, expires_at,
                    reference_type, reference_id, used_at, created_by, created_at
                FROM tenant_credits
                WHERE tenant_id = $1 AND status = 'available'
                ORDER BY expires_at ASC NULLS LAST, created_at ASC
                "#
            }
        };

        let credits: Vec<TenantCredit> =
            sqlx::query_as(sql).bind(tenant_id).fetch_all(&self.pool).await?;

        Ok(credits)
    }

    /// Sum of remaining amounts across available credits.
    pub async fn available_balance(&self, tenant_id: Uuid) -> LedgerResult<Decimal> {
        let balance: (Decimal,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(remaining_amount), 0)
            FROM tenant_credits
            WHERE tenant_id = $1 AND status = 'available'
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(balance.0)
    }

    /// Consume up to `amount_needed` from the tenant's credit pool.
    ///
    /// With `credit_id` set, drains that single credit only (validated to
    /// belong to the tenant and be available). Otherwise walks the ordered
    /// available list greedily. Returns the per-credit draws and the total
    /// actually applied.
    pub async fn consume(
        &self,
        tenant_id: Uuid,
        amount_needed: Decimal,
        credit_id: Option<Uuid>,
        order: CreditOrder,
    ) -> LedgerResult<CreditConsumption> {
        let mut tx = self.pool.begin().await?;
        let consumption =
            Self::consume_in_tx(&mut tx, tenant_id, amount_needed, credit_id, order).await?;
        tx.commit().await?;
        Ok(consumption)
    }

    /// Consume inside the caller's transaction (used when the drain must
    /// commit atomically with an invoice adjustment).
    pub async fn consume_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        amount_needed: Decimal,
        credit_id: Option<Uuid>,
        order: CreditOrder,
    ) -> LedgerResult<CreditConsumption> {
        if amount_needed <= Decimal::ZERO {
            return Err(LedgerError::InvalidAdjustment(format!(
                "consumption amount must be positive, got {}",
                amount_needed
            )));
        }
        let needed = round_money(amount_needed);

        // Lock the rows we may drain before computing new balances.
        let available: Vec<(Uuid, Decimal)> = match credit_id {
            Some(id) => {
                let row: Option<(Uuid, Decimal)> = sqlx::query_as(
                    r#"
                    SELECT id, remaining_amount
                    FROM tenant_credits
                    WHERE id = $1 AND tenant_id = $2 AND status = 'available'
                    FOR UPDATE
                    "#,
                )
                .bind(id)
                .bind(tenant_id)
                .fetch_optional(&mut **tx)
                .await?;

                vec![row.ok_or_else(|| {
                    LedgerError::NotFound(format!("available credit {} for tenant {}", id, tenant_id))
                })?]
            }
            None => {
                let sql = match order {
                    CreditOrder::OldestFirst => {
                        r#"
                        SELECT id, remaining_amount
                        FROM tenant_credits
                        WHERE tenant_id = $1 AND status = 'available'
                        ORDER BY created_at ASC
                        FOR UPDATE
                        "#
                    }
                    CreditOrder::ExpiryFirst => {
                        r#"
                        SELECT id, remaining_amount
                        FROM tenant_credits
                        WHERE tenant_id = $1 AND status = 'available'
                        ORDER BY expires_at ASC NULLS LAST, created_at ASC
                        FOR UPDATE
                        "#
                    }
                };

                let rows: Vec<(Uuid, Decimal)> =
                    sqlx::query_as(sql).bind(tenant_id).fetch_all(&mut **tx).await?;

                if rows.is_empty() {
                    return Err(LedgerError::NoCreditAvailable(tenant_id));
                }
                rows
            }
        };

        let plan = plan_drain(&available, needed);

        for draw in &plan.draws {
            sqlx::query(
                r#"
                UPDATE tenant_credits
                SET remaining_amount = remaining_amount - $2,
                    status = CASE WHEN remaining_amount - $2 <= 0 THEN 'used' ELSE status END,
                    used_at = CASE WHEN remaining_amount - $2 <= 0 THEN NOW() ELSE used_at END
                WHERE id = $1
                "#,
            )
            .bind(draw.credit_id)
            .bind(draw.amount_consumed)
            .execute(&mut **tx)
            .await?;
        }

        tracing::info!(
            tenant_id = %tenant_id,
            requested = %plan.requested,
            applied = %plan.total_applied,
            credits_drained = plan.draws.len(),
            "Consumed tenant credit"
        );

        Ok(plan)
    }

    /// Expire available credits whose expiry date has passed.
    ///
    /// Run periodically by the back-office scheduler; returns the number
    /// of credits flipped to `expired`.
    pub async fn expire_credits(&self, today: Date) -> LedgerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tenant_credits
            SET status = 'expired'
            WHERE status = 'available'
              AND expires_at IS NOT NULL
              AND expires_at < $1
            "#,
        )
        .bind(today)
        .execute(&self.pool)
        .await?;

        let expired = result.rows_affected();
        if expired > 0 {
            tracing::info!(expired, "Expired tenant credits");
        }

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_plan_drain_spans_credits_oldest_first() {
        let older = Uuid::new_v4();
        let newer = Uuid::new_v4();
        let available = vec![(older, dec!(500.00)), (newer, dec!(300.00))];

        let plan = plan_drain(&available, dec!(700.00));

        assert_eq!(plan.total_applied, dec!(700.00));
        assert_eq!(plan.draws.len(), 2);
        assert_eq!(plan.draws[0].credit_id, older);
        assert_eq!(plan.draws[0].amount_consumed, dec!(500.00));
        assert_eq!(plan.draws[1].credit_id, newer);
        assert_eq!(plan.draws[1].amount_consumed, dec!(200.00));
    }

    #[test]
    fn test_plan_drain_partial_when_insufficient() {
        let only = Uuid::new_v4();
        let plan = plan_drain(&[(only, dec!(120.00))], dec!(400.00));

        assert_eq!(plan.requested, dec!(400.00));
        assert_eq!(plan.total_applied, dec!(120.00));
        assert_eq!(plan.draws.len(), 1);
        assert_eq!(plan.draws[0].amount_consumed, dec!(120.00));
    }

    #[test]
    fn test_plan_drain_conservation() {
        let available = vec![
            (Uuid::new_v4(), dec!(33.33)),
            (Uuid::new_v4(), dec!(66.67)),
            (Uuid::new_v4(), dec!(10.00)),
        ];
        let plan = plan_drain(&available, dec!(95.00));

        let drained: Decimal = plan.draws.iter().map(|d| d.amount_consumed).sum();
        assert_eq!(drained, plan.total_applied);
        assert_eq!(drained, dec!(95.00));
    }

    #[test]
    fn test_plan_drain_never_exceeds_a_record() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let available = vec![(a, dec!(50.00)), (b, dec!(50.00))];
        let plan = plan_drain(&available, dec!(80.00));

        for draw in &plan.draws {
            let remaining = available
                .iter()
                .find(|(id, _)| *id == draw.credit_id)
                .map(|(_, r)| *r)
                .unwrap();
            assert!(draw.amount_consumed <= remaining);
        }
    }

    #[test]
    fn test_plan_drain_skips_empty_records() {
        let empty = Uuid::new_v4();
        let full = Uuid::new_v4();
        let plan = plan_drain(&[(empty, Decimal::ZERO), (full, dec!(40.00))], dec!(10.00));

        assert_eq!(plan.draws.len(), 1);
        assert_eq!(plan.draws[0].credit_id, full);
    }

    #[test]
    fn test_credit_type_roundtrip() {
        for t in [
            CreditType::Manual,
            CreditType::Refund,
            CreditType::Proration,
            CreditType::Promotion,
            CreditType::Cancellation,
        ] {
            assert_eq!(CreditType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(CreditType::from_str("gift"), None);
    }

    #[test]
    fn test_credit_order_default_is_oldest_first() {
        assert_eq!(CreditOrder::default(), CreditOrder::OldestFirst);
    }
}
