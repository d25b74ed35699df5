//! Add-on lifecycle
//!
//! Attaching, repricing, and removing priced features on a
//! subscription. Attach charges the prorated remainder of the current
//! period; removal is a soft deactivation that credits the unused
//! remainder back. Price and quantity changes take effect at the next
//! renewal; the prorated delta is computed for the audit trail.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::Feature;
use crate::credits::{CreditService, CreditType, IssueCreditParams, TenantCredit};
use crate::error::{LedgerError, LedgerResult};
use crate::history::{BillingEventType, BillingHistoryBuilder, HistoryService};
use crate::invoices::{Invoice, InvoiceService, NewInvoiceItem};
use crate::proration::calculate_proration;

/// A feature attached to a subscription, with the price frozen at
/// attach time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionFeature {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub feature_id: Uuid,
    /// Unit price per billing period, frozen when attached
    pub price: Decimal,
    pub quantity: i32,
    pub is_active: bool,
    pub added_at: OffsetDateTime,
    pub removed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl SubscriptionFeature {
    /// Charge per billing period: unit price times quantity.
    pub fn period_amount(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }
}

/// Parameters for [`AddonService::add_feature`].
#[derive(Debug, Clone)]
pub struct AddFeatureParams {
    pub subscription_id: Uuid,
    pub feature_id: Uuid,
    /// Negotiated price; defaults to the catalog price
    pub price_override: Option<Decimal>,
    pub quantity: i32,
    pub effective: Date,
    /// Invoice the prorated remainder of the current period
    pub create_invoice: bool,
    pub created_by: Uuid,
}

/// Parameters for [`AddonService::update_feature`].
#[derive(Debug, Clone)]
pub struct UpdateFeatureParams {
    pub subscription_feature_id: Uuid,
    pub new_price: Option<Decimal>,
    pub new_quantity: Option<i32>,
    pub effective: Date,
    pub created_by: Uuid,
}

/// Outcome of attaching an add-on.
#[derive(Debug, Clone, Serialize)]
pub struct AddFeatureOutcome {
    pub success: bool,
    pub message: String,
    pub subscription_feature: SubscriptionFeature,
    /// Prorated charge for the remainder of the current period, when any
    pub invoice: Option<Invoice>,
    pub prorated_amount: Decimal,
}

/// Outcome of removing an add-on.
#[derive(Debug, Clone, Serialize)]
pub struct RemoveFeatureOutcome {
    pub success: bool,
    pub message: String,
    pub subscription_feature_id: Uuid,
    pub unused_amount: Decimal,
    pub credit: Option<TenantCredit>,
}

pub struct AddonService {
    pool: PgPool,
}

impl AddonService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Attach a feature to a subscription. One active row per feature;
    /// a duplicate attach is rejected, not upserted. The add-on row,
    /// the prorated invoice, and the history entry commit together.
    pub async fn add_feature(&self, params: AddFeatureParams) -> LedgerResult<AddFeatureOutcome> {
        if params.quantity < 1 {
            return Err(LedgerError::InvalidAdjustment(format!(
                "add-on quantity must be at least 1, got {}",
                params.quantity
            )));
        }
        if let Some(price) = params.price_override {
            if price < Decimal::ZERO {
                return Err(LedgerError::InvalidAdjustment(format!(
                    "add-on price cannot be negative, got {}",
                    price
                )));
            }
        }

        let mut tx = self.pool.begin().await?;
        let subscription =
            crate::subscriptions::SubscriptionService::lock_subscription(&mut tx, params.subscription_id)
                .await?;
        subscription.ensure_billable()?;

        let feature: Option<Feature> = sqlx::query_as(
            "SELECT id, name, price, is_active, created_at FROM features WHERE id = $1",
        )
        .bind(params.feature_id)
        .fetch_optional(&mut *tx)
        .await?;
        let feature = feature
            .ok_or_else(|| LedgerError::NotFound(format!("feature {}", params.feature_id)))?;

        if !feature.is_active {
            return Err(LedgerError::InvalidState(format!(
                "feature '{}' is no longer offered",
                feature.name
            )));
        }

        let (duplicates,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM subscription_features
            WHERE subscription_id = $1 AND feature_id = $2 AND is_active = TRUE
            "#,
        )
        .bind(subscription.id)
        .bind(feature.id)
        .fetch_one(&mut *tx)
        .await?;
        if duplicates > 0 {
            return Err(LedgerError::InvalidState(format!(
                "feature '{}' is already active on this subscription",
                feature.name
            )));
        }

        let price = params.price_override.unwrap_or(feature.price);

        let subscription_feature: SubscriptionFeature = sqlx::query_as(
            r#"
            INSERT INTO subscription_features (subscription_id, feature_id, price, quantity, is_active, added_at)
            VALUES ($1, $2, $3, $4, TRUE, NOW())
            RETURNING id, subscription_id, feature_id, price, quantity, is_active,
                      added_at, removed_at, created_at
            "#,
        )
        .bind(subscription.id)
        .bind(feature.id)
        .bind(price)
        .bind(params.quantity)
        .fetch_one(&mut *tx)
        .await?;

        let (period_start, period_end) = subscription.current_period();
        let prorated = calculate_proration(
            subscription_feature.period_amount(),
            period_start,
            period_end,
            params.effective,
        );

        let invoice = if params.create_invoice && prorated > Decimal::ZERO {
            Some(
                InvoiceService::create_in_tx(
                    &mut tx,
                    subscription.tenant_id,
                    subscription.id,
                    &[NewInvoiceItem {
                        description: format!(
                            "{} add-on x{} (prorated through {})",
                            feature.name, params.quantity, period_end
                        ),
                        quantity: 1,
                        unit_price: prorated,
                    }],
                    period_end,
                    params.created_by,
                )
                .await?,
            )
        } else {
            None
        };

        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(subscription.id, BillingEventType::FeatureAdded, params.created_by)
                .amount_change(Decimal::ZERO, subscription_feature.period_amount())
                .metadata(serde_json::json!({
                    "feature_id": feature.id,
                    "feature_name": feature.name,
                    "price": price,
                    "quantity": params.quantity,
                    "prorated_amount": prorated,
                    "invoice_id": invoice.as_ref().map(|i| i.id),
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            feature = %feature.name,
            price = %price,
            quantity = params.quantity,
            prorated = %prorated,
            "Added feature to subscription"
        );

        Ok(AddFeatureOutcome {
            success: true,
            message: format!(
                "Added '{}' x{} at {} per period ({} prorated for this period)",
                feature.name, params.quantity, price, prorated
            ),
            subscription_feature,
            invoice,
            prorated_amount: prorated,
        })
    }

    /// Reprice or requantify an active add-on. Effective at the next
    /// renewal; the current period is not re-billed, but the prorated
    /// delta is computed for the audit entry.
    pub async fn update_feature(&self, params: UpdateFeatureParams) -> LedgerResult<SubscriptionFeature> {
        let mut tx = self.pool.begin().await?;
        let existing = Self::resolve(&mut tx, params.subscription_feature_id).await?;
        let subscription =
            crate::subscriptions::SubscriptionService::lock_subscription(&mut tx, existing.subscription_id)
                .await?;
        subscription.ensure_billable()?;

        if !existing.is_active {
            return Err(LedgerError::InvalidState(
                "cannot reprice a removed add-on".to_string(),
            ));
        }

        let price = params.new_price.unwrap_or(existing.price);
        if price < Decimal::ZERO {
            return Err(LedgerError::InvalidAdjustment(format!(
                "add-on price cannot be negative, got {}",
                price
            )));
        }
        let quantity = params.new_quantity.unwrap_or(existing.quantity);
        if quantity < 1 {
            return Err(LedgerError::InvalidAdjustment(format!(
                "add-on quantity must be at least 1, got {}",
                quantity
            )));
        }

        let updated: SubscriptionFeature = sqlx::query_as(
            r#"
            UPDATE subscription_features
            SET price = $2, quantity = $3
            WHERE id = $1
            RETURNING id, subscription_id, feature_id, price, quantity, is_active,
                      added_at, removed_at, created_at
            "#,
        )
        .bind(existing.id)
        .bind(price)
        .bind(quantity)
        .fetch_one(&mut *tx)
        .await?;

        let (period_start, period_end) = subscription.current_period();
        let old_remainder = calculate_proration(
            existing.period_amount(),
            period_start,
            period_end,
            params.effective,
        );
        let new_remainder = calculate_proration(
            updated.period_amount(),
            period_start,
            period_end,
            params.effective,
        );

        HistoryService::log_in_tx(
            &mut tx,
            BillingHistoryBuilder::new(subscription.id, BillingEventType::FeatureUpdated, params.created_by)
                .amount_change(existing.period_amount(), updated.period_amount())
                .metadata(serde_json::json!({
                    "feature_id": existing.feature_id,
                    "old_price": existing.price,
                    "new_price": price,
                    "old_quantity": existing.quantity,
                    "new_quantity": quantity,
                    "prorated_delta": new_remainder - old_remainder,
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            feature_id = %existing.feature_id,
            old_price = %existing.price,
            new_price = %price,
            old_quantity = existing.quantity,
            new_quantity = quantity,
            "Updated add-on"
        );

        Ok(updated)
    }

    /// Remove an add-on: soft deactivation, optionally crediting the
    /// unused remainder of the current period. The row survives for
    /// audit.
    pub async fn remove_feature(
        &self,
        subscription_feature_id: Uuid,
        effective: Date,
        create_credit: bool,
        created_by: Uuid,
    ) -> LedgerResult<RemoveFeatureOutcome> {
        let mut tx = self.pool.begin().await?;
        let existing = Self::resolve(&mut tx, subscription_feature_id).await?;
        let subscription =
            crate::subscriptions::SubscriptionService::lock_subscription(&mut tx, existing.subscription_id)
                .await?;

        if !existing.is_active {
            return Err(LedgerError::InvalidState(
                "add-on has already been removed".to_string(),
            ));
        }

        sqlx::query(
            r#"
            UPDATE subscription_features
            SET is_active = FALSE, removed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(existing.id)
        .execute(&mut *tx)
        .await?;

        let (period_start, period_end) = subscription.current_period();
        let unused =
            calculate_proration(existing.period_amount(), period_start, period_end, effective);

        let credit = if create_credit && unused > Decimal::ZERO {
            Some(
                CreditService::issue_in_tx(
                    &mut tx,
                    IssueCreditParams {
                        tenant_id: subscription.tenant_id,
                        amount: unused,
                        credit_type: CreditType::Proration,
                        description: Some("Unused add-on period after removal".to_string()),
                        reference_type: Some("subscription_feature".to_string()),
                        reference_id: Some(existing.id),
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
            BillingHistoryBuilder::new(subscription.id, BillingEventType::FeatureRemoved, created_by)
                .amount_change(existing.period_amount(), Decimal::ZERO)
                .metadata(serde_json::json!({
                    "feature_id": existing.feature_id,
                    "unused_amount": unused,
                    "credit_id": credit.as_ref().map(|c| c.id),
                })),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            feature_id = %existing.feature_id,
            unused = %unused,
            credit_issued = credit.is_some(),
            "Removed add-on"
        );

        Ok(RemoveFeatureOutcome {
            success: true,
            message: if credit.is_some() {
                format!("Removed add-on; {} credited for the unused period", unused)
            } else {
                "Removed add-on".to_string()
            },
            subscription_feature_id: existing.id,
            unused_amount: unused,
            credit,
        })
    }

    /// Add-ons on a subscription, active first, then by attach time.
    pub async fn list_features(
        &self,
        subscription_id: Uuid,
        include_removed: bool,
    ) -> LedgerResult<Vec<SubscriptionFeature>> {
        let features: Vec<SubscriptionFeature> = if include_removed {
            sqlx::query_as(
                r#"
                SELECT id, subscription_id, feature_id, price, quantity, is_active,
                       added_at, removed_at, created_at
                FROM subscription_features
                WHERE subscription_id = $1
                ORDER BY is_active DESC, added_at ASC
                "#,
            )
            .bind(subscription_id)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                SELECT id, subscription_id, feature_id, price, quantity, is_active,
                       added_at, removed_at, created_at
                FROM subscription_features
                WHERE subscription_id = $1 AND is_active = TRUE
                ORDER BY added_at ASC
                "#,
            )
            .bind(subscription_id)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(features)
    }

    async fn resolve(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        subscription_feature_id: Uuid,
    ) -> LedgerResult<SubscriptionFeature> {
        let existing: Option<SubscriptionFeature> = sqlx::query_as(
            r#"
            SELECT id, subscription_id, feature_id, price, quantity, is_active,
                   added_at, removed_at, created_at
            FROM subscription_features
            WHERE id = $1
            "#,
        )
        .bind(subscription_feature_id)
        .fetch_optional(&mut **tx)
        .await?;

        existing.ok_or_else(|| {
            LedgerError::NotFound(format!("subscription feature {}", subscription_feature_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_period_amount_multiplies_by_quantity() {
        let feature = SubscriptionFeature {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            feature_id: Uuid::new_v4(),
            price: dec!(45.50),
            quantity: 3,
            is_active: true,
            added_at: OffsetDateTime::now_utc(),
            removed_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        assert_eq!(feature.period_amount(), dec!(136.50));
    }
}
