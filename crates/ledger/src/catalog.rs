//! Plan and feature catalog
//!
//! Read-only pricing reference data consumed by proration and the add-on
//! lifecycle. Catalog management (create/edit plans) lives in the admin
//! CRUD layer and is out of scope here.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

/// Billing recurrence unit for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(Self::Monthly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }

    /// Day base used for cycle-change daily rates (30 monthly, 365 yearly).
    pub fn day_base(&self) -> i64 {
        match self {
            BillingCycle::Monthly => 30,
            BillingCycle::Yearly => 365,
        }
    }

    /// Calendar months covered by one period of this cycle.
    pub fn months(&self) -> i32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Yearly => 12,
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription plan pricing record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    /// Monthly price, two-decimal currency
    pub price_monthly: Decimal,
    /// Explicit yearly price; when absent the canonical formula applies
    pub price_yearly: Option<Decimal>,
    pub trial_days: i32,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

impl Plan {
    /// Price for one period of the given cycle.
    ///
    /// Canonical yearly formula: the stored yearly price wins; otherwise
    /// ten months' worth (two months free).
    pub fn price_for_cycle(&self, cycle: BillingCycle) -> Decimal {
        match cycle {
            BillingCycle::Monthly => self.price_monthly,
            BillingCycle::Yearly => self
                .price_yearly
                .unwrap_or_else(|| self.price_monthly * Decimal::from(10)),
        }
    }
}

/// Optional priced capability attached to a subscription beyond its plan.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Feature {
    pub id: Uuid,
    pub name: String,
    /// Price per billing period, two-decimal currency
    pub price: Decimal,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

/// Read-only catalog lookups.
pub struct CatalogService {
    pool: PgPool,
}

impl CatalogService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> LedgerResult<Plan> {
        let plan: Option<Plan> = sqlx::query_as(
            r#"
            SELECT id, name, price_monthly, price_yearly, trial_days, is_active, created_at
            FROM plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| LedgerError::NotFound(format!("plan {}", plan_id)))
    }

    pub async fn get_feature(&self, feature_id: Uuid) -> LedgerResult<Feature> {
        let feature: Option<Feature> = sqlx::query_as(
            r#"
            SELECT id, name, price, is_active, created_at
            FROM features
            WHERE id = $1
            "#,
        )
        .bind(feature_id)
        .fetch_optional(&self.pool)
        .await?;

        feature.ok_or_else(|| LedgerError::NotFound(format!("feature {}", feature_id)))
    }
}

/// Minimal view of a tenant used for existence/status checks.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TenantRef {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
}

/// Tenant directory lookups (existence/status only).
pub struct TenantDirectory {
    pool: PgPool,
}

impl TenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_tenant(&self, tenant_id: Uuid) -> LedgerResult<TenantRef> {
        let tenant: Option<TenantRef> =
            sqlx::query_as("SELECT id, name, is_active FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;

        tenant.ok_or_else(|| LedgerError::NotFound(format!("tenant {}", tenant_id)))
    }

    /// Existence + active check used before issuing credits or invoices.
    pub async fn ensure_active(&self, tenant_id: Uuid) -> LedgerResult<TenantRef> {
        let tenant = self.get_tenant(tenant_id).await?;
        if !tenant.is_active {
            return Err(LedgerError::InvalidState(format!(
                "tenant {} is inactive",
                tenant_id
            )));
        }
        Ok(tenant)
    }
}
