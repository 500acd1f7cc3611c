//! Postgres-backed store
//!
//! Each entity is a JSONB document plus the scalar columns the engine filters
//! or locks on. Discount `usage_count` lives in its own column and overrides
//! the value embedded in the document.

use async_trait::async_trait;
use shopsub_shared::SubscriptionStatus;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{BillingStore, StoreTx};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    DiscountCode, DiscountUsage, OwnerAccount, Payment, PaymentFilter, Subscription, Tenant,
};

const OPEN_SUBSCRIPTION_INDEX: &str = "subscriptions_one_open_per_tenant";
const DISCOUNT_CODE_INDEX: &str = "discount_codes_code_key";
const OWNER_EMAIL_INDEX: &str = "owner_accounts_email_key";

fn constraint_of(e: &sqlx::Error) -> Option<String> {
    e.as_database_error()
        .filter(|db| db.is_unique_violation())
        .and_then(|db| db.constraint().map(str::to_string))
}

fn with_usage_count((Json(mut discount), usage_count): (Json<DiscountCode>, i64)) -> DiscountCode {
    discount.usage_count = usage_count;
    discount
}

fn stale(what: &str, id: Uuid, version: i64) -> BillingError {
    BillingError::ConcurrentModification(format!(
        "{} {} changed since version {} was read",
        what, id, version
    ))
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn find_tenant(&self, id: Uuid) -> BillingResult<Option<Tenant>> {
        let row: Option<Json<Tenant>> = sqlx::query_scalar("SELECT doc FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|Json(t)| t))
    }

    async fn find_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<Json<Subscription>> =
            sqlx::query_scalar("SELECT doc FROM subscriptions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|Json(s)| s))
    }

    async fn find_open_subscription(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<Json<Subscription>> = sqlx::query_scalar(
            "SELECT doc FROM subscriptions WHERE tenant_id = $1 AND status <> 'canceled'",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|Json(s)| s))
    }

    async fn list_subscriptions(
        &self,
        statuses: &[SubscriptionStatus],
    ) -> BillingResult<Vec<Subscription>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows: Vec<Json<Subscription>> = sqlx::query_scalar(
            "SELECT doc FROM subscriptions WHERE status = ANY($1) ORDER BY created_at",
        )
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(s)| s).collect())
    }

    async fn find_payment(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        let row: Option<Json<Payment>> = sqlx::query_scalar("SELECT doc FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|Json(p)| p))
    }

    async fn list_payments(&self, filter: &PaymentFilter) -> BillingResult<Vec<Payment>> {
        let rows: Vec<Json<Payment>> = sqlx::query_scalar(
            r#"
            SELECT doc FROM payments
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR channel = $2)
              AND ($3::UUID IS NULL OR subscription_id = $3)
              AND ($4::UUID IS NULL OR tenant_id = $4)
              AND ($5::TIMESTAMPTZ IS NULL OR created_at < $5)
            ORDER BY created_at
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.channel.map(|c| c.as_str()))
        .bind(filter.subscription_id)
        .bind(filter.tenant_id)
        .bind(filter.created_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(p)| p).collect())
    }

    async fn find_discount_by_code(&self, code: &str) -> BillingResult<Option<DiscountCode>> {
        let row: Option<(Json<DiscountCode>, i64)> =
            sqlx::query_as("SELECT doc, usage_count FROM discount_codes WHERE code = $1")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(with_usage_count))
    }

    async fn find_discount(&self, id: Uuid) -> BillingResult<Option<DiscountCode>> {
        let row: Option<(Json<DiscountCode>, i64)> =
            sqlx::query_as("SELECT doc, usage_count FROM discount_codes WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(with_usage_count))
    }

    async fn list_discounts(&self, include_inactive: bool) -> BillingResult<Vec<DiscountCode>> {
        let rows: Vec<(Json<DiscountCode>, i64)> = sqlx::query_as(
            "SELECT doc, usage_count FROM discount_codes WHERE is_active OR $1 ORDER BY code",
        )
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(with_usage_count).collect())
    }

    async fn count_discount_usage(&self, discount_id: Uuid, tenant_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM discount_usages WHERE discount_id = $1 AND tenant_id = $2",
        )
        .bind(discount_id)
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn insert_tenant(&mut self, tenant: &Tenant) -> BillingResult<()> {
        sqlx::query("INSERT INTO tenants (id, name, created_at, doc) VALUES ($1, $2, $3, $4)")
            .bind(tenant.id)
            .bind(&tenant.name)
            .bind(tenant.created_at)
            .bind(Json(tenant))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_owner(&mut self, owner: &OwnerAccount) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO owner_accounts (id, tenant_id, email, created_at, doc) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(owner.id)
        .bind(owner.tenant_id)
        .bind(owner.email.to_lowercase())
        .bind(owner.created_at)
        .bind(Json(owner))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match constraint_of(&e).as_deref() {
            Some(OWNER_EMAIL_INDEX) => BillingError::AccountExists(owner.email.clone()),
            _ => BillingError::from(e),
        })?;
        Ok(())
    }

    async fn insert_subscription(&mut self, subscription: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, tenant_id, status, end_date, version, created_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.tenant_id)
        .bind(subscription.status.as_str())
        .bind(subscription.dates.end_date)
        .bind(subscription.version)
        .bind(subscription.created_at)
        .bind(Json(subscription))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match constraint_of(&e).as_deref() {
            Some(OPEN_SUBSCRIPTION_INDEX) => {
                BillingError::SubscriptionExists(subscription.tenant_id)
            }
            _ => BillingError::from(e),
        })?;
        Ok(())
    }

    async fn find_subscription(&mut self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let row: Option<Json<Subscription>> =
            sqlx::query_scalar("SELECT doc FROM subscriptions WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(row.map(|Json(s)| s))
    }

    async fn find_open_subscription(
        &mut self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<Json<Subscription>> = sqlx::query_scalar(
            "SELECT doc FROM subscriptions WHERE tenant_id = $1 AND status <> 'canceled' FOR UPDATE",
        )
        .bind(tenant_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(|Json(s)| s))
    }

    async fn update_subscription(&mut self, subscription: &mut Subscription) -> BillingResult<()> {
        let expected = subscription.version;
        subscription.version += 1;
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1, end_date = $2, version = $3, updated_at = $4, doc = $5
            WHERE id = $6 AND version = $7
            "#,
        )
        .bind(subscription.status.as_str())
        .bind(subscription.dates.end_date)
        .bind(subscription.version)
        .bind(subscription.updated_at)
        .bind(Json(&*subscription))
        .bind(subscription.id)
        .bind(expected)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 1 => Ok(()),
            Ok(_) => {
                subscription.version = expected;
                Err(stale("Subscription", subscription.id, expected))
            }
            Err(e) => {
                subscription.version = expected;
                Err(e.into())
            }
        }
    }

    async fn insert_payment(&mut self, payment: &Payment) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments
                (id, tenant_id, subscription_id, context, channel, status, version, created_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(payment.id)
        .bind(payment.tenant_id)
        .bind(payment.subscription_id)
        .bind(payment.context.as_str())
        .bind(payment.channel.as_str())
        .bind(payment.status.as_str())
        .bind(payment.version)
        .bind(payment.created_at)
        .bind(Json(payment))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_payment(&mut self, id: Uuid) -> BillingResult<Option<Payment>> {
        let row: Option<Json<Payment>> =
            sqlx::query_scalar("SELECT doc FROM payments WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(row.map(|Json(p)| p))
    }

    async fn update_payment(&mut self, payment: &mut Payment) -> BillingResult<()> {
        let expected = payment.version;
        payment.version += 1;
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $1, version = $2, updated_at = $3, doc = $4
            WHERE id = $5 AND version = $6
            "#,
        )
        .bind(payment.status.as_str())
        .bind(payment.version)
        .bind(payment.updated_at)
        .bind(Json(&*payment))
        .bind(payment.id)
        .bind(expected)
        .execute(&mut *self.tx)
        .await;

        match result {
            Ok(r) if r.rows_affected() == 1 => Ok(()),
            Ok(_) => {
                payment.version = expected;
                Err(stale("Payment", payment.id, expected))
            }
            Err(e) => {
                payment.version = expected;
                Err(e.into())
            }
        }
    }

    async fn insert_discount(&mut self, discount: &DiscountCode) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO discount_codes
                (id, code, usage_count, usage_limit, is_active, version, created_at, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(discount.id)
        .bind(&discount.code)
        .bind(discount.usage_count)
        .bind(discount.usage_limit)
        .bind(discount.is_active)
        .bind(discount.version)
        .bind(discount.created_at)
        .bind(Json(discount))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match constraint_of(&e).as_deref() {
            Some(DISCOUNT_CODE_INDEX) => BillingError::DiscountCodeExists(discount.code.clone()),
            _ => BillingError::from(e),
        })?;
        Ok(())
    }

    async fn find_discount(&mut self, id: Uuid) -> BillingResult<Option<DiscountCode>> {
        let row: Option<(Json<DiscountCode>, i64)> =
            sqlx::query_as("SELECT doc, usage_count FROM discount_codes WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(row.map(with_usage_count))
    }

    async fn find_discount_by_code(&mut self, code: &str) -> BillingResult<Option<DiscountCode>> {
        // No row lock: the usage counter is guarded by its own conditional UPDATE
        let row: Option<(Json<DiscountCode>, i64)> =
            sqlx::query_as("SELECT doc, usage_count FROM discount_codes WHERE code = $1")
                .bind(code)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(row.map(with_usage_count))
    }

    async fn update_discount(&mut self, discount: &mut DiscountCode) -> BillingResult<()> {
        let expected = discount.version;
        discount.version += 1;
        let result: Result<Option<i64>, sqlx::Error> = sqlx::query_scalar(
            r#"
            UPDATE discount_codes
            SET code = $1, usage_limit = $2, is_active = $3, version = $4, doc = $5
            WHERE id = $6 AND version = $7
            RETURNING usage_count
            "#,
        )
        .bind(&discount.code)
        .bind(discount.usage_limit)
        .bind(discount.is_active)
        .bind(discount.version)
        .bind(Json(&*discount))
        .bind(discount.id)
        .bind(expected)
        .fetch_optional(&mut *self.tx)
        .await;

        match result {
            Ok(Some(usage_count)) => {
                discount.usage_count = usage_count;
                Ok(())
            }
            Ok(None) => {
                discount.version = expected;
                Err(stale("Discount", discount.id, expected))
            }
            Err(e) => {
                discount.version = expected;
                match constraint_of(&e).as_deref() {
                    Some(DISCOUNT_CODE_INDEX) => {
                        Err(BillingError::DiscountCodeExists(discount.code.clone()))
                    }
                    _ => Err(e.into()),
                }
            }
        }
    }

    async fn increment_discount_usage(&mut self, discount_id: Uuid) -> BillingResult<Option<i64>> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE discount_codes
            SET usage_count = usage_count + 1
            WHERE id = $1
              AND is_active
              AND (usage_limit IS NULL OR usage_count < usage_limit)
            RETURNING usage_count
            "#,
        )
        .bind(discount_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn record_discount_usage(&mut self, usage: &DiscountUsage) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO discount_usages (id, discount_id, tenant_id, payment_id, discount_amount, used_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(usage.id)
        .bind(usage.discount_id)
        .bind(usage.tenant_id)
        .bind(usage.payment_id)
        .bind(usage.discount_amount)
        .bind(usage.used_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn release_discount_usage(
        &mut self,
        discount_id: Uuid,
        payment_id: Uuid,
    ) -> BillingResult<bool> {
        let deleted =
            sqlx::query("DELETE FROM discount_usages WHERE discount_id = $1 AND payment_id = $2")
                .bind(discount_id)
                .bind(payment_id)
                .execute(&mut *self.tx)
                .await?
                .rows_affected();
        if deleted == 0 {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE discount_codes SET usage_count = usage_count - 1 WHERE id = $1 AND usage_count > 0",
        )
        .bind(discount_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(true)
    }

    async fn count_discount_usage(
        &mut self,
        discount_id: Uuid,
        tenant_id: Uuid,
    ) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM discount_usages WHERE discount_id = $1 AND tenant_id = $2",
        )
        .bind(discount_id)
        .bind(tenant_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
