//! Discount engine
//!
//! `validate` checks a code against a purchase without side effects. `apply`
//! re-validates inside a transaction and then takes one use through the
//! store's atomic increment, so concurrent applies can never push
//! `usage_count` past `usage_limit`. A payment that fails gives its use back.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use shopsub_shared::{DiscountApplicability, DiscountType, PaymentContext};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{AppliedDiscount, DiscountCode, DiscountUsage, Payment};
use crate::store::{BillingStore, StoreTx};

/// Result of validating or applying a code
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountDetails {
    pub discount_id: Uuid,
    pub code: String,
    #[serde(rename = "type")]
    pub discount_type: DiscountType,
    pub value: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
    pub usage_count: i64,
    pub usage_limit: Option<i64>,
}

impl DiscountDetails {
    /// Snapshot stored on the payment
    pub fn applied(&self) -> AppliedDiscount {
        AppliedDiscount {
            discount_id: self.discount_id,
            code: self.code.clone(),
            discount_type: self.discount_type,
            value: self.value,
            discount_amount: self.discount_amount,
        }
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Raw discount before the cap
fn raw_discount(discount: &DiscountCode, amount: i64) -> i64 {
    match discount.discount_type {
        DiscountType::Fixed => discount.value,
        DiscountType::Percentage => amount.saturating_mul(discount.value) / 100,
    }
}

/// Check `discount` against a purchase. `tenant_uses` is how often this
/// tenant already used the code.
pub fn evaluate(
    discount: &DiscountCode,
    amount: i64,
    context: PaymentContext,
    tenant_id: Uuid,
    tenant_uses: i64,
    now: OffsetDateTime,
) -> BillingResult<DiscountDetails> {
    if amount < 0 {
        return Err(BillingError::InvalidInput(
            "amount must not be negative".to_string(),
        ));
    }
    if !discount.is_active {
        return Err(BillingError::InvalidDiscount(discount.code.clone()));
    }

    if now < discount.start_date || now > discount.expiry_date {
        return Err(BillingError::InvalidDiscount(format!(
            "{} is outside its validity window",
            discount.code
        )));
    }

    let wanted = DiscountApplicability::from(context);
    if context == PaymentContext::Debt {
        if !discount.applicable_for.contains(&DiscountApplicability::Debt) {
            tracing::warn!(
                code = %discount.code,
                tenant_id = %tenant_id,
                "Discount attempted on a debt payment without debt whitelisting"
            );
            return Err(BillingError::InvalidContextDebt(discount.code.clone()));
        }
    } else if !discount.applicable_for.contains(&wanted)
        && !discount.applicable_for.contains(&DiscountApplicability::All)
    {
        return Err(BillingError::InvalidContext {
            code: discount.code.clone(),
            context: wanted,
        });
    }

    if discount.shop_id.is_some_and(|shop| shop != tenant_id) {
        return Err(BillingError::InvalidShop(discount.code.clone()));
    }

    if discount.per_user_limit > 0 && tenant_uses >= discount.per_user_limit {
        return Err(BillingError::DiscountExhausted(discount.code.clone()));
    }
    if discount
        .usage_limit
        .is_some_and(|limit| discount.usage_count >= limit)
    {
        return Err(BillingError::DiscountExhausted(discount.code.clone()));
    }

    if amount < discount.minimum_purchase {
        return Err(BillingError::MinimumPurchaseNotMet {
            minimum: discount.minimum_purchase,
        });
    }

    let raw = raw_discount(discount, amount);
    let discount_amount = match discount.max_discount_amount {
        Some(cap) => raw.min(cap),
        None => raw,
    };
    if discount_amount <= 0 && amount > 0 {
        return Err(BillingError::MinimumPurchaseNotMet {
            minimum: discount.minimum_purchase,
        });
    }

    Ok(DiscountDetails {
        discount_id: discount.id,
        code: discount.code.clone(),
        discount_type: discount.discount_type,
        value: discount.value,
        discount_amount,
        final_amount: (amount - discount_amount).max(0),
        usage_count: discount.usage_count,
        usage_limit: discount.usage_limit,
    })
}

/// Validate inside an open transaction
pub async fn validate_in(
    tx: &mut dyn StoreTx,
    code: &str,
    amount: i64,
    context: PaymentContext,
    tenant_id: Uuid,
    now: OffsetDateTime,
) -> BillingResult<DiscountDetails> {
    let discount = active_by_code(tx, code).await?;
    let uses = tx.count_discount_usage(discount.id, tenant_id).await?;
    evaluate(&discount, amount, context, tenant_id, uses, now)
}

async fn active_by_code(tx: &mut dyn StoreTx, code: &str) -> BillingResult<DiscountCode> {
    let code = normalize_code(code);
    tx.find_discount_by_code(&code)
        .await?
        .filter(|d| d.is_active)
        .ok_or(BillingError::InvalidDiscount(code))
}

/// Validate, then take one use of the code. The caller commits.
pub async fn apply_in(
    tx: &mut dyn StoreTx,
    code: &str,
    amount: i64,
    context: PaymentContext,
    tenant_id: Uuid,
    payment_id: Option<Uuid>,
    now: OffsetDateTime,
) -> BillingResult<DiscountDetails> {
    let found = active_by_code(tx, code).await?;
    // Row lock held until commit, so one tenant's count-then-insert cannot interleave
    let discount = tx
        .find_discount(found.id)
        .await?
        .filter(|d| d.is_active)
        .ok_or(BillingError::InvalidDiscount(found.code))?;
    let uses = tx.count_discount_usage(discount.id, tenant_id).await?;
    let mut details = evaluate(&discount, amount, context, tenant_id, uses, now)?;

    let usage_count = tx
        .increment_discount_usage(details.discount_id)
        .await?
        .ok_or_else(|| BillingError::DiscountExhausted(details.code.clone()))?;
    details.usage_count = usage_count;

    tx.record_discount_usage(&DiscountUsage {
        id: Uuid::new_v4(),
        discount_id: details.discount_id,
        tenant_id,
        payment_id,
        discount_amount: details.discount_amount,
        used_at: now,
    })
    .await?;

    tracing::info!(
        code = %details.code,
        tenant_id = %tenant_id,
        usage_count = usage_count,
        discount_amount = details.discount_amount,
        "Discount applied"
    );

    Ok(details)
}

/// Give back the use `payment` took, if it took one. Runs when the payment fails.
pub async fn release_in(tx: &mut dyn StoreTx, payment: &Payment) -> BillingResult<()> {
    let Some(applied) = &payment.discount else {
        return Ok(());
    };
    if tx
        .release_discount_usage(applied.discount_id, payment.id)
        .await?
    {
        tracing::info!(
            code = %applied.code,
            payment_id = %payment.id,
            "Discount use released"
        );
    }
    Ok(())
}

/// Take the use back for a payment that settled after it had failed. The
/// money was collected at the discounted price, so limits do not apply.
pub async fn reclaim_in(
    tx: &mut dyn StoreTx,
    payment: &Payment,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let Some(applied) = &payment.discount else {
        return Ok(());
    };
    if tx.increment_discount_usage(applied.discount_id).await?.is_none() {
        tracing::warn!(
            code = %applied.code,
            payment_id = %payment.id,
            "Late-settled payment pushes discount past its usage limit"
        );
    }
    tx.record_discount_usage(&DiscountUsage {
        id: Uuid::new_v4(),
        discount_id: applied.discount_id,
        tenant_id: payment.tenant_id,
        payment_id: Some(payment.id),
        discount_amount: applied.discount_amount,
        used_at: now,
    })
    .await
}

/// Fields for a new discount code
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDiscountCode {
    pub code: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub discount_type: DiscountType,
    pub value: i64,
    #[serde(default)]
    pub minimum_purchase: i64,
    pub max_discount_amount: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expiry_date: OffsetDateTime,
    pub usage_limit: Option<i64>,
    #[serde(default = "default_per_user_limit")]
    pub per_user_limit: i64,
    pub applicable_for: Vec<DiscountApplicability>,
    pub shop_id: Option<Uuid>,
}

fn default_per_user_limit() -> i64 {
    1
}

/// Admin edit. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountUpdate {
    pub description: Option<String>,
    pub value: Option<i64>,
    pub minimum_purchase: Option<i64>,
    /// `null` removes the cap
    #[serde(default, deserialize_with = "present")]
    pub max_discount_amount: Option<Option<i64>>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub expiry_date: Option<OffsetDateTime>,
    /// `null` removes the limit
    #[serde(default, deserialize_with = "present")]
    pub usage_limit: Option<Option<i64>>,
    pub per_user_limit: Option<i64>,
    pub applicable_for: Option<Vec<DiscountApplicability>>,
    pub is_active: Option<bool>,
}

/// Distinguishes an explicit `null` from an absent field
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn check_definition(discount: &DiscountCode) -> BillingResult<()> {
    let invalid = |msg: &str| Err(BillingError::InvalidInput(msg.to_string()));

    if discount.code.is_empty()
        || !discount
            .code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return invalid("code must be non-empty and alphanumeric");
    }
    if discount.value <= 0 {
        return invalid("value must be positive");
    }
    if discount.discount_type == DiscountType::Percentage && discount.value > 100 {
        return invalid("percentage value must be at most 100");
    }
    if discount.minimum_purchase < 0 || discount.max_discount_amount.is_some_and(|m| m <= 0) {
        return invalid("minimum purchase and cap must not be negative");
    }
    if discount.expiry_date <= discount.start_date {
        return invalid("expiry date must be after start date");
    }
    if discount.applicable_for.is_empty() {
        return invalid("applicableFor must name at least one context");
    }
    if discount.per_user_limit < 0 {
        return invalid("perUserLimit must not be negative");
    }
    if let Some(limit) = discount.usage_limit {
        if limit < 1 {
            return invalid("usageLimit must be at least 1");
        }
        if limit < discount.usage_count {
            return invalid("usageLimit is below the current usage count");
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct DiscountEngine {
    store: Arc<dyn BillingStore>,
}

impl DiscountEngine {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn validate(
        &self,
        code: &str,
        amount: i64,
        context: PaymentContext,
        tenant_id: Uuid,
    ) -> BillingResult<DiscountDetails> {
        let code = normalize_code(code);
        let discount = self
            .store
            .find_discount_by_code(&code)
            .await?
            .filter(|d| d.is_active)
            .ok_or_else(|| BillingError::InvalidDiscount(code.clone()))?;
        let uses = self
            .store
            .count_discount_usage(discount.id, tenant_id)
            .await?;
        evaluate(
            &discount,
            amount,
            context,
            tenant_id,
            uses,
            OffsetDateTime::now_utc(),
        )
    }

    /// Apply outside any payment flow (e.g. a POS sale)
    pub async fn apply(
        &self,
        code: &str,
        amount: i64,
        context: PaymentContext,
        tenant_id: Uuid,
    ) -> BillingResult<DiscountDetails> {
        let mut tx = self.store.begin().await?;
        let details = apply_in(
            tx.as_mut(),
            code,
            amount,
            context,
            tenant_id,
            None,
            OffsetDateTime::now_utc(),
        )
        .await?;
        tx.commit().await?;
        Ok(details)
    }

    pub async fn create(
        &self,
        new: NewDiscountCode,
        created_by: Option<Uuid>,
    ) -> BillingResult<DiscountCode> {
        let now = OffsetDateTime::now_utc();
        let discount = DiscountCode {
            id: Uuid::new_v4(),
            code: normalize_code(&new.code),
            description: new.description,
            discount_type: new.discount_type,
            value: new.value,
            minimum_purchase: new.minimum_purchase,
            max_discount_amount: new.max_discount_amount,
            start_date: new.start_date,
            expiry_date: new.expiry_date,
            usage_limit: new.usage_limit,
            per_user_limit: new.per_user_limit,
            usage_count: 0,
            applicable_for: new.applicable_for,
            shop_id: new.shop_id,
            is_active: true,
            created_by,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        check_definition(&discount)?;

        let mut tx = self.store.begin().await?;
        tx.insert_discount(&discount).await?;
        tx.commit().await?;

        tracing::info!(
            discount_id = %discount.id,
            code = %discount.code,
            "Discount code created"
        );
        Ok(discount)
    }

    pub async fn update(&self, id: Uuid, update: DiscountUpdate) -> BillingResult<DiscountCode> {
        let mut tx = self.store.begin().await?;
        let mut discount = tx
            .find_discount(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Discount {}", id)))?;

        if let Some(description) = update.description {
            discount.description = Some(description);
        }
        if let Some(value) = update.value {
            discount.value = value;
        }
        if let Some(minimum) = update.minimum_purchase {
            discount.minimum_purchase = minimum;
        }
        if let Some(cap) = update.max_discount_amount {
            discount.max_discount_amount = cap;
        }
        if let Some(expiry) = update.expiry_date {
            discount.expiry_date = expiry;
        }
        if let Some(limit) = update.usage_limit {
            discount.usage_limit = limit;
        }
        if let Some(per_user) = update.per_user_limit {
            discount.per_user_limit = per_user;
        }
        if let Some(applicable_for) = update.applicable_for {
            discount.applicable_for = applicable_for;
        }
        if let Some(active) = update.is_active {
            discount.is_active = active;
        }
        discount.updated_at = OffsetDateTime::now_utc();
        check_definition(&discount)?;

        tx.update_discount(&mut discount).await?;
        tx.commit().await?;

        tracing::info!(discount_id = %id, code = %discount.code, "Discount code updated");
        Ok(discount)
    }

    /// Soft delete. The record and its usage history stay queryable.
    pub async fn deactivate(&self, id: Uuid) -> BillingResult<DiscountCode> {
        self.update(
            id,
            DiscountUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn list(&self, include_inactive: bool) -> BillingResult<Vec<DiscountCode>> {
        self.store.list_discounts(include_inactive).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{sample_discount, seed_discount};
    use time::Duration;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn test_fixed_discount() {
        let discount = sample_discount("FIXED10", DiscountType::Fixed, 10);
        let details = evaluate(
            &discount,
            100,
            PaymentContext::Subscription,
            Uuid::new_v4(),
            0,
            now(),
        )
        .unwrap();
        assert_eq!(details.discount_amount, 10);
        assert_eq!(details.final_amount, 90);
    }

    #[test]
    fn test_percentage_discount_is_capped() {
        let mut discount = sample_discount("HALF", DiscountType::Percentage, 50);
        discount.max_discount_amount = Some(3_000);

        let details = evaluate(
            &discount,
            10_000,
            PaymentContext::Subscription,
            Uuid::new_v4(),
            0,
            now(),
        )
        .unwrap();
        assert_eq!(details.discount_amount, 3_000);
        assert_eq!(details.final_amount, 7_000);
    }

    #[test]
    fn test_final_amount_never_negative() {
        let discount = sample_discount("BIG", DiscountType::Fixed, 500);
        let details = evaluate(
            &discount,
            200,
            PaymentContext::Subscription,
            Uuid::new_v4(),
            0,
            now(),
        )
        .unwrap();
        assert_eq!(details.final_amount, 0);
    }

    #[test]
    fn test_debt_requires_explicit_whitelist() {
        let mut discount = sample_discount("ANY", DiscountType::Fixed, 10);
        discount.applicable_for = vec![DiscountApplicability::All];
        let err = evaluate(&discount, 100, PaymentContext::Debt, Uuid::new_v4(), 0, now())
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidContextDebt(_)));

        discount.applicable_for = vec![DiscountApplicability::Debt];
        assert!(evaluate(&discount, 100, PaymentContext::Debt, Uuid::new_v4(), 0, now()).is_ok());
    }

    #[test]
    fn test_context_mismatch() {
        let mut discount = sample_discount("POSONLY", DiscountType::Fixed, 10);
        discount.applicable_for = vec![DiscountApplicability::Pos];
        let err = evaluate(
            &discount,
            100,
            PaymentContext::Subscription,
            Uuid::new_v4(),
            0,
            now(),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONTEXT");
    }

    #[test]
    fn test_shop_scope() {
        let shop = Uuid::new_v4();
        let mut discount = sample_discount("SHOP", DiscountType::Fixed, 10);
        discount.shop_id = Some(shop);

        assert!(evaluate(&discount, 100, PaymentContext::Pos, shop, 0, now()).is_ok());
        let err = evaluate(&discount, 100, PaymentContext::Pos, Uuid::new_v4(), 0, now())
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidShop(_)));
    }

    #[test]
    fn test_validity_window() {
        let discount = sample_discount("WINDOW", DiscountType::Fixed, 10);
        let tenant = Uuid::new_v4();
        let before = discount.start_date - Duration::seconds(1);
        let after = discount.expiry_date + Duration::seconds(1);

        for at in [before, after] {
            let err =
                evaluate(&discount, 100, PaymentContext::Subscription, tenant, 0, at).unwrap_err();
            assert!(matches!(err, BillingError::InvalidDiscount(_)));
        }
    }

    #[test]
    fn test_minimum_purchase() {
        let mut discount = sample_discount("MIN", DiscountType::Fixed, 10);
        discount.minimum_purchase = 1_000;
        let err = evaluate(
            &discount,
            999,
            PaymentContext::Subscription,
            Uuid::new_v4(),
            0,
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, BillingError::MinimumPurchaseNotMet { minimum: 1_000 }));
    }

    #[test]
    fn test_zero_discount_counts_as_minimum_not_met() {
        let discount = sample_discount("TINY", DiscountType::Percentage, 1);
        let err = evaluate(
            &discount,
            50,
            PaymentContext::Subscription,
            Uuid::new_v4(),
            0,
            now(),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "MINIMUM_PURCHASE_NOT_MET");
    }

    #[test]
    fn test_per_user_and_global_limits() {
        let mut discount = sample_discount("ONCE", DiscountType::Fixed, 10);
        discount.per_user_limit = 1;
        let tenant = Uuid::new_v4();
        let err = evaluate(&discount, 100, PaymentContext::Subscription, tenant, 1, now())
            .unwrap_err();
        assert!(matches!(err, BillingError::DiscountExhausted(_)));

        discount.per_user_limit = 0;
        discount.usage_limit = Some(5);
        discount.usage_count = 5;
        let err = evaluate(&discount, 100, PaymentContext::Subscription, tenant, 9, now())
            .unwrap_err();
        assert!(matches!(err, BillingError::DiscountExhausted(_)));
    }

    #[tokio::test]
    async fn test_validate_normalizes_code() {
        let store = Arc::new(MemoryStore::new());
        seed_discount(&store, sample_discount("SAVE10", DiscountType::Fixed, 10)).await;
        let engine = DiscountEngine::new(store);

        let details = engine
            .validate(" save10 ", 100, PaymentContext::Subscription, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(details.code, "SAVE10");
        assert_eq!(details.usage_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_or_inactive_code() {
        let store = Arc::new(MemoryStore::new());
        let mut inactive = sample_discount("GONE", DiscountType::Fixed, 10);
        inactive.is_active = false;
        seed_discount(&store, inactive).await;
        let engine = DiscountEngine::new(store);

        for code in ["NOPE", "GONE"] {
            let err = engine
                .validate(code, 100, PaymentContext::Subscription, Uuid::new_v4())
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::InvalidDiscount(_)));
        }
    }

    #[tokio::test]
    async fn test_apply_increments_and_records_usage() {
        let store = Arc::new(MemoryStore::new());
        let mut discount = sample_discount("TWICE", DiscountType::Fixed, 10);
        discount.per_user_limit = 1;
        discount.usage_limit = Some(2);
        let id = discount.id;
        seed_discount(&store, discount).await;
        let engine = DiscountEngine::new(store.clone());
        let tenant = Uuid::new_v4();

        let details = engine
            .apply("twice", 100, PaymentContext::Pos, tenant)
            .await
            .unwrap();
        assert_eq!(details.usage_count, 1);
        assert_eq!(store.count_discount_usage(id, tenant).await.unwrap(), 1);

        let err = engine
            .apply("twice", 100, PaymentContext::Pos, tenant)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::DiscountExhausted(_)));
    }

    #[tokio::test]
    async fn test_admin_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let engine = DiscountEngine::new(store.clone());
        let start = now() - Duration::days(1);

        let created = engine
            .create(
                NewDiscountCode {
                    code: "launch-50".to_string(),
                    description: None,
                    discount_type: DiscountType::Percentage,
                    value: 50,
                    minimum_purchase: 0,
                    max_discount_amount: None,
                    start_date: start,
                    expiry_date: start + Duration::days(30),
                    usage_limit: Some(100),
                    per_user_limit: 1,
                    applicable_for: vec![DiscountApplicability::Subscription],
                    shop_id: None,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(created.code, "LAUNCH-50");

        let dup = engine
            .create(
                NewDiscountCode {
                    code: "Launch-50".to_string(),
                    description: None,
                    discount_type: DiscountType::Fixed,
                    value: 5,
                    minimum_purchase: 0,
                    max_discount_amount: None,
                    start_date: start,
                    expiry_date: start + Duration::days(30),
                    usage_limit: None,
                    per_user_limit: 1,
                    applicable_for: vec![DiscountApplicability::All],
                    shop_id: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(dup, BillingError::DiscountCodeExists(_)));

        let updated = engine
            .update(
                created.id,
                DiscountUpdate {
                    value: Some(25),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.value, 25);
        assert_eq!(updated.version, created.version + 1);

        engine.deactivate(created.id).await.unwrap();
        assert!(engine.list(false).await.unwrap().is_empty());
        assert_eq!(engine.list(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_percentage() {
        let engine = DiscountEngine::new(Arc::new(MemoryStore::new()));
        let start = now();
        let err = engine
            .create(
                NewDiscountCode {
                    code: "TOOMUCH".to_string(),
                    description: None,
                    discount_type: DiscountType::Percentage,
                    value: 150,
                    minimum_purchase: 0,
                    max_discount_amount: None,
                    start_date: start,
                    expiry_date: start + Duration::days(1),
                    usage_limit: None,
                    per_user_limit: 1,
                    applicable_for: vec![DiscountApplicability::All],
                    shop_id: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_update_null_clears_limit() {
        let update: DiscountUpdate = serde_json::from_str(r#"{"usageLimit": null}"#).unwrap();
        assert_eq!(update.usage_limit, Some(None));
        let update: DiscountUpdate = serde_json::from_str(r#"{"value": 5}"#).unwrap();
        assert_eq!(update.usage_limit, None);
        assert_eq!(update.max_discount_amount, None);
    }
}
