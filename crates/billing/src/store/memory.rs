//! In-process store for tests and local development
//!
//! Transactions are serialized: `begin` takes the state lock and works on a
//! copy, `commit` swaps the copy in. Reads outside a transaction wait for any
//! open transaction to finish, so callers must not read through the store
//! while holding a `StoreTx` on the same task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use shopsub_shared::SubscriptionStatus;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{BillingStore, StoreTx};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    DiscountCode, DiscountUsage, OwnerAccount, Payment, PaymentFilter, Subscription, Tenant,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tenants: HashMap<Uuid, Tenant>,
    owners: HashMap<Uuid, OwnerAccount>,
    subscriptions: HashMap<Uuid, Subscription>,
    payments: HashMap<Uuid, Payment>,
    discounts: HashMap<Uuid, DiscountCode>,
    discount_usages: Vec<DiscountUsage>,
}

impl MemoryState {
    fn open_subscription(&self, tenant_id: Uuid) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .find(|s| s.tenant_id == tenant_id && s.status.is_open())
    }

    fn discount_by_code(&self, code: &str) -> Option<&DiscountCode> {
        self.discounts.values().find(|d| d.code == code)
    }

    fn usage_count(&self, discount_id: Uuid, tenant_id: Uuid) -> i64 {
        self.discount_usages
            .iter()
            .filter(|u| u.discount_id == discount_id && u.tenant_id == tenant_id)
            .count() as i64
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx { guard, staged }))
    }

    async fn find_tenant(&self, id: Uuid) -> BillingResult<Option<Tenant>> {
        Ok(self.state.lock().await.tenants.get(&id).cloned())
    }

    async fn find_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&id).cloned())
    }

    async fn find_open_subscription(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().await.open_subscription(tenant_id).cloned())
    }

    async fn list_subscriptions(
        &self,
        statuses: &[SubscriptionStatus],
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut subs: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn find_payment(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.state.lock().await.payments.get(&id).cloned())
    }

    async fn list_payments(&self, filter: &PaymentFilter) -> BillingResult<Vec<Payment>> {
        let state = self.state.lock().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn find_discount_by_code(&self, code: &str) -> BillingResult<Option<DiscountCode>> {
        Ok(self.state.lock().await.discount_by_code(code).cloned())
    }

    async fn find_discount(&self, id: Uuid) -> BillingResult<Option<DiscountCode>> {
        Ok(self.state.lock().await.discounts.get(&id).cloned())
    }

    async fn list_discounts(&self, include_inactive: bool) -> BillingResult<Vec<DiscountCode>> {
        let state = self.state.lock().await;
        let mut discounts: Vec<DiscountCode> = state
            .discounts
            .values()
            .filter(|d| include_inactive || d.is_active)
            .cloned()
            .collect();
        discounts.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(discounts)
    }

    async fn count_discount_usage(&self, discount_id: Uuid, tenant_id: Uuid) -> BillingResult<i64> {
        Ok(self.state.lock().await.usage_count(discount_id, tenant_id))
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

fn bump_version(stored: i64, incoming: &mut i64, what: &str, id: Uuid) -> BillingResult<i64> {
    if stored != *incoming {
        return Err(BillingError::ConcurrentModification(format!(
            "{} {} changed since it was read (version {} != {})",
            what, id, incoming, stored
        )));
    }
    *incoming += 1;
    Ok(*incoming)
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn insert_tenant(&mut self, tenant: &Tenant) -> BillingResult<()> {
        self.staged.tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn insert_owner(&mut self, owner: &OwnerAccount) -> BillingResult<()> {
        let email = owner.email.to_lowercase();
        if self
            .staged
            .owners
            .values()
            .any(|o| o.email.to_lowercase() == email)
        {
            return Err(BillingError::AccountExists(owner.email.clone()));
        }
        self.staged.owners.insert(owner.id, owner.clone());
        Ok(())
    }

    async fn insert_subscription(&mut self, subscription: &Subscription) -> BillingResult<()> {
        if subscription.status.is_open()
            && self
                .staged
                .open_subscription(subscription.tenant_id)
                .is_some()
        {
            return Err(BillingError::SubscriptionExists(subscription.tenant_id));
        }
        self.staged
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn find_subscription(&mut self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.staged.subscriptions.get(&id).cloned())
    }

    async fn find_open_subscription(
        &mut self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.staged.open_subscription(tenant_id).cloned())
    }

    async fn update_subscription(&mut self, subscription: &mut Subscription) -> BillingResult<()> {
        let stored = self
            .staged
            .subscriptions
            .get_mut(&subscription.id)
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription.id)))?;
        bump_version(
            stored.version,
            &mut subscription.version,
            "Subscription",
            subscription.id,
        )?;
        *stored = subscription.clone();
        Ok(())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> BillingResult<()> {
        self.staged.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn find_payment(&mut self, id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.staged.payments.get(&id).cloned())
    }

    async fn update_payment(&mut self, payment: &mut Payment) -> BillingResult<()> {
        let stored = self
            .staged
            .payments
            .get_mut(&payment.id)
            .ok_or_else(|| BillingError::NotFound(format!("Payment {}", payment.id)))?;
        bump_version(stored.version, &mut payment.version, "Payment", payment.id)?;
        *stored = payment.clone();
        Ok(())
    }

    async fn insert_discount(&mut self, discount: &DiscountCode) -> BillingResult<()> {
        if self.staged.discount_by_code(&discount.code).is_some() {
            return Err(BillingError::DiscountCodeExists(discount.code.clone()));
        }
        self.staged.discounts.insert(discount.id, discount.clone());
        Ok(())
    }

    async fn find_discount(&mut self, id: Uuid) -> BillingResult<Option<DiscountCode>> {
        Ok(self.staged.discounts.get(&id).cloned())
    }

    async fn find_discount_by_code(&mut self, code: &str) -> BillingResult<Option<DiscountCode>> {
        Ok(self.staged.discount_by_code(code).cloned())
    }

    async fn update_discount(&mut self, discount: &mut DiscountCode) -> BillingResult<()> {
        if self
            .staged
            .discounts
            .values()
            .any(|d| d.id != discount.id && d.code == discount.code)
        {
            return Err(BillingError::DiscountCodeExists(discount.code.clone()));
        }
        let stored = self
            .staged
            .discounts
            .get_mut(&discount.id)
            .ok_or_else(|| BillingError::NotFound(format!("Discount {}", discount.id)))?;
        bump_version(stored.version, &mut discount.version, "Discount", discount.id)?;
        discount.usage_count = stored.usage_count;
        *stored = discount.clone();
        Ok(())
    }

    async fn increment_discount_usage(&mut self, discount_id: Uuid) -> BillingResult<Option<i64>> {
        let Some(discount) = self.staged.discounts.get_mut(&discount_id) else {
            return Ok(None);
        };
        if !discount.is_active {
            return Ok(None);
        }
        if discount
            .usage_limit
            .is_some_and(|limit| discount.usage_count >= limit)
        {
            return Ok(None);
        }
        discount.usage_count += 1;
        Ok(Some(discount.usage_count))
    }

    async fn record_discount_usage(&mut self, usage: &DiscountUsage) -> BillingResult<()> {
        self.staged.discount_usages.push(usage.clone());
        Ok(())
    }

    async fn release_discount_usage(
        &mut self,
        discount_id: Uuid,
        payment_id: Uuid,
    ) -> BillingResult<bool> {
        let Some(pos) = self
            .staged
            .discount_usages
            .iter()
            .position(|u| u.discount_id == discount_id && u.payment_id == Some(payment_id))
        else {
            return Ok(false);
        };
        self.staged.discount_usages.remove(pos);
        if let Some(discount) = self.staged.discounts.get_mut(&discount_id) {
            if discount.usage_count > 0 {
                discount.usage_count -= 1;
            }
        }
        Ok(true)
    }

    async fn count_discount_usage(
        &mut self,
        discount_id: Uuid,
        tenant_id: Uuid,
    ) -> BillingResult<i64> {
        Ok(self.staged.usage_count(discount_id, tenant_id))
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let MemoryTx { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_subscription, sample_tenant};

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        let tenant = sample_tenant();

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_tenant(&tenant).await.unwrap();
        }

        assert!(store.find_tenant(tenant.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = MemoryStore::new();
        let tenant = sample_tenant();

        let mut tx = store.begin().await.unwrap();
        tx.insert_tenant(&tenant).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.find_tenant(tenant.id).await.unwrap(), Some(tenant));
    }

    #[tokio::test]
    async fn test_second_open_subscription_rejected() {
        let store = MemoryStore::new();
        let tenant = sample_tenant();

        let mut tx = store.begin().await.unwrap();
        tx.insert_subscription(&sample_subscription(tenant.id))
            .await
            .unwrap();
        let err = tx
            .insert_subscription(&sample_subscription(tenant.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionExists(id) if id == tenant.id));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = MemoryStore::new();
        let sub = sample_subscription(Uuid::new_v4());

        let mut tx = store.begin().await.unwrap();
        tx.insert_subscription(&sub).await.unwrap();
        tx.commit().await.unwrap();

        let mut first = store.find_subscription(sub.id).await.unwrap().unwrap();
        let mut stale = first.clone();

        let mut tx = store.begin().await.unwrap();
        tx.update_subscription(&mut first).await.unwrap();
        assert_eq!(first.version, sub.version + 1);
        let err = tx.update_subscription(&mut stale).await.unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }
}
