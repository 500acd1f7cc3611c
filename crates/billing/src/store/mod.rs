//! Persistence seam
//!
//! The engine talks to its document store only through these two traits.
//! `BillingStore` serves reads and opens transactions; `StoreTx` performs
//! every write. A `StoreTx` dropped without `commit` discards its writes.
//!
//! Versioned updates compare the document's `version` against the stored one
//! and fail with `ConcurrentModification` when another writer got there
//! first. On success the store bumps `version` on the caller's copy.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use shopsub_shared::SubscriptionStatus;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    DiscountCode, DiscountUsage, OwnerAccount, Payment, PaymentFilter, Subscription, Tenant,
};

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn begin(&self) -> BillingResult<Box<dyn StoreTx>>;

    async fn find_tenant(&self, id: Uuid) -> BillingResult<Option<Tenant>>;

    async fn find_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// The tenant's non-canceled subscription, if any
    async fn find_open_subscription(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn list_subscriptions(
        &self,
        statuses: &[SubscriptionStatus],
    ) -> BillingResult<Vec<Subscription>>;

    async fn find_payment(&self, id: Uuid) -> BillingResult<Option<Payment>>;

    /// Payments matching `filter`, oldest first
    async fn list_payments(&self, filter: &PaymentFilter) -> BillingResult<Vec<Payment>>;

    /// Lookup by normalized (uppercase) code, active or not
    async fn find_discount_by_code(&self, code: &str) -> BillingResult<Option<DiscountCode>>;

    async fn find_discount(&self, id: Uuid) -> BillingResult<Option<DiscountCode>>;

    async fn list_discounts(&self, include_inactive: bool) -> BillingResult<Vec<DiscountCode>>;

    async fn count_discount_usage(&self, discount_id: Uuid, tenant_id: Uuid) -> BillingResult<i64>;
}

/// Unit of work. Reads through a transaction lock the documents they return
/// until commit or drop.
#[async_trait]
pub trait StoreTx: Send {
    async fn insert_tenant(&mut self, tenant: &Tenant) -> BillingResult<()>;

    /// Fails with `AccountExists` when the email is taken
    async fn insert_owner(&mut self, owner: &OwnerAccount) -> BillingResult<()>;

    /// Fails with `SubscriptionExists` when the tenant already has an open one
    async fn insert_subscription(&mut self, subscription: &Subscription) -> BillingResult<()>;

    async fn find_subscription(&mut self, id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn find_open_subscription(
        &mut self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    async fn update_subscription(&mut self, subscription: &mut Subscription) -> BillingResult<()>;

    async fn insert_payment(&mut self, payment: &Payment) -> BillingResult<()>;

    async fn find_payment(&mut self, id: Uuid) -> BillingResult<Option<Payment>>;

    async fn update_payment(&mut self, payment: &mut Payment) -> BillingResult<()>;

    /// Fails with `DiscountCodeExists` when the code is taken
    async fn insert_discount(&mut self, discount: &DiscountCode) -> BillingResult<()>;

    async fn find_discount(&mut self, id: Uuid) -> BillingResult<Option<DiscountCode>>;

    async fn find_discount_by_code(&mut self, code: &str) -> BillingResult<Option<DiscountCode>>;

    /// Admin edit. Never touches `usage_count`.
    async fn update_discount(&mut self, discount: &mut DiscountCode) -> BillingResult<()>;

    /// Atomically add one use. Returns the new count, or `None` when the code
    /// is inactive or already at its usage limit.
    async fn increment_discount_usage(&mut self, discount_id: Uuid) -> BillingResult<Option<i64>>;

    async fn record_discount_usage(&mut self, usage: &DiscountUsage) -> BillingResult<()>;

    /// Give back the use taken for `payment_id`: delete its usage row and
    /// decrement the counter. False when that payment held no use.
    async fn release_discount_usage(
        &mut self,
        discount_id: Uuid,
        payment_id: Uuid,
    ) -> BillingResult<bool>;

    async fn count_discount_usage(&mut self, discount_id: Uuid, tenant_id: Uuid)
        -> BillingResult<i64>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;
}
