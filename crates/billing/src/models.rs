//! Documents persisted by the billing store
//!
//! These are plain data. State transitions live next to the services that
//! own them (`ledger` for payments, `subscriptions` for subscriptions,
//! `discounts` for discount codes).

use serde::{Deserialize, Serialize};
use shopsub_shared::{
    ActorRole, DiscountApplicability, DiscountType, IntegrationStatus, PaymentChannel, PaymentContext,
    PaymentMethod, PaymentStatus, PlanType, SubscriptionStatus,
};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Tenant
// =============================================================================

/// A shop subscribing to the product
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub phone: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// The account that owns a tenant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnerAccount {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Authenticated caller, resolved by the surface in front of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: ActorRole,
}

impl Actor {
    pub fn admin(id: Uuid) -> Self {
        Self {
            id,
            role: ActorRole::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == ActorRole::Admin
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Plan as it was when the subscription last changed plan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanSnapshot {
    #[serde(rename = "type")]
    pub plan_type: PlanType,
    pub name: String,
    pub base_price: i64,
    pub currency: String,
    pub billing_cycle_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    pub base_price: i64,
    pub discount_amount: i64,
    pub final_price: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionDates {
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub canceled_at: Option<OffsetDateTime>,
}

/// Latest payment facts, denormalized for the read model
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSummary {
    pub method: Option<PaymentMethod>,
    pub verified: bool,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_payment_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub next_payment_date: Option<OffsetDateTime>,
    pub failed_payment_count: u32,
    pub last_payment_id: Option<Uuid>,
    /// Mobile-money number used for the last gateway payment; auto-renewal charges it
    pub payer_phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenewalSettings {
    pub auto_renew: bool,
    /// Cancel instead of expire when the current period ends
    pub cancel_at_period_end: bool,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            auto_renew: true,
            cancel_at_period_end: false,
        }
    }
}

/// End dates for which reminders, and the auto-renewal charge, already went out
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReminderLog {
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub trial_ending_sent_for: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub expiry_sent_for: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub auto_renew_attempted_for: Option<OffsetDateTime>,
}

/// One entry of a subscription's transition log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub from_status: Option<SubscriptionStatus>,
    pub to_status: SubscriptionStatus,
    pub plan_type: PlanType,
    pub payment_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan: PlanSnapshot,
    pub status: SubscriptionStatus,
    pub pricing: Pricing,
    pub dates: SubscriptionDates,
    pub payment: PaymentSummary,
    pub renewal: RenewalSettings,
    #[serde(default)]
    pub reminders: ReminderLog,
    pub history: Vec<HistoryEntry>,
    /// Optimistic concurrency token, bumped by the store on every write
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Payment
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayMetadata {
    pub transaction_id: Option<String>,
    pub response_code: Option<String>,
    pub response_message: Option<String>,
    pub phone: Option<String>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub callback_received_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Approved,
    Rejected,
    /// Reviewed without a decision (e.g. proof requested again)
    Noted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationAttempt {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub actor_id: Option<Uuid>,
    pub outcome: VerificationOutcome,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub confirmed_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub confirmed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Gateway refused the request or reported a failed collection
    Declined,
    /// Our call to the gateway never got an answer; a late callback may still settle it
    LocalTimeout,
    /// Admin rejected the offline proof
    Rejected,
    /// Reconciliation gave up on a payment the gateway does not know
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailure {
    pub kind: FailureKind,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RefundRecord {
    pub amount: i64,
    pub reason: String,
    pub actor_id: Option<Uuid>,
    pub reference: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub refunded_at: OffsetDateTime,
}

/// Discount recorded by value so later edits to the code never change history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppliedDiscount {
    pub discount_id: Uuid,
    pub code: String,
    #[serde(rename = "type")]
    pub discount_type: DiscountType,
    pub value: i64,
    pub discount_amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub context: PaymentContext,
    pub subscription_id: Option<Uuid>,
    pub pos_order_id: Option<String>,
    pub debt_id: Option<Uuid>,
    /// Plan being bought, for subscription payments
    pub plan_type: Option<PlanType>,
    /// Amount before discount
    pub gross_amount: i64,
    pub discount: Option<AppliedDiscount>,
    /// Amount actually collected
    pub amount: i64,
    pub currency: String,
    pub channel: PaymentChannel,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub integration_status: IntegrationStatus,
    pub gateway: Option<GatewayMetadata>,
    pub proof_reference: Option<String>,
    pub verification_attempts: Vec<VerificationAttempt>,
    pub confirmation: Option<Confirmation>,
    pub failure: Option<PaymentFailure>,
    pub refunds: Vec<RefundRecord>,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Payment {
    pub fn refunded_total(&self) -> i64 {
        self.refunds.iter().map(|r| r.amount).sum()
    }
}

/// Filter for ledger listings
#[derive(Debug, Clone, Default)]
pub struct PaymentFilter {
    pub status: Option<PaymentStatus>,
    pub channel: Option<PaymentChannel>,
    pub subscription_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub created_before: Option<OffsetDateTime>,
}

impl PaymentFilter {
    pub fn matches(&self, payment: &Payment) -> bool {
        self.status.map_or(true, |s| payment.status == s)
            && self.channel.map_or(true, |c| payment.channel == c)
            && self
                .subscription_id
                .map_or(true, |id| payment.subscription_id == Some(id))
            && self.tenant_id.map_or(true, |id| payment.tenant_id == id)
            && self
                .created_before
                .map_or(true, |cutoff| payment.created_at < cutoff)
    }
}

// =============================================================================
// Discount codes
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscountCode {
    pub id: Uuid,
    /// Always stored uppercase
    pub code: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub discount_type: DiscountType,
    /// Fixed amount, or whole percent for percentage codes
    pub value: i64,
    pub minimum_purchase: i64,
    pub max_discount_amount: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expiry_date: OffsetDateTime,
    pub usage_limit: Option<i64>,
    pub per_user_limit: i64,
    pub usage_count: i64,
    pub applicable_for: Vec<DiscountApplicability>,
    /// `None` means the code works in every shop
    pub shop_id: Option<Uuid>,
    pub is_active: bool,
    pub created_by: Option<Uuid>,
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// One use of a discount code by a tenant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscountUsage {
    pub id: Uuid,
    pub discount_id: Uuid,
    pub tenant_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub discount_amount: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub used_at: OffsetDateTime,
}
