//! Payment ledger
//!
//! The authoritative record of every payment attempt, whichever channel
//! produced it. Status moves `pending -> confirmed | failed` once, and
//! `confirmed -> refunded | partially_refunded` afterwards. The one exception
//! is a payment failed only because our gateway call timed out: the gateway
//! may still have collected it, so a later confirmation is honored.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shopsub_shared::{
    IntegrationStatus, PaymentChannel, PaymentContext, PaymentMethod, PaymentStatus, PlanType,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    AppliedDiscount, Confirmation, FailureKind, GatewayMetadata, Payment, PaymentFailure,
    PaymentFilter, RefundRecord, VerificationAttempt,
};
use crate::store::{BillingStore, StoreTx};

/// Ledger entry to create
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub tenant_id: Uuid,
    pub context: PaymentContext,
    pub subscription_id: Option<Uuid>,
    pub pos_order_id: Option<String>,
    pub debt_id: Option<Uuid>,
    pub plan_type: Option<PlanType>,
    pub gross_amount: i64,
    pub discount: Option<AppliedDiscount>,
    pub amount: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub payer_phone: Option<String>,
    pub proof_reference: Option<String>,
}

impl NewPayment {
    /// Subscription payment with no discount
    pub fn for_subscription(
        tenant_id: Uuid,
        subscription_id: Uuid,
        plan_type: PlanType,
        amount: i64,
        currency: &str,
        method: PaymentMethod,
    ) -> Self {
        Self {
            tenant_id,
            context: PaymentContext::Subscription,
            subscription_id: Some(subscription_id),
            pos_order_id: None,
            debt_id: None,
            plan_type: Some(plan_type),
            gross_amount: amount,
            discount: None,
            amount,
            currency: currency.to_string(),
            method,
            payer_phone: None,
            proof_reference: None,
        }
    }

    fn has_context_reference(&self) -> bool {
        match self.context {
            PaymentContext::Subscription => self.subscription_id.is_some(),
            PaymentContext::Pos => self
                .pos_order_id
                .as_deref()
                .is_some_and(|id| !id.trim().is_empty()),
            PaymentContext::Debt => self.debt_id.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Confirmed,
    /// Nothing changed; the payment was settled earlier
    AlreadyConfirmed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub amount: i64,
    pub reason: String,
    pub reference: Option<String>,
}

/// Build a pending payment after checking its context back-reference
pub fn new_pending(entry: NewPayment, now: OffsetDateTime) -> BillingResult<Payment> {
    if !entry.has_context_reference() {
        return Err(BillingError::MissingContextReference(entry.context));
    }
    if entry.amount < 0 || entry.gross_amount < entry.amount {
        return Err(BillingError::InvalidInput(format!(
            "invalid amounts: gross {} charged {}",
            entry.gross_amount, entry.amount
        )));
    }

    let channel = entry.method.channel();
    let (integration_status, gateway) = match channel {
        PaymentChannel::Gateway => (
            IntegrationStatus::Initiated,
            Some(GatewayMetadata {
                phone: entry.payer_phone,
                ..Default::default()
            }),
        ),
        PaymentChannel::Offline => (IntegrationStatus::NotApplicable, None),
    };

    Ok(Payment {
        id: Uuid::new_v4(),
        tenant_id: entry.tenant_id,
        context: entry.context,
        subscription_id: entry.subscription_id,
        pos_order_id: entry.pos_order_id,
        debt_id: entry.debt_id,
        plan_type: entry.plan_type,
        gross_amount: entry.gross_amount,
        discount: entry.discount,
        amount: entry.amount,
        currency: entry.currency,
        channel,
        method: entry.method,
        status: PaymentStatus::Pending,
        integration_status,
        gateway,
        proof_reference: entry.proof_reference,
        verification_attempts: Vec::new(),
        confirmation: None,
        failure: None,
        refunds: Vec::new(),
        version: 0,
        created_at: now,
        updated_at: now,
    })
}

pub async fn create_pending_in(
    tx: &mut dyn StoreTx,
    entry: NewPayment,
    now: OffsetDateTime,
) -> BillingResult<Payment> {
    let payment = new_pending(entry, now)?;
    tx.insert_payment(&payment).await?;

    tracing::info!(
        payment_id = %payment.id,
        tenant_id = %payment.tenant_id,
        context = %payment.context,
        channel = %payment.channel,
        amount = payment.amount,
        "Pending payment recorded"
    );
    Ok(payment)
}

/// Whether a failed payment may still be confirmed
pub fn is_late_settleable(payment: &Payment) -> bool {
    payment.status == PaymentStatus::Failed
        && payment
            .failure
            .as_ref()
            .is_some_and(|f| f.kind == FailureKind::LocalTimeout)
}

pub fn confirm(
    payment: &mut Payment,
    actor_id: Option<Uuid>,
    now: OffsetDateTime,
) -> BillingResult<ConfirmOutcome> {
    match payment.status {
        PaymentStatus::Confirmed | PaymentStatus::Refunded | PaymentStatus::PartiallyRefunded => {
            return Ok(ConfirmOutcome::AlreadyConfirmed);
        }
        PaymentStatus::Pending => {}
        PaymentStatus::Failed if is_late_settleable(payment) => {
            tracing::info!(
                payment_id = %payment.id,
                "Confirming payment previously failed by local timeout"
            );
        }
        PaymentStatus::Failed => {
            return Err(BillingError::invalid_transition(
                "payment",
                payment.status,
                PaymentStatus::Confirmed,
            ));
        }
    }

    payment.status = PaymentStatus::Confirmed;
    payment.failure = None;
    payment.confirmation = Some(Confirmation {
        confirmed_by: actor_id,
        confirmed_at: now,
    });
    if payment.channel == PaymentChannel::Gateway {
        payment.integration_status = IntegrationStatus::Completed;
    }
    payment.updated_at = now;
    Ok(ConfirmOutcome::Confirmed)
}

/// Mark a payment failed. A local-timeout failure may be replaced by a final one.
pub fn fail(
    payment: &mut Payment,
    kind: FailureKind,
    reason: impl Into<String>,
    now: OffsetDateTime,
) -> BillingResult<()> {
    if payment.status != PaymentStatus::Pending && !is_late_settleable(payment) {
        return Err(BillingError::invalid_transition(
            "payment",
            payment.status,
            PaymentStatus::Failed,
        ));
    }

    payment.status = PaymentStatus::Failed;
    payment.failure = Some(PaymentFailure {
        kind,
        reason: reason.into(),
        failed_at: now,
    });
    if payment.channel == PaymentChannel::Gateway {
        payment.integration_status = IntegrationStatus::Failed;
    }
    payment.updated_at = now;
    Ok(())
}

pub fn record_refund(
    payment: &mut Payment,
    request: RefundRequest,
    actor_id: Option<Uuid>,
    now: OffsetDateTime,
) -> BillingResult<PaymentStatus> {
    if payment.status != PaymentStatus::Confirmed {
        return Err(BillingError::invalid_transition(
            "payment",
            payment.status,
            PaymentStatus::Refunded,
        ));
    }
    if request.amount <= 0 || request.amount > payment.amount {
        return Err(BillingError::InvalidInput(format!(
            "refund amount must be between 1 and {}",
            payment.amount
        )));
    }

    let status = if request.amount < payment.amount {
        PaymentStatus::PartiallyRefunded
    } else {
        PaymentStatus::Refunded
    };
    payment.refunds.push(RefundRecord {
        amount: request.amount,
        reason: request.reason,
        actor_id,
        reference: request.reference,
        refunded_at: now,
    });
    payment.status = status;
    payment.updated_at = now;
    Ok(status)
}

/// Append a review entry. Never changes status.
pub fn add_verification_attempt(payment: &mut Payment, attempt: VerificationAttempt) {
    payment.updated_at = attempt.at;
    payment.verification_attempts.push(attempt);
}

/// Store-backed ledger operations for callers outside the settlement flow
#[derive(Clone)]
pub struct PaymentLedger {
    store: Arc<dyn BillingStore>,
}

impl PaymentLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn create_pending(&self, entry: NewPayment) -> BillingResult<Payment> {
        let mut tx = self.store.begin().await?;
        let payment = create_pending_in(tx.as_mut(), entry, OffsetDateTime::now_utc()).await?;
        tx.commit().await?;
        Ok(payment)
    }

    pub async fn get(&self, payment_id: Uuid) -> BillingResult<Payment> {
        self.store
            .find_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Payment {}", payment_id)))
    }

    pub async fn list(&self, filter: &PaymentFilter) -> BillingResult<Vec<Payment>> {
        self.store.list_payments(filter).await
    }

    /// Confirm a payment without touching any subscription
    pub async fn confirm(
        &self,
        payment_id: Uuid,
        actor_id: Option<Uuid>,
    ) -> BillingResult<(Payment, ConfirmOutcome)> {
        let mut tx = self.store.begin().await?;
        let mut payment = load_payment(tx.as_mut(), payment_id).await?;
        let outcome = confirm(&mut payment, actor_id, OffsetDateTime::now_utc())?;
        if outcome == ConfirmOutcome::Confirmed {
            tx.update_payment(&mut payment).await?;
            tx.commit().await?;
            tracing::info!(payment_id = %payment_id, "Payment confirmed");
        }
        Ok((payment, outcome))
    }

    pub async fn record_refund(
        &self,
        payment_id: Uuid,
        request: RefundRequest,
        actor_id: Option<Uuid>,
    ) -> BillingResult<Payment> {
        let mut tx = self.store.begin().await?;
        let mut payment = load_payment(tx.as_mut(), payment_id).await?;
        let status = record_refund(&mut payment, request, actor_id, OffsetDateTime::now_utc())?;
        tx.update_payment(&mut payment).await?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment_id,
            status = %status,
            refunded = payment.refunded_total(),
            "Refund recorded"
        );
        Ok(payment)
    }

    pub async fn add_verification_attempt(
        &self,
        payment_id: Uuid,
        attempt: VerificationAttempt,
    ) -> BillingResult<Payment> {
        let mut tx = self.store.begin().await?;
        let mut payment = load_payment(tx.as_mut(), payment_id).await?;
        add_verification_attempt(&mut payment, attempt);
        tx.update_payment(&mut payment).await?;
        tx.commit().await?;
        Ok(payment)
    }
}

pub(crate) async fn load_payment(tx: &mut dyn StoreTx, payment_id: Uuid) -> BillingResult<Payment> {
    tx.find_payment(payment_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Payment {}", payment_id)))
}
