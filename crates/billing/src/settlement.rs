//! Settlement coordinator
//!
//! Every write that spans documents goes through here, inside one store
//! transaction: onboarding (tenant, owner, subscription) and settlement
//! (ledger entry plus subscription transition). Gateway payments are a saga:
//! the pending payment is committed before the gateway is called, and the
//! subscription only moves when the callback (or the reconciliation sweep)
//! re-enters `settle` with the payment already on the ledger.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shopsub_shared::{
    IntegrationStatus, PaymentChannel, PaymentContext, PaymentMethod, PaymentStatus, PlanType,
    SubscriptionStatus, VerificationDecision,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::callback::{self, CallbackAck, CallbackOutcome, GatewayCallback};
use crate::config::BillingConfig;
use crate::discounts;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{self, GatewayResult, GatewayStatus, InitiateRequest, PaymentGateway};
use crate::jobs::JobReport;
use crate::ledger::{self, ConfirmOutcome, NewPayment, RefundRequest};
use crate::models::{
    Actor, FailureKind, OwnerAccount, Payment, PaymentFilter, Subscription, Tenant,
    VerificationAttempt, VerificationOutcome,
};
use crate::notifications::{self, Notification, Notifier};
use crate::plans::PlanCatalog;
use crate::store::{BillingStore, StoreTx};
use crate::subscriptions::{self, Cause};

// =============================================================================
// Requests and results
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTenant {
    pub shop_name: String,
    pub owner_name: String,
    pub owner_email: String,
    pub phone: Option<String>,
    /// Defaults to the trial plan
    pub plan: Option<PlanType>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub tenant: Tenant,
    pub owner: OwnerAccount,
    pub subscription: Subscription,
}

/// Subscription payment through the mobile-money gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPaymentRequest {
    pub tenant_id: Uuid,
    pub plan_type: PlanType,
    pub phone: String,
    pub discount_code: Option<String>,
}

/// Offline payment backed by an uploaded proof
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflinePaymentRequest {
    pub tenant_id: Uuid,
    #[serde(default = "default_context")]
    pub context: PaymentContext,
    pub subscription_id: Option<Uuid>,
    pub pos_order_id: Option<String>,
    pub debt_id: Option<Uuid>,
    /// Required for subscription payments; the plan price is charged
    pub plan_type: Option<PlanType>,
    /// Required for POS and debt payments
    pub amount: Option<i64>,
    pub method: PaymentMethod,
    pub proof_reference: String,
    pub discount_code: Option<String>,
}

fn default_context() -> PaymentContext {
    PaymentContext::Subscription
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    Confirmed,
    /// Already settled earlier; nothing changed
    AlreadyConfirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub payment: Payment,
    /// The subscription after the transition, when one happened
    pub subscription: Option<Subscription>,
    pub outcome: SettlementOutcome,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    #[serde(default)]
    pub immediate: bool,
    pub reason: Option<String>,
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Clone)]
pub struct SettlementCoordinator {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    catalog: Arc<PlanCatalog>,
    config: Arc<BillingConfig>,
}

impl SettlementCoordinator {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        catalog: Arc<PlanCatalog>,
        config: Arc<BillingConfig>,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            catalog,
            config,
        }
    }

    /// Create tenant, owner account and first subscription together
    pub async fn register_tenant(&self, request: RegisterTenant) -> BillingResult<Registration> {
        let shop_name = request.shop_name.trim().to_string();
        let owner_name = request.owner_name.trim().to_string();
        let email = request.owner_email.trim().to_lowercase();
        if shop_name.is_empty() || owner_name.is_empty() {
            return Err(BillingError::InvalidInput(
                "shop and owner names are required".to_string(),
            ));
        }
        if !email.contains('@') {
            return Err(BillingError::InvalidInput(format!("invalid email {}", email)));
        }
        let plan = self
            .catalog
            .get_plan(request.plan.unwrap_or(PlanType::Trial))?;

        let now = OffsetDateTime::now_utc();
        let tenant_id = Uuid::new_v4();
        let owner = OwnerAccount {
            id: Uuid::new_v4(),
            tenant_id,
            name: owner_name,
            email,
            phone: request.phone.clone(),
            created_at: now,
        };
        let tenant = Tenant {
            id: tenant_id,
            name: shop_name,
            owner_id: owner.id,
            phone: request.phone,
            created_at: now,
        };
        let subscription = subscriptions::new_subscription(tenant_id, plan, now);

        let mut tx = self.store.begin().await?;
        tx.insert_tenant(&tenant).await?;
        tx.insert_owner(&owner).await?;
        tx.insert_subscription(&subscription).await?;
        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant.id,
            subscription_id = %subscription.id,
            plan = %subscription.plan.plan_type,
            status = %subscription.status,
            "Tenant registered"
        );
        Ok(Registration {
            tenant,
            owner,
            subscription,
        })
    }

    // -------------------------------------------------------------------------
    // Gateway channel
    // -------------------------------------------------------------------------

    pub async fn initiate_gateway_payment(
        &self,
        request: GatewayPaymentRequest,
    ) -> BillingResult<Payment> {
        self.initiate_gateway_payment_at(request, OffsetDateTime::now_utc())
            .await
    }

    /// Commit a pending payment, then ask the gateway to collect it. The
    /// subscription does not change until the payment settles.
    pub(crate) async fn initiate_gateway_payment_at(
        &self,
        request: GatewayPaymentRequest,
        now: OffsetDateTime,
    ) -> BillingResult<Payment> {
        let phone = gateway::format_phone(&request.phone, &self.config.gateway.country_code)
            .ok_or_else(|| {
                BillingError::InvalidInput(format!("invalid phone number {}", request.phone))
            })?;
        let plan = self.catalog.get_plan(request.plan_type)?;
        if !plan.plan_type.is_paid() {
            return Err(BillingError::InvalidPlan(format!(
                "{} plan cannot be purchased",
                plan.plan_type
            )));
        }

        let mut tx = self.store.begin().await?;
        let subscription = tx
            .find_open_subscription(request.tenant_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "No open subscription for tenant {}",
                    request.tenant_id
                ))
            })?;
        let mut entry = NewPayment::for_subscription(
            request.tenant_id,
            subscription.id,
            plan.plan_type,
            plan.base_price,
            &plan.currency,
            PaymentMethod::MobileMoney,
        );
        entry.payer_phone = Some(phone.clone());
        let payment =
            record_pending(tx.as_mut(), entry, request.discount_code.as_deref(), now).await?;
        tx.commit().await?;

        if payment.amount == 0 {
            tracing::info!(payment_id = %payment.id, "Fully discounted, settling without gateway");
            return self.settle(payment.id, None, now).await.map(|s| s.payment);
        }

        let initiate = InitiateRequest {
            phone,
            amount: payment.amount,
            currency: payment.currency.clone(),
            description: format!("{} subscription", plan.name),
            reference: payment.id,
        };

        match self.gateway.initiate(&initiate).await {
            Ok(result) if result.success => self.mark_awaiting_callback(payment.id, &result, now).await,
            Ok(result) => {
                let reason = result
                    .response_message
                    .clone()
                    .unwrap_or_else(|| format!("gateway response code {}", result.response_code));
                self.record_initiation_failure(payment.id, FailureKind::Declined, &reason, now)
                    .await?;
                Err(BillingError::PaymentFailed(reason))
            }
            Err(e) if e.is_retryable() => {
                self.record_initiation_failure(
                    payment.id,
                    FailureKind::LocalTimeout,
                    &e.to_string(),
                    now,
                )
                .await?;
                Err(BillingError::PaymentFailed(e.to_string()))
            }
            Err(e) => {
                self.record_initiation_failure(payment.id, FailureKind::Declined, &e.to_string(), now)
                    .await?;
                Err(BillingError::Gateway(e))
            }
        }
    }

    async fn mark_awaiting_callback(
        &self,
        payment_id: Uuid,
        result: &GatewayResult,
        now: OffsetDateTime,
    ) -> BillingResult<Payment> {
        let mut tx = self.store.begin().await?;
        let mut payment = ledger::load_payment(tx.as_mut(), payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            // Callback beat us here
            return Ok(payment);
        }
        let meta = payment.gateway.get_or_insert_with(Default::default);
        meta.transaction_id = result.transaction_id.clone();
        meta.response_code = Some(result.response_code.clone());
        meta.response_message = result.response_message.clone();
        payment.integration_status = IntegrationStatus::AwaitingCallback;
        payment.updated_at = now;
        tx.update_payment(&mut payment).await?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment_id,
            transaction_id = ?result.transaction_id,
            "Gateway accepted payment, awaiting callback"
        );
        Ok(payment)
    }

    async fn record_initiation_failure(
        &self,
        payment_id: Uuid,
        kind: FailureKind,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut tx = self.store.begin().await?;
        let mut payment = ledger::load_payment(tx.as_mut(), payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Ok(());
        }
        ledger::fail(&mut payment, kind, reason, now)?;
        count_failure(tx.as_mut(), &payment, now).await?;
        discounts::release_in(tx.as_mut(), &payment).await?;
        tx.update_payment(&mut payment).await?;
        tx.commit().await?;

        tracing::warn!(
            payment_id = %payment_id,
            kind = ?kind,
            reason = %reason,
            "Gateway initiation failed"
        );
        Ok(())
    }

    /// Process an inbound gateway callback. Always acknowledged.
    pub async fn handle_gateway_callback(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> CallbackAck {
        if let Some(secret) = &self.config.gateway.callback_secret {
            let valid = signature.is_some_and(|sig| callback::verify_signature(secret, body, sig));
            if !valid {
                tracing::warn!("Gateway callback with invalid signature ignored");
                return CallbackAck::new(CallbackOutcome::InvalidSignature);
            }
        }

        let cb: GatewayCallback = match serde_json::from_slice(body) {
            Ok(cb) => cb,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed gateway callback ignored");
                return CallbackAck::new(CallbackOutcome::Malformed);
            }
        };

        let outcome = match self.apply_callback(&cb, OffsetDateTime::now_utc()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    invoice_id = %cb.invoice_id,
                    transaction_id = ?cb.transaction_id,
                    success = cb.is_success(),
                    error = %e,
                    "RECONCILIATION NEEDED: gateway callback could not be applied"
                );
                CallbackOutcome::Error
            }
        };
        CallbackAck::new(outcome)
    }

    async fn apply_callback(
        &self,
        cb: &GatewayCallback,
        now: OffsetDateTime,
    ) -> BillingResult<CallbackOutcome> {
        let Some(payment_id) = cb.payment_id() else {
            tracing::warn!(invoice_id = %cb.invoice_id, "Gateway callback for unknown reference");
            return Ok(CallbackOutcome::UnknownReference);
        };

        let mut tx = self.store.begin().await?;
        let payment = tx
            .find_payment(payment_id)
            .await?
            .filter(|p| p.channel == PaymentChannel::Gateway);
        let Some(mut payment) = payment else {
            tracing::warn!(invoice_id = %cb.invoice_id, "Gateway callback for unknown reference");
            return Ok(CallbackOutcome::UnknownReference);
        };

        let late = ledger::is_late_settleable(&payment);
        if payment.status != PaymentStatus::Pending && !late {
            tracing::info!(
                payment_id = %payment_id,
                status = %payment.status,
                "Duplicate gateway callback for settled payment"
            );
            return Ok(CallbackOutcome::Duplicate);
        }

        let meta = payment.gateway.get_or_insert_with(Default::default);
        if cb.transaction_id.is_some() {
            meta.transaction_id = cb.transaction_id.clone();
        }
        if cb.result_code.is_some() {
            meta.response_code = cb.result_code.clone();
        }
        if cb.result_desc.is_some() {
            meta.response_message = cb.result_desc.clone();
        }
        meta.callback_received_at = Some(now);

        if cb.is_success() {
            let (_, subscription) = self.settle_in(tx.as_mut(), &mut payment, None, now).await?;
            tx.commit().await?;
            if let Some(subscription) = &subscription {
                tracing::info!(
                    subscription_id = %subscription.id,
                    status = %subscription.status,
                    "Subscription updated from gateway callback"
                );
            }
            self.after_confirmation(&payment).await;
            Ok(CallbackOutcome::Settled)
        } else {
            ledger::fail(&mut payment, FailureKind::Declined, cb.failure_reason(), now)?;
            if !late {
                count_failure(tx.as_mut(), &payment, now).await?;
            }
            discounts::release_in(tx.as_mut(), &payment).await?;
            tx.update_payment(&mut payment).await?;
            tx.commit().await?;
            tracing::info!(
                payment_id = %payment_id,
                reason = %cb.failure_reason(),
                "Gateway payment failed"
            );
            Ok(CallbackOutcome::Failed)
        }
    }

    /// Query the gateway for pending payments older than the configured
    /// timeout and settle or fail the ones with a final answer.
    pub async fn reconcile_pending_payments(&self, now: OffsetDateTime) -> BillingResult<JobReport> {
        let cutoff = now - self.config.lifecycle.pending_payment_timeout;
        let stale = self
            .store
            .list_payments(&PaymentFilter {
                status: Some(PaymentStatus::Pending),
                channel: Some(PaymentChannel::Gateway),
                created_before: Some(cutoff),
                ..Default::default()
            })
            .await?;

        let mut report = JobReport::new("reconcile_pending_payments");
        for payment in stale {
            report.examined += 1;
            let status = match self.gateway.query_status(payment.id).await {
                Ok(status) => status,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(payment_id = %payment.id, error = %e, "Gateway status query failed");
                    continue;
                }
            };

            let result = match status {
                GatewayStatus::Settled { transaction_id } => self
                    .settle_with_transaction(payment.id, transaction_id, now)
                    .await
                    .map(|s| s.outcome == SettlementOutcome::Confirmed),
                GatewayStatus::Failed { reason } => self
                    .fail_pending(payment.id, FailureKind::Declined, &reason, now)
                    .await,
                GatewayStatus::Unknown => self
                    .fail_pending(
                        payment.id,
                        FailureKind::Abandoned,
                        "gateway has no record of this payment",
                        now,
                    )
                    .await,
                GatewayStatus::Pending => Ok(false),
            };

            match result {
                Ok(true) => report.updated += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        payment_id = %payment.id,
                        error = %e,
                        "RECONCILIATION NEEDED: could not apply gateway status"
                    );
                }
            }
        }

        tracing::info!(
            examined = report.examined,
            updated = report.updated,
            errors = report.errors,
            "Pending payment reconciliation finished"
        );
        Ok(report)
    }

    async fn settle_with_transaction(
        &self,
        payment_id: Uuid,
        transaction_id: Option<String>,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement> {
        let mut tx = self.store.begin().await?;
        let mut payment = ledger::load_payment(tx.as_mut(), payment_id).await?;
        if let Some(txn) = transaction_id {
            payment.gateway.get_or_insert_with(Default::default).transaction_id = Some(txn);
        }
        self.finish_settlement(tx, payment, None, now).await
    }

    /// Fail a payment that is still pending. Returns false if it settled meanwhile.
    async fn fail_pending(
        &self,
        payment_id: Uuid,
        kind: FailureKind,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tx = self.store.begin().await?;
        let mut payment = ledger::load_payment(tx.as_mut(), payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Ok(false);
        }
        ledger::fail(&mut payment, kind, reason, now)?;
        count_failure(tx.as_mut(), &payment, now).await?;
        discounts::release_in(tx.as_mut(), &payment).await?;
        tx.update_payment(&mut payment).await?;
        tx.commit().await?;
        tracing::info!(payment_id = %payment_id, kind = ?kind, reason = %reason, "Pending payment failed");
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Offline channel
    // -------------------------------------------------------------------------

    /// Record an offline payment awaiting admin review. Never settles by itself.
    pub async fn submit_offline_payment(
        &self,
        request: OfflinePaymentRequest,
    ) -> BillingResult<Payment> {
        if request.method.channel() != PaymentChannel::Offline {
            return Err(BillingError::InvalidInput(format!(
                "{} payments go through the gateway",
                request.method
            )));
        }
        let proof = request.proof_reference.trim();
        if proof.is_empty() {
            return Err(BillingError::InvalidInput("proof reference is required".to_string()));
        }

        let now = OffsetDateTime::now_utc();
        let mut tx = self.store.begin().await?;

        let entry = match request.context {
            PaymentContext::Subscription => {
                let plan_type = request.plan_type.ok_or_else(|| {
                    BillingError::InvalidPlan("planType is required for subscription payments".into())
                })?;
                let plan = self.catalog.get_plan(plan_type)?;
                if !plan.plan_type.is_paid() {
                    return Err(BillingError::InvalidPlan(format!(
                        "{} plan cannot be purchased",
                        plan.plan_type
                    )));
                }
                let subscription = match request.subscription_id {
                    Some(id) => tx
                        .find_subscription(id)
                        .await?
                        .filter(|s| s.tenant_id == request.tenant_id)
                        .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", id)))?,
                    None => tx
                        .find_open_subscription(request.tenant_id)
                        .await?
                        .ok_or(BillingError::MissingContextReference(PaymentContext::Subscription))?,
                };
                NewPayment::for_subscription(
                    request.tenant_id,
                    subscription.id,
                    plan.plan_type,
                    plan.base_price,
                    &plan.currency,
                    request.method,
                )
            }
            PaymentContext::Pos | PaymentContext::Debt => {
                let amount = request.amount.filter(|a| *a > 0).ok_or_else(|| {
                    BillingError::InvalidInput("a positive amount is required".to_string())
                })?;
                NewPayment {
                    tenant_id: request.tenant_id,
                    context: request.context,
                    subscription_id: None,
                    pos_order_id: request.pos_order_id,
                    debt_id: request.debt_id,
                    plan_type: None,
                    gross_amount: amount,
                    discount: None,
                    amount,
                    currency: self.config.plan_currency.clone(),
                    method: request.method,
                    payer_phone: None,
                    proof_reference: None,
                }
            }
        };
        let entry = NewPayment {
            proof_reference: Some(proof.to_string()),
            ..entry
        };

        let payment =
            record_pending(tx.as_mut(), entry, request.discount_code.as_deref(), now).await?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment.id,
            method = %payment.method,
            proof_reference = %proof,
            "Offline payment submitted for verification"
        );
        Ok(payment)
    }

    /// Admin decision on an offline proof
    pub async fn verify_offline_payment(
        &self,
        payment_id: Uuid,
        decision: VerificationDecision,
        notes: Option<String>,
        notify_tenant: bool,
        actor: Actor,
    ) -> BillingResult<Settlement> {
        if !actor.is_admin() {
            return Err(BillingError::Forbidden(
                "only administrators may verify payments".to_string(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let mut tx = self.store.begin().await?;
        let mut payment = ledger::load_payment(tx.as_mut(), payment_id).await?;
        if payment.channel != PaymentChannel::Offline {
            return Err(BillingError::InvalidInput(format!(
                "payment {} is not an offline payment",
                payment_id
            )));
        }

        let outcome = match decision {
            VerificationDecision::Approved => VerificationOutcome::Approved,
            VerificationDecision::Rejected => VerificationOutcome::Rejected,
        };
        let attempt = VerificationAttempt {
            at: now,
            actor_id: Some(actor.id),
            outcome,
            notes: notes.clone(),
        };

        match decision {
            VerificationDecision::Approved => {
                if payment.status.is_settled() {
                    return self.finish_settlement(tx, payment, Some(actor.id), now).await;
                }
                ledger::add_verification_attempt(&mut payment, attempt);
                self.finish_settlement(tx, payment, Some(actor.id), now).await
            }
            VerificationDecision::Rejected => {
                ledger::add_verification_attempt(&mut payment, attempt);
                let reason = notes
                    .clone()
                    .unwrap_or_else(|| "proof rejected".to_string());
                ledger::fail(&mut payment, FailureKind::Rejected, reason, now)?;
                discounts::release_in(tx.as_mut(), &payment).await?;
                tx.update_payment(&mut payment).await?;
                tx.commit().await?;

                tracing::info!(
                    payment_id = %payment_id,
                    actor_id = %actor.id,
                    "Offline payment rejected"
                );
                if self
                    .config
                    .rejected_payment_notification
                    .should_notify(notify_tenant)
                {
                    notifications::deliver(
                        self.notifier.as_ref(),
                        Notification::PaymentRejected {
                            tenant_id: payment.tenant_id,
                            payment_id,
                            notes,
                        },
                    )
                    .await;
                }
                Ok(Settlement {
                    payment,
                    subscription: None,
                    outcome: SettlementOutcome::Failed,
                })
            }
        }
    }

    // -------------------------------------------------------------------------
    // Settlement
    // -------------------------------------------------------------------------

    /// Confirm a payment and apply it to its subscription. Idempotent.
    pub async fn confirm_payment(
        &self,
        payment_id: Uuid,
        actor: Option<Actor>,
    ) -> BillingResult<Settlement> {
        if actor.is_some_and(|a| !a.is_admin()) {
            return Err(BillingError::Forbidden(
                "only administrators may confirm payments".to_string(),
            ));
        }
        self.settle(payment_id, actor.map(|a| a.id), OffsetDateTime::now_utc())
            .await
    }

    async fn settle(
        &self,
        payment_id: Uuid,
        actor_id: Option<Uuid>,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement> {
        let mut tx = self.store.begin().await?;
        let payment = ledger::load_payment(tx.as_mut(), payment_id).await?;
        self.finish_settlement(tx, payment, actor_id, now).await
    }

    async fn finish_settlement(
        &self,
        mut tx: Box<dyn StoreTx>,
        mut payment: Payment,
        actor_id: Option<Uuid>,
        now: OffsetDateTime,
    ) -> BillingResult<Settlement> {
        let (outcome, subscription) = self
            .settle_in(tx.as_mut(), &mut payment, actor_id, now)
            .await?;
        if outcome == ConfirmOutcome::AlreadyConfirmed {
            return Ok(Settlement {
                payment,
                subscription: None,
                outcome: SettlementOutcome::AlreadyConfirmed,
            });
        }
        tx.commit().await?;
        self.after_confirmation(&payment).await;
        Ok(Settlement {
            payment,
            subscription,
            outcome: SettlementOutcome::Confirmed,
        })
    }

    /// Confirm `payment` and transition its subscription inside `tx`.
    /// Writes nothing when the payment was already settled.
    async fn settle_in(
        &self,
        tx: &mut dyn StoreTx,
        payment: &mut Payment,
        actor_id: Option<Uuid>,
        now: OffsetDateTime,
    ) -> BillingResult<(ConfirmOutcome, Option<Subscription>)> {
        let released = payment.status == PaymentStatus::Failed;
        let outcome = ledger::confirm(payment, actor_id, now)?;
        if outcome == ConfirmOutcome::AlreadyConfirmed {
            tracing::info!(payment_id = %payment.id, "Payment already confirmed");
            return Ok((outcome, None));
        }
        if released {
            discounts::reclaim_in(tx, payment, now).await?;
        }

        let subscription = match payment.context {
            PaymentContext::Subscription => {
                let subscription_id = payment
                    .subscription_id
                    .ok_or(BillingError::MissingContextReference(PaymentContext::Subscription))?;
                let mut subscription = tx.find_subscription(subscription_id).await?.ok_or_else(
                    || BillingError::NotFound(format!("Subscription {}", subscription_id)),
                )?;
                let plan_type = payment.plan_type.unwrap_or(subscription.plan.plan_type);
                let plan = self.catalog.get_plan(plan_type)?;
                subscriptions::activate(&mut subscription, payment, plan, now)?;
                tx.update_subscription(&mut subscription).await?;
                Some(subscription)
            }
            PaymentContext::Pos | PaymentContext::Debt => None,
        };
        tx.update_payment(payment).await?;

        tracing::info!(
            payment_id = %payment.id,
            tenant_id = %payment.tenant_id,
            amount = payment.amount,
            channel = %payment.channel,
            subscription_id = ?payment.subscription_id,
            "Payment settled"
        );
        Ok((outcome, subscription))
    }

    async fn after_confirmation(&self, payment: &Payment) {
        notifications::deliver(
            self.notifier.as_ref(),
            Notification::PaymentConfirmed {
                tenant_id: payment.tenant_id,
                payment_id: payment.id,
                amount: payment.amount,
                currency: payment.currency.clone(),
            },
        )
        .await;
    }

    // -------------------------------------------------------------------------
    // Administrative operations
    // -------------------------------------------------------------------------

    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        request: CancelRequest,
        actor: Actor,
    ) -> BillingResult<Subscription> {
        self.authorize_for_subscription(subscription_id, &actor)
            .await?;
        let now = OffsetDateTime::now_utc();
        let note = request
            .reason
            .unwrap_or_else(|| "canceled on request".to_string());

        let mut tx = self.store.begin().await?;
        let mut subscription = load_subscription(tx.as_mut(), subscription_id).await?;
        subscriptions::cancel(
            &mut subscription,
            request.immediate,
            &Cause::actor(Some(actor.id), note),
            now,
        )?;
        tx.update_subscription(&mut subscription).await?;
        tx.commit().await?;
        Ok(subscription)
    }

    pub async fn extend_subscription(
        &self,
        subscription_id: Uuid,
        days: i64,
        note: Option<String>,
        actor: Actor,
    ) -> BillingResult<Subscription> {
        require_admin(&actor, "extend subscriptions")?;
        let now = OffsetDateTime::now_utc();
        let note = note.unwrap_or_else(|| format!("extended by {} days", days));

        let mut tx = self.store.begin().await?;
        let mut subscription = load_subscription(tx.as_mut(), subscription_id).await?;
        subscriptions::extend(&mut subscription, days, &Cause::actor(Some(actor.id), note), now)?;
        tx.update_subscription(&mut subscription).await?;
        tx.commit().await?;
        Ok(subscription)
    }

    /// Move an active subscription onto another plan without a payment.
    ///
    /// Trial, pending and expired subscriptions only become active through a
    /// confirmed payment, so they are refused here.
    pub async fn change_plan(
        &self,
        subscription_id: Uuid,
        plan_type: PlanType,
        actor: Actor,
    ) -> BillingResult<Subscription> {
        require_admin(&actor, "change plans without payment")?;
        let plan = self.catalog.get_plan(plan_type)?;
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let mut subscription = load_subscription(tx.as_mut(), subscription_id).await?;
        if subscription.status != SubscriptionStatus::Active {
            return Err(BillingError::invalid_transition(
                "subscription",
                subscription.status,
                SubscriptionStatus::Active,
            ));
        }
        let cause = Cause::actor(Some(actor.id), format!("plan changed to {}", plan_type));
        subscriptions::change_plan(&mut subscription, plan, &cause, now)?;
        tx.update_subscription(&mut subscription).await?;
        tx.commit().await?;
        Ok(subscription)
    }

    /// Record a refund. Subscription state is untouched.
    pub async fn refund_payment(
        &self,
        payment_id: Uuid,
        request: RefundRequest,
        actor: Actor,
    ) -> BillingResult<Payment> {
        require_admin(&actor, "refund payments")?;
        let now = OffsetDateTime::now_utc();

        let mut tx = self.store.begin().await?;
        let mut payment = ledger::load_payment(tx.as_mut(), payment_id).await?;
        let status = ledger::record_refund(&mut payment, request, Some(actor.id), now)?;
        tx.update_payment(&mut payment).await?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment_id,
            status = %status,
            refunded = payment.refunded_total(),
            actor_id = %actor.id,
            "Refund recorded"
        );
        Ok(payment)
    }

    /// Admins may act on any subscription; owners only on their own tenant's
    async fn authorize_for_subscription(
        &self,
        subscription_id: Uuid,
        actor: &Actor,
    ) -> BillingResult<()> {
        if actor.is_admin() {
            return Ok(());
        }
        let subscription = self
            .store
            .find_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription_id)))?;
        let tenant = self.store.find_tenant(subscription.tenant_id).await?;
        if tenant.is_some_and(|t| t.owner_id == actor.id) {
            Ok(())
        } else {
            Err(BillingError::Forbidden(
                "not allowed to manage this subscription".to_string(),
            ))
        }
    }
}

fn require_admin(actor: &Actor, what: &str) -> BillingResult<()> {
    if actor.is_admin() {
        Ok(())
    } else {
        Err(BillingError::Forbidden(format!(
            "only administrators may {}",
            what
        )))
    }
}

async fn load_subscription(
    tx: &mut dyn StoreTx,
    subscription_id: Uuid,
) -> BillingResult<Subscription> {
    tx.find_subscription(subscription_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription_id)))
}

/// Build the pending payment, take the discount if one was given, and
/// insert it. The discount usage is recorded against the new payment id.
async fn record_pending(
    tx: &mut dyn StoreTx,
    entry: NewPayment,
    discount_code: Option<&str>,
    now: OffsetDateTime,
) -> BillingResult<Payment> {
    let mut payment = ledger::new_pending(entry, now)?;

    if let Some(code) = discount_code.filter(|c| !c.trim().is_empty()) {
        let details = discounts::apply_in(
            tx,
            code,
            payment.gross_amount,
            payment.context,
            payment.tenant_id,
            Some(payment.id),
            now,
        )
        .await?;
        payment.amount = details.final_amount;
        payment.discount = Some(details.applied());
    }

    tx.insert_payment(&payment).await?;
    tracing::info!(
        payment_id = %payment.id,
        tenant_id = %payment.tenant_id,
        context = %payment.context,
        channel = %payment.channel,
        amount = payment.amount,
        discount = ?payment.discount.as_ref().map(|d| d.code.as_str()),
        "Pending payment recorded"
    );
    Ok(payment)
}

/// Bump the subscription's failed-payment counter for a failed subscription payment
async fn count_failure(
    tx: &mut dyn StoreTx,
    payment: &Payment,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let Some(subscription_id) = payment.subscription_id else {
        return Ok(());
    };
    if let Some(mut subscription) = tx.find_subscription(subscription_id).await? {
        subscriptions::record_failed_payment(&mut subscription, now);
        tx.update_subscription(&mut subscription).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::sign;
    use crate::store::MemoryStore;
    use crate::test_support::{
        sample_discount, seed_discount, RecordingNotifier, StubGateway, StubReply,
    };
    use shopsub_shared::{ActorRole, DiscountType};

    struct Harness {
        store: Arc<MemoryStore>,
        gateway: Arc<StubGateway>,
        notifier: Arc<RecordingNotifier>,
        coordinator: SettlementCoordinator,
    }

    fn harness_with(config: BillingConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = StubGateway::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let coordinator = SettlementCoordinator::new(
            store.clone(),
            gateway.clone(),
            notifier.clone(),
            Arc::new(config.plan_catalog()),
            Arc::new(config),
        );
        Harness {
            store,
            gateway,
            notifier,
            coordinator,
        }
    }

    fn harness() -> Harness {
        harness_with(BillingConfig::for_gateway("http://gateway.test"))
    }

    async fn register(h: &Harness) -> Registration {
        h.coordinator
            .register_tenant(RegisterTenant {
                shop_name: "Duka la Juma".to_string(),
                owner_name: "Juma".to_string(),
                owner_email: format!("{}@example.com", Uuid::new_v4().simple()),
                phone: Some("0712345678".to_string()),
                plan: None,
            })
            .await
            .unwrap()
    }

    fn pay_monthly(tenant_id: Uuid) -> GatewayPaymentRequest {
        GatewayPaymentRequest {
            tenant_id,
            plan_type: PlanType::Monthly,
            phone: "0712345678".to_string(),
            discount_code: None,
        }
    }

    fn callback_body(payment_id: Uuid, code: &str) -> Vec<u8> {
        format!(
            r#"{{"invoiceId":"{}","transactionId":"TX-9","resultCode":"{}","resultDesc":"done"}}"#,
            payment_id, code
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_register_creates_trial() {
        let h = harness();
        let reg = register(&h).await;
        assert_eq!(reg.subscription.status, SubscriptionStatus::Trial);
        assert_eq!(reg.tenant.owner_id, reg.owner.id);

        let stored = h.store.find_open_subscription(reg.tenant.id).await.unwrap();
        assert_eq!(stored.map(|s| s.id), Some(reg.subscription.id));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_email_atomically() {
        let h = harness();
        let first = register(&h).await;
        let err = h
            .coordinator
            .register_tenant(RegisterTenant {
                shop_name: "Second".to_string(),
                owner_name: "Other".to_string(),
                owner_email: first.owner.email.to_uppercase(),
                phone: None,
                plan: Some(PlanType::Monthly),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AccountExists(_)));
        assert!(h
            .store
            .list_subscriptions(&[SubscriptionStatus::Pending])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_gateway_payment_settles_on_callback() {
        let h = harness();
        let reg = register(&h).await;

        let payment = h
            .coordinator
            .initiate_gateway_payment(pay_monthly(reg.tenant.id))
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.integration_status, IntegrationStatus::AwaitingCallback);
        assert_eq!(h.gateway.requests()[0].reference, payment.id);
        assert_eq!(h.gateway.requests()[0].phone, "255712345678");

        let sub = h.store.find_subscription(reg.subscription.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trial);

        let ack = h
            .coordinator
            .handle_gateway_callback(&callback_body(payment.id, "0"), None)
            .await;
        assert_eq!(ack, CallbackAck::new(CallbackOutcome::Settled));

        let sub = h.store.find_subscription(reg.subscription.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.plan.plan_type, PlanType::Monthly);
        assert_eq!(sub.payment.last_payment_id, Some(payment.id));
        assert_eq!(h.notifier.kinds(), vec!["payment_confirmed"]);

        let again = h
            .coordinator
            .handle_gateway_callback(&callback_body(payment.id, "0"), None)
            .await;
        assert_eq!(again.outcome, CallbackOutcome::Duplicate);
        let after = h.store.find_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(after.version, sub.version);
    }

    #[tokio::test]
    async fn test_declined_initiation_fails_payment() {
        let h = harness();
        let reg = register(&h).await;
        h.gateway.push_reply(StubReply::Declined("14"));

        let err = h
            .coordinator
            .initiate_gateway_payment(pay_monthly(reg.tenant.id))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 402);

        let payments = h
            .store
            .list_payments(&PaymentFilter {
                tenant_id: Some(reg.tenant.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].status, PaymentStatus::Failed);
        let sub = h.store.find_subscription(reg.subscription.id).await.unwrap().unwrap();
        assert_eq!(sub.payment.failed_payment_count, 1);
        assert_eq!(sub.status, SubscriptionStatus::Trial);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_allows_late_settlement() {
        let h = harness();
        let reg = register(&h).await;
        h.gateway.push_reply(StubReply::Unreachable);

        let err = h
            .coordinator
            .initiate_gateway_payment(pay_monthly(reg.tenant.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentFailed(_)));

        let payment = h
            .store
            .list_payments(&PaymentFilter::default())
            .await
            .unwrap()
            .remove(0);
        assert!(ledger::is_late_settleable(&payment));

        let ack = h
            .coordinator
            .handle_gateway_callback(&callback_body(payment.id, "0"), None)
            .await;
        assert_eq!(ack.outcome, CallbackOutcome::Settled);
        let payment = h.store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Confirmed);
        assert!(payment.failure.is_none());
    }

    #[tokio::test]
    async fn test_late_settlement_retakes_released_discount() {
        let h = harness();
        let reg = register(&h).await;
        seed_discount(&h.store, sample_discount("KARIBU", DiscountType::Fixed, 5_000)).await;
        h.gateway.push_reply(StubReply::Unreachable);

        let request = GatewayPaymentRequest {
            discount_code: Some("KARIBU".to_string()),
            ..pay_monthly(reg.tenant.id)
        };
        h.coordinator
            .initiate_gateway_payment(request)
            .await
            .unwrap_err();
        let released = h.store.find_discount_by_code("KARIBU").await.unwrap().unwrap();
        assert_eq!(released.usage_count, 0);

        let payment = h
            .store
            .list_payments(&PaymentFilter::default())
            .await
            .unwrap()
            .remove(0);
        h.coordinator
            .handle_gateway_callback(&callback_body(payment.id, "0"), None)
            .await;

        let settled = h.store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(settled.status, PaymentStatus::Confirmed);
        assert_eq!(settled.amount, 20_000);
        let retaken = h.store.find_discount_by_code("KARIBU").await.unwrap().unwrap();
        assert_eq!(retaken.usage_count, 1);
        assert_eq!(
            h.store
                .count_discount_usage(retaken.id, reg.tenant.id)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_failure_callback_leaves_subscription() {
        let h = harness();
        let reg = register(&h).await;
        let payment = h
            .coordinator
            .initiate_gateway_payment(pay_monthly(reg.tenant.id))
            .await
            .unwrap();

        let ack = h
            .coordinator
            .handle_gateway_callback(&callback_body(payment.id, "1032"), None)
            .await;
        assert_eq!(ack.outcome, CallbackOutcome::Failed);

        let payment = h.store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
        let sub = h.store.find_subscription(reg.subscription.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert_eq!(sub.payment.failed_payment_count, 1);
    }

    #[tokio::test]
    async fn test_signed_callbacks() {
        let mut config = BillingConfig::for_gateway("http://gateway.test");
        config.gateway.callback_secret = Some("hush".to_string());
        let h = harness_with(config);
        let reg = register(&h).await;
        let payment = h
            .coordinator
            .initiate_gateway_payment(pay_monthly(reg.tenant.id))
            .await
            .unwrap();
        let body = callback_body(payment.id, "0");

        let unsigned = h.coordinator.handle_gateway_callback(&body, None).await;
        assert_eq!(unsigned.outcome, CallbackOutcome::InvalidSignature);
        let forged = h
            .coordinator
            .handle_gateway_callback(&body, Some("deadbeef"))
            .await;
        assert_eq!(forged.outcome, CallbackOutcome::InvalidSignature);

        let sig = sign("hush", &body).unwrap();
        let ok = h.coordinator.handle_gateway_callback(&body, Some(&sig)).await;
        assert_eq!(ok.outcome, CallbackOutcome::Settled);
    }

    #[tokio::test]
    async fn test_malformed_callback_is_acknowledged() {
        let h = harness();
        let ack = h.coordinator.handle_gateway_callback(b"not json", None).await;
        assert!(ack.acknowledged);
        assert_eq!(ack.outcome, CallbackOutcome::Malformed);
    }

    #[tokio::test]
    async fn test_full_discount_settles_without_gateway() {
        let h = harness();
        let reg = register(&h).await;
        seed_discount(&h.store, sample_discount("FREE", DiscountType::Percentage, 100)).await;

        let payment = h
            .coordinator
            .initiate_gateway_payment(GatewayPaymentRequest {
                discount_code: Some("free".to_string()),
                ..pay_monthly(reg.tenant.id)
            })
            .await
            .unwrap();

        assert_eq!(payment.status, PaymentStatus::Confirmed);
        assert_eq!(payment.amount, 0);
        assert!(h.gateway.requests().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_phone_creates_nothing() {
        let h = harness();
        let reg = register(&h).await;
        let err = h
            .coordinator
            .initiate_gateway_payment(GatewayPaymentRequest {
                phone: "call me".to_string(),
                ..pay_monthly(reg.tenant.id)
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(h
            .store
            .list_payments(&PaymentFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_offline_approval_activates() {
        let h = harness();
        let reg = register(&h).await;
        let admin = Actor::admin(Uuid::new_v4());

        let payment = h
            .coordinator
            .submit_offline_payment(OfflinePaymentRequest {
                tenant_id: reg.tenant.id,
                context: PaymentContext::Subscription,
                subscription_id: None,
                pos_order_id: None,
                debt_id: None,
                plan_type: Some(PlanType::Yearly),
                amount: None,
                method: PaymentMethod::BankTransfer,
                proof_reference: "receipts/abc.jpg".to_string(),
                discount_code: None,
            })
            .await
            .unwrap();
        assert_eq!(payment.integration_status, IntegrationStatus::NotApplicable);
        assert_eq!(payment.amount, 250_000);

        let owner = Actor {
            id: reg.owner.id,
            role: ActorRole::Owner,
        };
        let err = h
            .coordinator
            .verify_offline_payment(payment.id, VerificationDecision::Approved, None, false, owner)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        let settlement = h
            .coordinator
            .verify_offline_payment(payment.id, VerificationDecision::Approved, None, false, admin)
            .await
            .unwrap();
        assert_eq!(settlement.outcome, SettlementOutcome::Confirmed);
        assert_eq!(settlement.payment.verification_attempts.len(), 1);
        assert_eq!(
            settlement.payment.confirmation.as_ref().unwrap().confirmed_by,
            Some(admin.id)
        );
        let sub = settlement.subscription.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.plan.plan_type, PlanType::Yearly);

        let again = h
            .coordinator
            .verify_offline_payment(payment.id, VerificationDecision::Approved, None, false, admin)
            .await
            .unwrap();
        assert_eq!(again.outcome, SettlementOutcome::AlreadyConfirmed);
    }

    #[tokio::test]
    async fn test_gateway_method_rejected_for_offline_submission() {
        let h = harness();
        let reg = register(&h).await;
        let err = h
            .coordinator
            .submit_offline_payment(OfflinePaymentRequest {
                tenant_id: reg.tenant.id,
                context: PaymentContext::Pos,
                subscription_id: None,
                pos_order_id: Some("ORD-1".to_string()),
                debt_id: None,
                plan_type: None,
                amount: Some(5_000),
                method: PaymentMethod::MobileMoney,
                proof_reference: "x".to_string(),
                discount_code: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_refund_keeps_subscription() {
        let h = harness();
        let reg = register(&h).await;
        let admin = Actor::admin(Uuid::new_v4());
        let payment = h
            .coordinator
            .initiate_gateway_payment(pay_monthly(reg.tenant.id))
            .await
            .unwrap();
        h.coordinator.confirm_payment(payment.id, None).await.unwrap();

        let refunded = h
            .coordinator
            .refund_payment(
                payment.id,
                RefundRequest {
                    amount: 5_000,
                    reason: "overcharged".to_string(),
                    reference: None,
                },
                admin,
            )
            .await
            .unwrap();
        assert_eq!(refunded.status, PaymentStatus::PartiallyRefunded);
        let sub = h.store.find_subscription(reg.subscription.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_owner_may_cancel_but_not_extend() {
        let h = harness();
        let reg = register(&h).await;
        let owner = Actor {
            id: reg.owner.id,
            role: ActorRole::Owner,
        };
        let stranger = Actor {
            id: Uuid::new_v4(),
            role: ActorRole::Owner,
        };

        let err = h
            .coordinator
            .extend_subscription(reg.subscription.id, 5, None, owner)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        let err = h
            .coordinator
            .cancel_subscription(
                reg.subscription.id,
                CancelRequest {
                    immediate: true,
                    reason: None,
                },
                stranger,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);

        let sub = h
            .coordinator
            .cancel_subscription(
                reg.subscription.id,
                CancelRequest {
                    immediate: true,
                    reason: Some("closing shop".to_string()),
                },
                owner,
            )
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert_eq!(sub.history.last().unwrap().actor_id, Some(owner.id));
    }

    #[tokio::test]
    async fn test_admin_change_plan_needs_active_subscription() {
        let h = harness();
        let reg = register(&h).await;
        let err = h
            .coordinator
            .change_plan(reg.subscription.id, PlanType::Monthly, Actor::admin(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidStateTransition { .. }));
        assert_eq!(err.status_code(), 409);

        let sub = h.store.find_subscription(reg.subscription.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert_eq!(sub.history.len(), reg.subscription.history.len());
        let payments = h.store.list_payments(&PaymentFilter::default()).await.unwrap();
        assert!(payments.is_empty());
    }

    #[tokio::test]
    async fn test_admin_change_plan_on_active_prorates() {
        let h = harness();
        let reg = register(&h).await;
        let payment = h
            .coordinator
            .initiate_gateway_payment(pay_monthly(reg.tenant.id))
            .await
            .unwrap();
        h.coordinator
            .handle_gateway_callback(&callback_body(payment.id, "0"), None)
            .await;
        let monthly = h.store.find_subscription(reg.subscription.id).await.unwrap().unwrap();
        assert_eq!(monthly.status, SubscriptionStatus::Active);

        let admin = Actor::admin(Uuid::new_v4());
        let yearly = h
            .coordinator
            .change_plan(monthly.id, PlanType::Yearly, admin)
            .await
            .unwrap();
        assert_eq!(yearly.status, SubscriptionStatus::Active);
        assert_eq!(yearly.plan.plan_type, PlanType::Yearly);
        assert!(yearly.dates.end_date.unwrap() > monthly.dates.end_date.unwrap());
        let last = yearly.history.last().unwrap();
        assert_eq!(last.actor_id, Some(admin.id));
        assert_eq!(last.payment_id, None);
    }

    #[tokio::test]
    async fn test_reconcile_settles_and_abandons() {
        let h = harness();
        let first = register(&h).await;
        let second = register(&h).await;
        let settled = h
            .coordinator
            .initiate_gateway_payment(pay_monthly(first.tenant.id))
            .await
            .unwrap();
        let lost = h
            .coordinator
            .initiate_gateway_payment(pay_monthly(second.tenant.id))
            .await
            .unwrap();
        h.gateway.set_status(
            settled.id,
            GatewayStatus::Settled {
                transaction_id: Some("TX-LATE".to_string()),
            },
        );
        h.gateway.set_status(lost.id, GatewayStatus::Unknown);

        let early = h
            .coordinator
            .reconcile_pending_payments(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(early.examined, 0);

        let later = OffsetDateTime::now_utc() + time::Duration::hours(1);
        let report = h.coordinator.reconcile_pending_payments(later).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.updated, 2);
        assert_eq!(h.gateway.status_queries(), 2);

        let settled = h.store.find_payment(settled.id).await.unwrap().unwrap();
        assert_eq!(settled.status, PaymentStatus::Confirmed);
        assert_eq!(
            settled.gateway.unwrap().transaction_id.as_deref(),
            Some("TX-LATE")
        );
        let lost = h.store.find_payment(lost.id).await.unwrap().unwrap();
        assert_eq!(lost.failure.unwrap().kind, FailureKind::Abandoned);

        let rerun = h.coordinator.reconcile_pending_payments(later).await.unwrap();
        assert_eq!(rerun.examined, 0);
    }
}
