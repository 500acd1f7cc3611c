//! Scheduler-invoked sweeps
//!
//! Every job takes `now` explicitly and is safe to re-run or overlap: each
//! subscription is re-read inside its own transaction and the decision is
//! re-made on the fresh copy, and reminders are recorded per end date before
//! they are sent.

use std::sync::Arc;

use serde::Serialize;
use shopsub_shared::{PaymentChannel, PaymentStatus, SubscriptionStatus};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::cache::TenantNameCache;
use crate::config::LifecycleSettings;
use crate::error::{BillingError, BillingResult};
use crate::models::{Payment, PaymentFilter, Subscription};
use crate::notifications::{self, Notification, Notifier};
use crate::proration;
use crate::settlement::{GatewayPaymentRequest, SettlementCoordinator};
use crate::store::BillingStore;
use crate::subscriptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job: &'static str,
    pub examined: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl JobReport {
    pub fn new(job: &'static str) -> Self {
        Self {
            job,
            examined: 0,
            updated: 0,
            skipped: 0,
            errors: 0,
        }
    }

    fn record(&mut self, result: BillingResult<bool>, subscription_id: Uuid) {
        match result {
            Ok(true) => self.updated += 1,
            Ok(false) => self.skipped += 1,
            // Another run got there first
            Err(BillingError::ConcurrentModification(_)) => self.skipped += 1,
            Err(e) => {
                self.errors += 1;
                tracing::error!(
                    job = self.job,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Job step failed"
                );
            }
        }
    }

    fn log(&self) {
        tracing::info!(
            job = self.job,
            examined = self.examined,
            updated = self.updated,
            skipped = self.skipped,
            errors = self.errors,
            "Job finished"
        );
    }
}

#[derive(Clone)]
pub struct LifecycleJobs {
    store: Arc<dyn BillingStore>,
    coordinator: SettlementCoordinator,
    notifier: Arc<dyn Notifier>,
    names: TenantNameCache,
    settings: LifecycleSettings,
}

impl LifecycleJobs {
    pub fn new(
        store: Arc<dyn BillingStore>,
        coordinator: SettlementCoordinator,
        notifier: Arc<dyn Notifier>,
        names: TenantNameCache,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            coordinator,
            notifier,
            names,
            settings,
        }
    }

    async fn pending_payments(&self, subscription_id: Uuid) -> BillingResult<Vec<Payment>> {
        self.store
            .list_payments(&PaymentFilter {
                status: Some(PaymentStatus::Pending),
                subscription_id: Some(subscription_id),
                ..Default::default()
            })
            .await
    }

    /// Trials past their end go to `pending`, pending past the grace period
    /// and active past their end go to `expired` (or `canceled` when asked).
    pub async fn sweep_expired(&self, now: OffsetDateTime) -> BillingResult<JobReport> {
        let mut report = JobReport::new("sweep_expired");
        let candidates = self
            .store
            .list_subscriptions(&[
                SubscriptionStatus::Trial,
                SubscriptionStatus::Pending,
                SubscriptionStatus::Active,
            ])
            .await?;

        for candidate in candidates {
            report.examined += 1;
            let grace = self.settings.grace_period_days;
            if subscriptions::expiry_target(&candidate, false, grace, now).is_none() {
                report.skipped += 1;
                continue;
            }
            let result = self.expire_one(candidate.id, grace, now).await;
            report.record(result, candidate.id);
        }

        report.log();
        Ok(report)
    }

    async fn expire_one(
        &self,
        subscription_id: Uuid,
        grace_period_days: i64,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let pending = self.pending_payments(subscription_id).await?;

        let mut tx = self.store.begin().await?;
        let Some(mut subscription) = tx.find_subscription(subscription_id).await? else {
            return Ok(false);
        };
        let has_pending = pending
            .iter()
            .any(|p| holds_expiry(p, &subscription, &self.settings, now));
        let Some(target) =
            subscriptions::expiry_target(&subscription, has_pending, grace_period_days, now)
        else {
            return Ok(false);
        };
        subscriptions::expire(&mut subscription, target, now)?;
        tx.update_subscription(&mut subscription).await?;
        tx.commit().await?;

        if target == SubscriptionStatus::Expired {
            notifications::deliver(
                self.notifier.as_ref(),
                Notification::SubscriptionExpired {
                    tenant_id: subscription.tenant_id,
                    subscription_id,
                },
            )
            .await;
        }
        Ok(true)
    }

    pub async fn send_trial_ending_reminders(&self, now: OffsetDateTime) -> BillingResult<JobReport> {
        let mut report = JobReport::new("send_trial_ending_reminders");
        let window = self.settings.trial_reminder_days;
        let trials = self
            .store
            .list_subscriptions(&[SubscriptionStatus::Trial])
            .await?;

        for trial in trials {
            report.examined += 1;
            let Some(ends_at) = trial.dates.trial_ends_at.or(trial.dates.end_date) else {
                report.skipped += 1;
                continue;
            };
            if !due_for_reminder(ends_at, trial.reminders.trial_ending_sent_for, window, now) {
                report.skipped += 1;
                continue;
            }

            let result = self
                .mark_reminder(trial.id, ends_at, ReminderKind::TrialEnding, now)
                .await;
            let sent = matches!(result, Ok(true));
            report.record(result, trial.id);
            if sent {
                let tenant_name = self.tenant_name(trial.tenant_id).await;
                notifications::deliver(
                    self.notifier.as_ref(),
                    Notification::TrialEnding {
                        tenant_id: trial.tenant_id,
                        tenant_name,
                        subscription_id: trial.id,
                        ends_at,
                        days_left: proration::days_remaining(Some(ends_at), now),
                    },
                )
                .await;
            }
        }

        report.log();
        Ok(report)
    }

    pub async fn send_expiry_reminders(&self, now: OffsetDateTime) -> BillingResult<JobReport> {
        let mut report = JobReport::new("send_expiry_reminders");
        let window = self.settings.expiry_reminder_days;
        let active = self
            .store
            .list_subscriptions(&[SubscriptionStatus::Active])
            .await?;

        for sub in active {
            report.examined += 1;
            let Some(ends_at) = sub.dates.end_date else {
                report.skipped += 1;
                continue;
            };
            if !due_for_reminder(ends_at, sub.reminders.expiry_sent_for, window, now) {
                report.skipped += 1;
                continue;
            }

            let result = self
                .mark_reminder(sub.id, ends_at, ReminderKind::Expiry, now)
                .await;
            let sent = matches!(result, Ok(true));
            report.record(result, sub.id);
            if sent {
                let tenant_name = self.tenant_name(sub.tenant_id).await;
                notifications::deliver(
                    self.notifier.as_ref(),
                    Notification::ExpiryReminder {
                        tenant_id: sub.tenant_id,
                        tenant_name,
                        subscription_id: sub.id,
                        ends_at,
                        days_left: proration::days_remaining(Some(ends_at), now),
                    },
                )
                .await;
            }
        }

        report.log();
        Ok(report)
    }

    /// Record that the reminder for `ends_at` went out, or that its renewal
    /// charge was claimed. False if it already had been.
    async fn mark_reminder(
        &self,
        subscription_id: Uuid,
        ends_at: OffsetDateTime,
        kind: ReminderKind,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut tx = self.store.begin().await?;
        let Some(mut subscription) = tx.find_subscription(subscription_id).await? else {
            return Ok(false);
        };
        let slot = match kind {
            ReminderKind::TrialEnding => &mut subscription.reminders.trial_ending_sent_for,
            ReminderKind::Expiry => &mut subscription.reminders.expiry_sent_for,
            ReminderKind::AutoRenew => &mut subscription.reminders.auto_renew_attempted_for,
        };
        if *slot == Some(ends_at) {
            return Ok(false);
        }
        *slot = Some(ends_at);
        subscription.updated_at = now;
        tx.update_subscription(&mut subscription).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Charge the stored mobile-money number shortly before an auto-renewing
    /// subscription ends. At most one attempt per period: the period is
    /// claimed on the locked subscription row before the gateway is called,
    /// so overlapping runs cannot both charge.
    pub async fn process_auto_renewals(&self, now: OffsetDateTime) -> BillingResult<JobReport> {
        let mut report = JobReport::new("process_auto_renewals");
        let lead = Duration::days(self.settings.auto_renew_lead_days);
        let active = self
            .store
            .list_subscriptions(&[SubscriptionStatus::Active])
            .await?;

        for sub in active {
            report.examined += 1;
            let Some(phone) = renewal_phone(&sub, lead, now) else {
                report.skipped += 1;
                continue;
            };
            let Some(ends_at) = sub.dates.end_date else {
                report.skipped += 1;
                continue;
            };
            if sub.reminders.auto_renew_attempted_for == Some(ends_at) {
                report.skipped += 1;
                continue;
            }

            // A payment the tenant started themselves counts as this period's attempt
            let attempted = match self.attempted_since(sub.id, ends_at - lead).await {
                Ok(attempted) => attempted,
                Err(e) => {
                    report.record(Err(e), sub.id);
                    continue;
                }
            };
            if attempted {
                report.skipped += 1;
                continue;
            }
            match self
                .mark_reminder(sub.id, ends_at, ReminderKind::AutoRenew, now)
                .await
            {
                Ok(true) => {}
                result => {
                    report.record(result, sub.id);
                    continue;
                }
            }

            let request = GatewayPaymentRequest {
                tenant_id: sub.tenant_id,
                plan_type: sub.plan.plan_type,
                phone,
                discount_code: None,
            };
            match self
                .coordinator
                .initiate_gateway_payment_at(request, now)
                .await
            {
                Ok(payment) => {
                    report.updated += 1;
                    tracing::info!(
                        subscription_id = %sub.id,
                        payment_id = %payment.id,
                        "Auto-renewal payment initiated"
                    );
                    notifications::deliver(
                        self.notifier.as_ref(),
                        Notification::AutoRenewInitiated {
                            tenant_id: sub.tenant_id,
                            subscription_id: sub.id,
                            payment_id: payment.id,
                        },
                    )
                    .await;
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        subscription_id = %sub.id,
                        error = %e,
                        "Auto-renewal payment failed"
                    );
                }
            }
        }

        report.log();
        Ok(report)
    }

    async fn attempted_since(
        &self,
        subscription_id: Uuid,
        since: OffsetDateTime,
    ) -> BillingResult<bool> {
        let payments = self
            .store
            .list_payments(&PaymentFilter {
                subscription_id: Some(subscription_id),
                ..Default::default()
            })
            .await?;
        Ok(payments.iter().any(|p| p.created_at >= since))
    }

    pub async fn reconcile_pending_payments(&self, now: OffsetDateTime) -> BillingResult<JobReport> {
        self.coordinator.reconcile_pending_payments(now).await
    }

    async fn tenant_name(&self, tenant_id: Uuid) -> Option<String> {
        match self.names.name_of(&self.store, tenant_id).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(tenant_id = %tenant_id, error = %e, "Tenant name lookup failed");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ReminderKind {
    TrialEnding,
    Expiry,
    AutoRenew,
}

/// Inside the reminder window and not yet reminded for this end date
fn due_for_reminder(
    ends_at: OffsetDateTime,
    sent_for: Option<OffsetDateTime>,
    window_days: i64,
    now: OffsetDateTime,
) -> bool {
    now < ends_at && ends_at - now <= Duration::days(window_days) && sent_for != Some(ends_at)
}

/// Whether a pending `payment` still holds back the expiry of `sub`.
///
/// A gateway payment does until reconciliation may query it. An offline proof
/// nobody has reviewed does at most until the grace period after the end date.
fn holds_expiry(
    payment: &Payment,
    sub: &Subscription,
    settings: &LifecycleSettings,
    now: OffsetDateTime,
) -> bool {
    match payment.channel {
        PaymentChannel::Gateway => now - payment.created_at < settings.pending_payment_timeout,
        PaymentChannel::Offline => {
            let ends = sub
                .dates
                .end_date
                .or(sub.dates.trial_ends_at)
                .unwrap_or(sub.created_at);
            now < ends + Duration::days(settings.grace_period_days)
        }
    }
}

/// Phone to charge when `sub` is due for auto-renewal
fn renewal_phone(sub: &Subscription, lead: Duration, now: OffsetDateTime) -> Option<String> {
    if !sub.renewal.auto_renew || sub.renewal.cancel_at_period_end || !sub.plan.plan_type.is_paid()
    {
        return None;
    }
    let ends_at = sub.dates.end_date?;
    if now < ends_at - lead || now >= ends_at {
        return None;
    }
    sub.payment.payer_phone.clone()
}
