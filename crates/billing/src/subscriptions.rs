//! Subscription state machine
//!
//! ```text
//! trial   -> pending | canceled
//! pending -> active | expired | canceled
//! active  -> active (renewed) | expired | canceled
//! expired -> active (reactivated) | canceled
//! canceled is terminal
//! ```
//!
//! Functions here mutate a `Subscription` in memory and append history; the
//! settlement coordinator decides when to call them and persists the result.

use std::sync::Arc;

use serde::Serialize;
use shopsub_shared::{PlanType, SubscriptionStatus};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    HistoryEntry, Payment, PaymentSummary, PlanSnapshot, Pricing, ReminderLog, RenewalSettings,
    Subscription, SubscriptionDates,
};
use crate::plans::PlanDefinition;
use crate::proration::{self, Proration};
use crate::store::BillingStore;

/// Upper bound for a single admin extension
pub const MAX_EXTENSION_DAYS: i64 = 3650;

pub fn can_transition(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
    use SubscriptionStatus::*;
    matches!(
        (from, to),
        (Trial, Pending)
            | (Trial, Canceled)
            | (Pending, Active)
            | (Pending, Expired)
            | (Pending, Canceled)
            | (Active, Active)
            | (Active, Expired)
            | (Active, Canceled)
            | (Expired, Active)
            | (Expired, Canceled)
    )
}

/// Who or what caused a change, recorded in history
#[derive(Debug, Clone, Default)]
pub struct Cause {
    pub payment_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub note: String,
}

impl Cause {
    pub fn system(note: impl Into<String>) -> Self {
        Self {
            note: note.into(),
            ..Default::default()
        }
    }

    pub fn actor(actor_id: Option<Uuid>, note: impl Into<String>) -> Self {
        Self {
            actor_id,
            note: note.into(),
            ..Default::default()
        }
    }

    pub fn payment(payment_id: Uuid, note: impl Into<String>) -> Self {
        Self {
            payment_id: Some(payment_id),
            note: note.into(),
            ..Default::default()
        }
    }
}

fn record(sub: &mut Subscription, from: Option<SubscriptionStatus>, cause: &Cause, now: OffsetDateTime) {
    sub.history.push(HistoryEntry {
        at: now,
        from_status: from,
        to_status: sub.status,
        plan_type: sub.plan.plan_type,
        payment_id: cause.payment_id,
        actor_id: cause.actor_id,
        note: cause.note.clone(),
    });
    sub.updated_at = now;
}

fn transition(
    sub: &mut Subscription,
    to: SubscriptionStatus,
    cause: &Cause,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let from = sub.status;
    if !can_transition(from, to) {
        return Err(BillingError::invalid_transition("subscription", from, to));
    }
    sub.status = to;
    record(sub, Some(from), cause, now);

    tracing::info!(
        subscription_id = %sub.id,
        tenant_id = %sub.tenant_id,
        from = %from,
        to = %to,
        note = %cause.note,
        "Subscription transition"
    );
    Ok(())
}

/// Fresh subscription for onboarding: trial plans start in `trial`, paid
/// plans start `pending` until their first payment settles.
pub fn new_subscription(
    tenant_id: Uuid,
    plan: &PlanDefinition,
    now: OffsetDateTime,
) -> Subscription {
    let is_trial = plan.plan_type == PlanType::Trial;
    let end_date = is_trial.then(|| proration::calculate_end_date(PlanType::Trial, now));

    let mut sub = Subscription {
        id: Uuid::new_v4(),
        tenant_id,
        plan: plan.snapshot(),
        status: if is_trial {
            SubscriptionStatus::Trial
        } else {
            SubscriptionStatus::Pending
        },
        pricing: Pricing {
            base_price: plan.base_price,
            discount_amount: 0,
            final_price: plan.base_price,
            currency: plan.currency.clone(),
        },
        dates: SubscriptionDates {
            start_date: now,
            end_date,
            trial_ends_at: end_date,
            canceled_at: None,
        },
        payment: PaymentSummary::default(),
        renewal: RenewalSettings::default(),
        reminders: ReminderLog::default(),
        history: Vec::new(),
        version: 0,
        created_at: now,
        updated_at: now,
    };
    record(&mut sub, None, &Cause::system("subscription created"), now);
    sub
}

/// Move onto `plan`, prorating the current period, and make the
/// subscription active. Trials pass through `pending` first.
pub fn change_plan(
    sub: &mut Subscription,
    plan: &PlanDefinition,
    cause: &Cause,
    now: OffsetDateTime,
) -> BillingResult<Proration> {
    if !plan.plan_type.is_paid() {
        return Err(BillingError::InvalidPlan(format!(
            "cannot move onto the {} plan",
            plan.plan_type
        )));
    }
    if sub.status.is_terminal() {
        return Err(BillingError::invalid_transition(
            "subscription",
            sub.status,
            SubscriptionStatus::Active,
        ));
    }

    let prorated = proration::prorate_on_plan_change(sub, plan.plan_type, now);

    if sub.status == SubscriptionStatus::Trial {
        let converted = Cause {
            note: "trial converted".to_string(),
            ..cause.clone()
        };
        transition(sub, SubscriptionStatus::Pending, &converted, now)?;
    }

    sub.plan = plan.snapshot();
    sub.dates.start_date = now;
    sub.dates.end_date = Some(prorated.end_date);
    sub.dates.canceled_at = None;
    sub.payment.next_payment_date = Some(prorated.end_date);
    sub.renewal.cancel_at_period_end = false;

    transition(sub, SubscriptionStatus::Active, cause, now)?;

    tracing::info!(
        subscription_id = %sub.id,
        plan = %plan.plan_type,
        end_date = %prorated.end_date,
        credited_days = prorated.credited_days,
        bonus_days = prorated.bonus_days,
        "Plan applied"
    );
    Ok(prorated)
}

/// Trial to paid plan. Only valid while the subscription is still a trial.
pub fn upgrade_from_trial(
    sub: &mut Subscription,
    plan: &PlanDefinition,
    cause: &Cause,
    now: OffsetDateTime,
) -> BillingResult<Proration> {
    if sub.status != SubscriptionStatus::Trial {
        return Err(BillingError::invalid_transition(
            "subscription",
            sub.status,
            SubscriptionStatus::Pending,
        ));
    }
    change_plan(sub, plan, cause, now)
}

/// Apply a confirmed subscription payment
pub fn activate(
    sub: &mut Subscription,
    payment: &Payment,
    plan: &PlanDefinition,
    now: OffsetDateTime,
) -> BillingResult<Proration> {
    if payment.subscription_id != Some(sub.id) {
        return Err(BillingError::InvalidInput(format!(
            "payment {} does not belong to subscription {}",
            payment.id, sub.id
        )));
    }

    let note = match sub.status {
        SubscriptionStatus::Active if sub.plan.plan_type == plan.plan_type => "renewed",
        SubscriptionStatus::Active => "plan changed",
        SubscriptionStatus::Expired => "reactivated",
        _ => "activated",
    };
    let cause = Cause::payment(payment.id, note);
    let prorated = if sub.status == SubscriptionStatus::Trial {
        upgrade_from_trial(sub, plan, &cause, now)?
    } else {
        change_plan(sub, plan, &cause, now)?
    };

    sub.pricing = Pricing {
        base_price: plan.base_price,
        discount_amount: payment.gross_amount - payment.amount,
        final_price: payment.amount,
        currency: payment.currency.clone(),
    };
    sub.payment.method = Some(payment.method);
    sub.payment.verified = true;
    sub.payment.last_payment_date = Some(now);
    sub.payment.failed_payment_count = 0;
    sub.payment.last_payment_id = Some(payment.id);
    if let Some(phone) = payment.gateway.as_ref().and_then(|g| g.phone.clone()) {
        sub.payment.payer_phone = Some(phone);
    }
    Ok(prorated)
}

/// Count a failed payment. Status is untouched.
pub fn record_failed_payment(sub: &mut Subscription, now: OffsetDateTime) {
    sub.payment.failed_payment_count += 1;
    sub.updated_at = now;
}

/// Where the expiry sweep should move `sub`, if anywhere.
///
/// `has_pending_payment` holds expiry back while a renewal is in flight.
pub fn expiry_target(
    sub: &Subscription,
    has_pending_payment: bool,
    grace_period_days: i64,
    now: OffsetDateTime,
) -> Option<SubscriptionStatus> {
    if has_pending_payment {
        return None;
    }
    match sub.status {
        SubscriptionStatus::Trial => {
            let ends = sub.dates.trial_ends_at.or(sub.dates.end_date)?;
            (now >= ends).then_some(SubscriptionStatus::Pending)
        }
        SubscriptionStatus::Pending => {
            let ends = sub.dates.end_date.unwrap_or(sub.created_at);
            (now >= ends + Duration::days(grace_period_days)).then_some(SubscriptionStatus::Expired)
        }
        SubscriptionStatus::Active => {
            let ends = sub.dates.end_date?;
            if now < ends {
                None
            } else if sub.renewal.cancel_at_period_end {
                Some(SubscriptionStatus::Canceled)
            } else {
                Some(SubscriptionStatus::Expired)
            }
        }
        SubscriptionStatus::Expired | SubscriptionStatus::Canceled => None,
    }
}

/// Apply the sweep's decision
pub fn expire(
    sub: &mut Subscription,
    to: SubscriptionStatus,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let note = match (sub.status, to) {
        (SubscriptionStatus::Trial, _) => "trial ended, awaiting payment",
        (_, SubscriptionStatus::Canceled) => "canceled at period end",
        (SubscriptionStatus::Pending, _) => "payment not received within grace period",
        _ => "period ended",
    };
    transition(sub, to, &Cause::system(note), now)?;
    if to == SubscriptionStatus::Canceled {
        sub.dates.canceled_at = Some(now);
        sub.renewal.auto_renew = false;
    }
    Ok(())
}

/// Cancel now, or at the end of the paid period for active subscriptions.
/// Returns true when the status changed.
pub fn cancel(
    sub: &mut Subscription,
    immediate: bool,
    cause: &Cause,
    now: OffsetDateTime,
) -> BillingResult<bool> {
    if sub.status.is_terminal() {
        return Err(BillingError::invalid_transition(
            "subscription",
            sub.status,
            SubscriptionStatus::Canceled,
        ));
    }
    sub.renewal.auto_renew = false;

    if !immediate && sub.status == SubscriptionStatus::Active {
        sub.renewal.cancel_at_period_end = true;
        record(sub, Some(sub.status), cause, now);
        tracing::info!(
            subscription_id = %sub.id,
            end_date = ?sub.dates.end_date,
            "Cancellation scheduled at period end"
        );
        return Ok(false);
    }

    transition(sub, SubscriptionStatus::Canceled, cause, now)?;
    sub.dates.canceled_at = Some(now);
    Ok(true)
}

/// Push the end date out by `days` without changing status
pub fn extend(
    sub: &mut Subscription,
    days: i64,
    cause: &Cause,
    now: OffsetDateTime,
) -> BillingResult<OffsetDateTime> {
    if !(1..=MAX_EXTENSION_DAYS).contains(&days) {
        return Err(BillingError::InvalidInput(format!(
            "extension must be between 1 and {} days",
            MAX_EXTENSION_DAYS
        )));
    }
    if sub.status.is_terminal() {
        return Err(BillingError::invalid_transition(
            "subscription",
            sub.status,
            sub.status,
        ));
    }

    let end = sub.dates.end_date.unwrap_or(now) + Duration::days(days);
    sub.dates.end_date = Some(end);
    if sub.status == SubscriptionStatus::Trial {
        sub.dates.trial_ends_at = Some(end);
    }
    if sub.payment.next_payment_date.is_some() {
        sub.payment.next_payment_date = Some(end);
    }
    record(sub, Some(sub.status), cause, now);

    tracing::info!(
        subscription_id = %sub.id,
        days = days,
        end_date = %end,
        "Subscription extended"
    );
    Ok(end)
}

// =============================================================================
// Read model
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub plan: PlanSnapshot,
    pub status: SubscriptionStatus,
    pub pricing: Pricing,
    pub dates: SubscriptionDates,
    pub days_remaining: i64,
    pub percentage_used: f64,
    pub renewal_settings: RenewalSettings,
    pub payment: PaymentSummary,
    pub history: Vec<HistoryEntry>,
}

impl SubscriptionView {
    pub fn at(sub: &Subscription, now: OffsetDateTime) -> Self {
        Self {
            subscription_id: sub.id,
            tenant_id: sub.tenant_id,
            plan: sub.plan.clone(),
            status: sub.status,
            pricing: sub.pricing.clone(),
            dates: sub.dates.clone(),
            days_remaining: proration::subscription_days_remaining(sub, now),
            percentage_used: proration::percentage_used(
                sub.dates.start_date,
                sub.dates.end_date,
                now,
            ),
            renewal_settings: sub.renewal.clone(),
            payment: sub.payment.clone(),
            history: sub.history.clone(),
        }
    }
}

/// Read-side access to subscriptions
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .find_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription_id)))
    }

    pub async fn get_for_tenant(&self, tenant_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .find_open_subscription(tenant_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("No open subscription for tenant {}", tenant_id))
            })
    }

    pub async fn view(&self, subscription_id: Uuid) -> BillingResult<SubscriptionView> {
        let sub = self.get(subscription_id).await?;
        Ok(SubscriptionView::at(&sub, OffsetDateTime::now_utc()))
    }

    pub async fn view_for_tenant(&self, tenant_id: Uuid) -> BillingResult<SubscriptionView> {
        let sub = self.get_for_tenant(tenant_id).await?;
        Ok(SubscriptionView::at(&sub, OffsetDateTime::now_utc()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{self, NewPayment};
    use crate::plans::PlanCatalog;
    use shopsub_shared::PaymentMethod;
    use time::macros::datetime;

    fn catalog() -> PlanCatalog {
        PlanCatalog::default()
    }

    fn trial_at(now: OffsetDateTime) -> Subscription {
        let catalog = catalog();
        new_subscription(Uuid::new_v4(), catalog.get_plan(PlanType::Trial).unwrap(), now)
    }

    fn confirmed_payment(sub: &Subscription, plan: PlanType, now: OffsetDateTime) -> Payment {
        let mut entry = NewPayment::for_subscription(
            sub.tenant_id,
            sub.id,
            plan,
            25_000,
            "TZS",
            PaymentMethod::MobileMoney,
        );
        entry.payer_phone = Some("255712345678".to_string());
        let mut payment = ledger::new_pending(entry, now).unwrap();
        ledger::confirm(&mut payment, None, now).unwrap();
        payment
    }

    #[test]
    fn test_transition_table() {
        use SubscriptionStatus::*;
        assert!(can_transition(Trial, Pending));
        assert!(!can_transition(Trial, Active));
        assert!(can_transition(Active, Active));
        assert!(can_transition(Expired, Active));
        assert!(!can_transition(Expired, Pending));
        for to in SubscriptionStatus::ALL {
            assert!(!can_transition(Canceled, *to));
        }
    }

    #[test]
    fn test_new_trial_and_paid_subscriptions() {
        let now = datetime!(2024-01-01 00:00 UTC);
        let trial = trial_at(now);
        assert_eq!(trial.status, SubscriptionStatus::Trial);
        assert_eq!(trial.dates.end_date, Some(datetime!(2024-01-15 00:00 UTC)));
        assert_eq!(trial.history.len(), 1);
        assert_eq!(trial.history[0].from_status, None);

        let catalog = catalog();
        let paid = new_subscription(Uuid::new_v4(), catalog.get_plan(PlanType::Monthly).unwrap(), now);
        assert_eq!(paid.status, SubscriptionStatus::Pending);
        assert_eq!(paid.dates.end_date, None);
    }

    #[test]
    fn test_upgrade_from_trial_on_day_ten() {
        let start = datetime!(2024-01-01 00:00 UTC);
        let upgrade_at = datetime!(2024-01-11 00:00 UTC);
        let mut sub = trial_at(start);
        let catalog = catalog();

        let p = upgrade_from_trial(
            &mut sub,
            catalog.get_plan(PlanType::Monthly).unwrap(),
            &Cause::system("upgrade"),
            upgrade_at,
        )
        .unwrap();

        assert_eq!(p.credited_days, 4);
        assert_eq!(sub.dates.end_date, Some(upgrade_at + Duration::days(34)));
        assert_eq!(sub.status, SubscriptionStatus::Active);
        let statuses: Vec<_> = sub.history.iter().map(|h| h.to_status).collect();
        assert_eq!(
            statuses,
            vec![
                SubscriptionStatus::Trial,
                SubscriptionStatus::Pending,
                SubscriptionStatus::Active
            ]
        );
    }

    #[test]
    fn test_activate_records_payment_facts() {
        let now = datetime!(2024-02-01 00:00 UTC);
        let mut sub = trial_at(now - Duration::days(20));
        expire(&mut sub, SubscriptionStatus::Pending, now).unwrap();
        let payment = confirmed_payment(&sub, PlanType::Monthly, now);
        let catalog = catalog();

        activate(&mut sub, &payment, catalog.get_plan(PlanType::Monthly).unwrap(), now).unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.dates.end_date, Some(now + Duration::days(30)));
        assert_eq!(sub.payment.last_payment_id, Some(payment.id));
        assert_eq!(sub.payment.payer_phone.as_deref(), Some("255712345678"));
        assert!(sub.payment.verified);
        assert_eq!(sub.history.last().unwrap().payment_id, Some(payment.id));
    }

    #[test]
    fn test_renewal_credits_remaining_days() {
        let now = datetime!(2024-03-01 00:00 UTC);
        let catalog = catalog();
        let monthly = catalog.get_plan(PlanType::Monthly).unwrap();
        let mut sub = trial_at(now - Duration::days(40));
        sub.status = SubscriptionStatus::Pending;
        change_plan(&mut sub, monthly, &Cause::system("seed"), now - Duration::days(25)).unwrap();

        let payment = confirmed_payment(&sub, PlanType::Monthly, now);
        activate(&mut sub, &payment, monthly, now).unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.dates.end_date, Some(now + Duration::days(35)));
        assert_eq!(sub.history.last().unwrap().note, "renewed");
    }

    #[test]
    fn test_activate_rejects_foreign_payment() {
        let now = datetime!(2024-02-01 00:00 UTC);
        let mut sub = trial_at(now);
        let other = trial_at(now);
        let payment = confirmed_payment(&other, PlanType::Monthly, now);
        let catalog = catalog();

        let err = activate(&mut sub, &payment, catalog.get_plan(PlanType::Monthly).unwrap(), now)
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(sub.status, SubscriptionStatus::Trial);
    }

    #[test]
    fn test_expiry_targets() {
        let start = datetime!(2024-01-01 00:00 UTC);
        let mut sub = trial_at(start);
        let after_trial = start + Duration::days(15);

        assert_eq!(expiry_target(&sub, false, 3, start), None);
        assert_eq!(
            expiry_target(&sub, false, 3, after_trial),
            Some(SubscriptionStatus::Pending)
        );
        assert_eq!(expiry_target(&sub, true, 3, after_trial), None);

        expire(&mut sub, SubscriptionStatus::Pending, after_trial).unwrap();
        assert_eq!(expiry_target(&sub, false, 3, after_trial), None);
        assert_eq!(
            expiry_target(&sub, false, 3, start + Duration::days(17)),
            Some(SubscriptionStatus::Expired)
        );
    }

    #[test]
    fn test_cancel_at_period_end_then_sweep() {
        let now = datetime!(2024-04-01 00:00 UTC);
        let catalog = catalog();
        let mut sub = trial_at(now);
        upgrade_from_trial(
            &mut sub,
            catalog.get_plan(PlanType::Monthly).unwrap(),
            &Cause::system("upgrade"),
            now,
        )
        .unwrap();

        let changed = cancel(&mut sub, false, &Cause::actor(None, "customer request"), now).unwrap();
        assert!(!changed);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.renewal.cancel_at_period_end);
        assert!(!sub.renewal.auto_renew);

        let end = sub.dates.end_date.unwrap();
        let target = expiry_target(&sub, false, 3, end).unwrap();
        assert_eq!(target, SubscriptionStatus::Canceled);
        expire(&mut sub, target, end).unwrap();
        assert_eq!(sub.dates.canceled_at, Some(end));
    }

    #[test]
    fn test_immediate_cancel_is_terminal() {
        let now = datetime!(2024-04-01 00:00 UTC);
        let mut sub = trial_at(now);
        assert!(cancel(&mut sub, true, &Cause::system("fraud"), now).unwrap());
        assert_eq!(sub.status, SubscriptionStatus::Canceled);

        let err = cancel(&mut sub, true, &Cause::system("again"), now).unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert!(extend(&mut sub, 5, &Cause::system("x"), now).is_err());
    }

    #[test]
    fn test_extend_twice_adds_thirty_days() {
        let now = datetime!(2024-05-01 00:00 UTC);
        let mut sub = trial_at(now);
        let before = sub.dates.end_date.unwrap();

        extend(&mut sub, 15, &Cause::system("goodwill"), now).unwrap();
        extend(&mut sub, 15, &Cause::system("goodwill"), now).unwrap();

        assert_eq!(sub.dates.end_date, Some(before + Duration::days(30)));
        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert_eq!(sub.dates.trial_ends_at, sub.dates.end_date);
        assert_eq!(sub.history.len(), 3);
    }

    #[test]
    fn test_extend_bounds() {
        let now = datetime!(2024-05-01 00:00 UTC);
        let mut sub = trial_at(now);
        assert!(extend(&mut sub, 0, &Cause::system("x"), now).is_err());
        assert!(extend(&mut sub, MAX_EXTENSION_DAYS + 1, &Cause::system("x"), now).is_err());
    }

    #[test]
    fn test_view_reports_remaining_and_usage() {
        let start = datetime!(2024-01-01 00:00 UTC);
        let sub = trial_at(start);
        let view = SubscriptionView::at(&sub, datetime!(2024-01-08 00:00 UTC));
        assert_eq!(view.days_remaining, 7);
        assert_eq!(view.percentage_used, 50.0);

        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("daysRemaining").is_some());
        assert!(json.get("renewalSettings").is_some());
    }
}
