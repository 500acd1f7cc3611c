//! Billing Invariants Module
//!
//! Runnable consistency checks over the stored documents. They only read,
//! so they are safe to run against production after a replay or an incident.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shopsub_shared::{PaymentStatus, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{DiscountCode, Payment, PaymentFilter, Subscription};
use crate::store::BillingStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Tenant(s) affected; empty for global documents such as discount codes
    pub tenant_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Tenant may be charged or entitled incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const CHECKS_RUN: usize = 5;

#[derive(Clone)]
pub struct InvariantChecker {
    store: Arc<dyn BillingStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self, now: OffsetDateTime) -> BillingResult<InvariantCheckSummary> {
        let subscriptions = self
            .store
            .list_subscriptions(&[
                SubscriptionStatus::Trial,
                SubscriptionStatus::Pending,
                SubscriptionStatus::Active,
                SubscriptionStatus::Expired,
                SubscriptionStatus::Canceled,
            ])
            .await?;
        let payments = self.store.list_payments(&PaymentFilter::default()).await?;
        let discounts = self.store.list_discounts(true).await?;

        let mut violations = Vec::new();
        violations.extend(check_single_open_subscription(&subscriptions));
        violations.extend(check_active_has_future_end(&subscriptions, now));
        violations.extend(check_discount_usage_within_limit(&discounts));
        violations.extend(check_confirmed_payments_have_confirmation(&payments));
        violations.extend(check_history_matches_status(&subscriptions));

        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        let summary = InvariantCheckSummary {
            checked_at: now,
            checks_run: CHECKS_RUN,
            checks_passed: CHECKS_RUN - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        };

        if summary.healthy {
            tracing::info!(checks_run = CHECKS_RUN, "Billing invariants hold");
        } else {
            for v in &summary.violations {
                tracing::error!(
                    invariant = %v.invariant,
                    severity = %v.severity,
                    tenant_ids = ?v.tenant_ids,
                    "{}",
                    v.description
                );
            }
        }
        Ok(summary)
    }
}

/// Invariant 1: at most one non-terminal subscription per tenant
fn check_single_open_subscription(subscriptions: &[Subscription]) -> Vec<InvariantViolation> {
    let mut open: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for sub in subscriptions.iter().filter(|s| !s.status.is_terminal()) {
        open.entry(sub.tenant_id).or_default().push(sub.id);
    }

    open.into_iter()
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(tenant_id, ids)| InvariantViolation {
            invariant: "single_open_subscription".to_string(),
            tenant_ids: vec![tenant_id],
            description: format!(
                "Tenant has {} open subscriptions (expected at most 1)",
                ids.len()
            ),
            context: serde_json::json!({ "subscription_ids": ids }),
            severity: ViolationSeverity::Critical,
        })
        .collect()
}

/// Invariant 2: `active` implies an end date in the future
///
/// A lapse shorter than one sweep interval is normal; anything found here
/// means the expiry sweep is not running or keeps failing.
fn check_active_has_future_end(
    subscriptions: &[Subscription],
    now: OffsetDateTime,
) -> Vec<InvariantViolation> {
    subscriptions
        .iter()
        .filter(|s| s.status == SubscriptionStatus::Active)
        .filter(|s| !s.dates.end_date.is_some_and(|end| end > now))
        .map(|s| InvariantViolation {
            invariant: "active_has_future_end".to_string(),
            tenant_ids: vec![s.tenant_id],
            description: format!("Active subscription {} is past its end date", s.id),
            context: serde_json::json!({
                "subscription_id": s.id,
                "end_date": s.dates.end_date.map(|d| d.to_string()),
            }),
            severity: ViolationSeverity::High,
        })
        .collect()
}

/// Invariant 3: `usage_count <= usage_limit`
fn check_discount_usage_within_limit(discounts: &[DiscountCode]) -> Vec<InvariantViolation> {
    discounts
        .iter()
        .filter_map(|d| {
            let limit = d.usage_limit?;
            (d.usage_count > limit).then(|| InvariantViolation {
                invariant: "discount_usage_within_limit".to_string(),
                tenant_ids: d.shop_id.into_iter().collect(),
                description: format!(
                    "Discount {} used {} times, limit is {}",
                    d.code, d.usage_count, limit
                ),
                context: serde_json::json!({
                    "discount_id": d.id,
                    "usage_count": d.usage_count,
                    "usage_limit": limit,
                }),
                severity: ViolationSeverity::Critical,
            })
        })
        .collect()
}

/// Invariant 4: settled payments record who confirmed them and when
fn check_confirmed_payments_have_confirmation(payments: &[Payment]) -> Vec<InvariantViolation> {
    payments
        .iter()
        .filter(|p| {
            matches!(
                p.status,
                PaymentStatus::Confirmed | PaymentStatus::Refunded | PaymentStatus::PartiallyRefunded
            )
        })
        .filter(|p| p.confirmation.is_none())
        .map(|p| InvariantViolation {
            invariant: "confirmed_payment_has_confirmation".to_string(),
            tenant_ids: vec![p.tenant_id],
            description: format!("Payment {} is {} without confirmation metadata", p.id, p.status),
            context: serde_json::json!({ "payment_id": p.id, "status": p.status }),
            severity: ViolationSeverity::High,
        })
        .collect()
}

/// Invariant 5: the last history entry agrees with the current status
fn check_history_matches_status(subscriptions: &[Subscription]) -> Vec<InvariantViolation> {
    subscriptions
        .iter()
        .filter(|s| s.history.last().map(|h| h.to_status) != Some(s.status))
        .map(|s| InvariantViolation {
            invariant: "history_matches_status".to_string(),
            tenant_ids: vec![s.tenant_id],
            description: format!(
                "Subscription {} is {} but its history ends at {:?}",
                s.id,
                s.status,
                s.history.last().map(|h| h.to_status)
            ),
            context: serde_json::json!({
                "subscription_id": s.id,
                "history_len": s.history.len(),
            }),
            severity: ViolationSeverity::Medium,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::{sample_discount, sample_subscription, seed_discount, seed_subscription};
    use shopsub_shared::DiscountType;
    use time::Duration;

    #[tokio::test]
    async fn test_clean_store_is_healthy() {
        let store = Arc::new(MemoryStore::new());
        seed_subscription(&store, &sample_subscription(Uuid::new_v4())).await;
        seed_discount(&store, sample_discount("WELCOME", DiscountType::Fixed, 1_000)).await;

        let summary = InvariantChecker::new(store)
            .run_all_checks(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, CHECKS_RUN);
    }

    #[test]
    fn test_two_open_subscriptions_flagged() {
        let tenant = Uuid::new_v4();
        let subs = vec![sample_subscription(tenant), sample_subscription(tenant)];
        let violations = check_single_open_subscription(&subs);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::Critical);
        assert_eq!(violations[0].tenant_ids, vec![tenant]);
    }

    #[test]
    fn test_lapsed_active_flagged() {
        let mut sub = sample_subscription(Uuid::new_v4());
        sub.status = SubscriptionStatus::Active;
        let now = OffsetDateTime::now_utc();
        sub.dates.end_date = Some(now - Duration::hours(1));
        assert_eq!(check_active_has_future_end(&[sub.clone()], now).len(), 1);

        sub.dates.end_date = Some(now + Duration::days(1));
        assert!(check_active_has_future_end(&[sub], now).is_empty());
    }

    #[test]
    fn test_discount_over_limit_flagged() {
        let mut d = sample_discount("LIMITED", DiscountType::Percentage, 10);
        d.usage_limit = Some(2);
        d.usage_count = 2;
        assert!(check_discount_usage_within_limit(&[d.clone()]).is_empty());
        d.usage_count = 3;
        assert_eq!(check_discount_usage_within_limit(&[d]).len(), 1);
    }

    #[test]
    fn test_status_without_history_flagged() {
        let mut sub = sample_subscription(Uuid::new_v4());
        assert!(check_history_matches_status(&[sub.clone()]).is_empty());
        sub.status = SubscriptionStatus::Expired;
        assert_eq!(check_history_matches_status(&[sub]).len(), 1);
    }
}
