//! Tenant notifications
//!
//! Delivery (SMS, email) lives outside the engine behind `Notifier`. A failed
//! notification is logged and never fails the operation that raised it.

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    TrialEnding {
        tenant_id: Uuid,
        tenant_name: Option<String>,
        subscription_id: Uuid,
        #[serde(with = "time::serde::rfc3339")]
        ends_at: OffsetDateTime,
        days_left: i64,
    },
    ExpiryReminder {
        tenant_id: Uuid,
        tenant_name: Option<String>,
        subscription_id: Uuid,
        #[serde(with = "time::serde::rfc3339")]
        ends_at: OffsetDateTime,
        days_left: i64,
    },
    SubscriptionExpired {
        tenant_id: Uuid,
        subscription_id: Uuid,
    },
    PaymentConfirmed {
        tenant_id: Uuid,
        payment_id: Uuid,
        amount: i64,
        currency: String,
    },
    PaymentRejected {
        tenant_id: Uuid,
        payment_id: Uuid,
        notes: Option<String>,
    },
    AutoRenewInitiated {
        tenant_id: Uuid,
        subscription_id: Uuid,
        payment_id: Uuid,
    },
}

impl Notification {
    pub fn tenant_id(&self) -> Uuid {
        match self {
            Notification::TrialEnding { tenant_id, .. }
            | Notification::ExpiryReminder { tenant_id, .. }
            | Notification::SubscriptionExpired { tenant_id, .. }
            | Notification::PaymentConfirmed { tenant_id, .. }
            | Notification::PaymentRejected { tenant_id, .. }
            | Notification::AutoRenewInitiated { tenant_id, .. } => *tenant_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Notification::TrialEnding { .. } => "trial_ending",
            Notification::ExpiryReminder { .. } => "expiry_reminder",
            Notification::SubscriptionExpired { .. } => "subscription_expired",
            Notification::PaymentConfirmed { .. } => "payment_confirmed",
            Notification::PaymentRejected { .. } => "payment_rejected",
            Notification::AutoRenewInitiated { .. } => "auto_renew_initiated",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Notification delivery failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log. Default when no delivery channel is wired.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            tenant_id = %notification.tenant_id(),
            kind = notification.kind(),
            payload = %serde_json::to_string(notification).unwrap_or_default(),
            "Tenant notification"
        );
        Ok(())
    }
}

/// Send and log failures. Returns whether delivery succeeded.
pub(crate) async fn deliver(notifier: &dyn Notifier, notification: Notification) -> bool {
    match notifier.notify(&notification).await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(
                tenant_id = %notification.tenant_id(),
                kind = notification.kind(),
                error = %e,
                "Failed to send notification"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn notify(&self, _: &Notification) -> Result<(), NotifyError> {
            Err(NotifyError("sms provider down".into()))
        }
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let n = Notification::SubscriptionExpired {
            tenant_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
        };
        assert!(!deliver(&Broken, n.clone()).await);
        assert!(deliver(&LogNotifier, n).await);
    }

    #[test]
    fn test_serialized_event_tag() {
        let n = Notification::PaymentRejected {
            tenant_id: Uuid::nil(),
            payment_id: Uuid::nil(),
            notes: Some("blurry receipt".into()),
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["event"], "payment_rejected");
        assert_eq!(n.kind(), "payment_rejected");
    }
}
