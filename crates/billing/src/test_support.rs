//! Fixtures shared by the unit and scenario tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shopsub_shared::{DiscountApplicability, DiscountType, PlanType};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::gateway::{
    GatewayError, GatewayResult, GatewayStatus, InitiateRequest, PaymentGateway, SUCCESS_CODE,
};
use crate::models::{DiscountCode, Subscription, Tenant};
use crate::notifications::{Notification, Notifier, NotifyError};
use crate::plans::PlanCatalog;
use crate::store::{BillingStore, MemoryStore};
use crate::subscriptions;

pub fn sample_tenant() -> Tenant {
    Tenant {
        id: Uuid::new_v4(),
        name: "Mama Ntilie Shop".to_string(),
        owner_id: Uuid::new_v4(),
        phone: Some("0712345678".to_string()),
        created_at: OffsetDateTime::now_utc(),
    }
}

/// Fresh trial subscription for `tenant_id`
pub fn sample_subscription(tenant_id: Uuid) -> Subscription {
    let catalog = PlanCatalog::default();
    let plan = catalog
        .get_plan(PlanType::Trial)
        .expect("trial plan is always in the default catalog");
    subscriptions::new_subscription(tenant_id, plan, OffsetDateTime::now_utc())
}

/// Active global code valid for subscriptions and POS, no limits
pub fn sample_discount(code: &str, discount_type: DiscountType, value: i64) -> DiscountCode {
    let now = OffsetDateTime::now_utc();
    DiscountCode {
        id: Uuid::new_v4(),
        code: code.to_ascii_uppercase(),
        description: None,
        discount_type,
        value,
        minimum_purchase: 0,
        max_discount_amount: None,
        start_date: now - Duration::days(1),
        expiry_date: now + Duration::days(30),
        usage_limit: None,
        per_user_limit: 0,
        usage_count: 0,
        applicable_for: vec![DiscountApplicability::Subscription, DiscountApplicability::Pos],
        shop_id: None,
        is_active: true,
        created_by: None,
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

pub async fn seed_discount(store: &Arc<MemoryStore>, discount: DiscountCode) {
    let mut tx = store.begin().await.unwrap();
    tx.insert_discount(&discount).await.unwrap();
    tx.commit().await.unwrap();
}

pub async fn seed_subscription(store: &Arc<MemoryStore>, subscription: &Subscription) {
    let mut tx = store.begin().await.unwrap();
    tx.insert_subscription(subscription).await.unwrap();
    tx.commit().await.unwrap();
}

/// What the stub answers to the next `initiate`
pub enum StubReply {
    Accepted,
    Declined(&'static str),
    /// Transport failure on every attempt
    Unreachable,
}

/// Scripted gateway. Unscripted initiations are accepted.
#[derive(Default)]
pub struct StubGateway {
    replies: Mutex<VecDeque<StubReply>>,
    statuses: Mutex<HashMap<Uuid, GatewayStatus>>,
    requests: Mutex<Vec<InitiateRequest>>,
    status_queries: AtomicUsize,
}

impl StubGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_reply(&self, reply: StubReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn set_status(&self, reference: Uuid, status: GatewayStatus) {
        self.statuses.lock().unwrap().insert(reference, status);
    }

    pub fn requests(&self) -> Vec<InitiateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn status_queries(&self) -> usize {
        self.status_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn initiate(&self, request: &InitiateRequest) -> Result<GatewayResult, GatewayError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(StubReply::Accepted);

        match reply {
            StubReply::Accepted => Ok(GatewayResult {
                success: true,
                transaction_id: Some(format!("TX-{}", request.reference.simple())),
                response_code: SUCCESS_CODE.to_string(),
                response_message: Some("Request accepted".to_string()),
            }),
            StubReply::Declined(code) => Ok(GatewayResult {
                success: false,
                transaction_id: None,
                response_code: code.to_string(),
                response_message: Some("Insufficient balance".to_string()),
            }),
            StubReply::Unreachable => Err(GatewayError::Transport("connection refused".into())),
        }
    }

    async fn query_status(&self, reference: Uuid) -> Result<GatewayStatus, GatewayError> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(&reference)
            .cloned()
            .unwrap_or(GatewayStatus::Pending))
    }
}

/// Keeps every notification it is asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent().iter().map(|n| n.kind()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
