// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries gateway errors and transition details
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ShopSub Billing Engine
//!
//! Subscription lifecycle for multi-tenant shops paying through a mobile-money
//! gateway or by uploading offline payment proofs.
//!
//! ## Features
//!
//! - **Plan Catalog**: trial, monthly and yearly plans with configurable prices
//! - **Proration**: end dates, remaining days and plan-change credit
//! - **Discounts**: fixed and percentage codes with usage limits and scoping
//! - **Payment Ledger**: pending, confirmed, failed and refunded payments
//! - **Channels**: HTTP gateway with signed callbacks, offline proof review
//! - **State Machine**: trial, pending, active, expired and canceled subscriptions
//! - **Settlement**: ledger and subscription updated in one transaction
//! - **Jobs**: expiry, reminders, auto-renewal and gateway reconciliation sweeps

pub mod cache;
pub mod callback;
pub mod config;
pub mod discounts;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod jobs;
pub mod ledger;
pub mod models;
pub mod notifications;
pub mod plans;
pub mod proration;
pub mod settlement;
pub mod store;
pub mod subscriptions;

#[cfg(test)]
pub(crate) mod test_support;


use std::sync::Arc;

// Cache
pub use cache::TenantNameCache;

// Callback
pub use callback::{CallbackAck, CallbackOutcome, GatewayCallback, SIGNATURE_HEADER};

// Config
pub use config::{
    BillingConfig, CacheSettings, ConfigError, GatewayConfig, LifecycleSettings,
    NotificationPolicy, RetrySettings,
};

// Discounts
pub use discounts::{DiscountDetails, DiscountEngine, DiscountUpdate, NewDiscountCode};

// Error
pub use error::{BillingError, BillingResult, ErrorBody};

// Gateway
pub use gateway::{
    GatewayError, GatewayResult, GatewayStatus, HttpGateway, InitiateRequest, PaymentGateway,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Jobs
pub use jobs::{JobReport, LifecycleJobs};

// Ledger
pub use ledger::{ConfirmOutcome, NewPayment, PaymentLedger, RefundRequest};

// Models
pub use models::{
    Actor, DiscountCode, FailureKind, OwnerAccount, Payment, PaymentFilter, Subscription, Tenant,
};

// Notifications
pub use notifications::{LogNotifier, Notification, Notifier, NotifyError};

// Plans
pub use plans::{PlanCatalog, PlanDefinition};

// Proration
pub use proration::Proration;

// Settlement
pub use settlement::{
    CancelRequest, GatewayPaymentRequest, OfflinePaymentRequest, RegisterTenant, Registration,
    Settlement, SettlementCoordinator, SettlementOutcome,
};

// Store
pub use store::{BillingStore, MemoryStore, PgStore, StoreTx};

// Subscriptions
pub use subscriptions::{SubscriptionService, SubscriptionView};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub config: Arc<BillingConfig>,
    pub catalog: Arc<PlanCatalog>,
    pub discounts: DiscountEngine,
    pub ledger: PaymentLedger,
    pub subscriptions: SubscriptionService,
    pub settlement: SettlementCoordinator,
    pub jobs: LifecycleJobs,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a billing service backed by Postgres and the HTTP gateway
    pub fn from_config(pool: PgPool, config: BillingConfig) -> BillingResult<Self> {
        let gateway = HttpGateway::new(config.gateway.clone())?;
        Ok(Self::new(
            Arc::new(PgStore::new(pool)),
            Arc::new(gateway),
            Arc::new(LogNotifier),
            config,
        ))
    }

    /// Create a billing service over explicit collaborators
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        config: BillingConfig,
    ) -> Self {
        let catalog = Arc::new(config.plan_catalog());
        let names = TenantNameCache::new(&config.cache);
        let lifecycle = config.lifecycle;
        let config = Arc::new(config);

        let settlement = SettlementCoordinator::new(
            store.clone(),
            gateway,
            notifier.clone(),
            catalog.clone(),
            config.clone(),
        );

        Self {
            discounts: DiscountEngine::new(store.clone()),
            ledger: PaymentLedger::new(store.clone()),
            subscriptions: SubscriptionService::new(store.clone()),
            jobs: LifecycleJobs::new(store.clone(), settlement.clone(), notifier, names, lifecycle),
            invariants: InvariantChecker::new(store),
            settlement,
            catalog,
            config,
        }
    }
}
