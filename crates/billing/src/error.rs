//! Billing error taxonomy
//!
//! Every variant maps to a stable `error_code` and an HTTP-style status so the
//! caller can render `{message, statusCode, errorCode}` without inspecting
//! message text.

use serde::Serialize;
use shopsub_shared::{DiscountApplicability, ParseEnumError, PaymentContext};
use uuid::Uuid;

use crate::gateway::GatewayError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    // Validation
    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payment in {0} context requires a matching reference")]
    MissingContextReference(PaymentContext),

    #[error("Invalid discount code: {0}")]
    InvalidDiscount(String),

    #[error("Discount code {code} cannot be used for {context}")]
    InvalidContext {
        code: String,
        context: DiscountApplicability,
    },

    #[error("Discount code {0} is not valid for debt payments")]
    InvalidContextDebt(String),

    #[error("Discount code {0} is not valid for this shop")]
    InvalidShop(String),

    #[error("Minimum purchase of {minimum} not met")]
    MinimumPurchaseNotMet { minimum: i64 },

    // Conflict / state
    #[error("Discount code {0} has reached its usage limit")]
    DiscountExhausted(String),

    #[error("Payment {0} is already confirmed")]
    AlreadyConfirmed(Uuid),

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Tenant {0} already has an open subscription")]
    SubscriptionExists(Uuid),

    #[error("Discount code {0} already exists")]
    DiscountCodeExists(String),

    #[error("An account with email {0} already exists")]
    AccountExists(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    // Transient / external
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Payment failed, please retry: {0}")]
    PaymentFailed(String),

    // Internal
    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structured error returned to callers
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: String,
    pub status_code: u16,
    pub error_code: &'static str,
}

impl BillingError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::PlanNotFound(_) | Self::NotFound(_) => 404,
            Self::InvalidPlan(_)
            | Self::InvalidInput(_)
            | Self::MissingContextReference(_)
            | Self::InvalidDiscount(_)
            | Self::InvalidContext { .. }
            | Self::InvalidContextDebt(_)
            | Self::InvalidShop(_)
            | Self::MinimumPurchaseNotMet { .. } => 400,
            Self::Forbidden(_) => 403,
            Self::DiscountExhausted(_)
            | Self::AlreadyConfirmed(_)
            | Self::InvalidStateTransition { .. }
            | Self::SubscriptionExists(_)
            | Self::DiscountCodeExists(_)
            | Self::AccountExists(_)
            | Self::ConcurrentModification(_) => 409,
            Self::PaymentFailed(_) => 402,
            Self::Gateway(_) => 502,
            Self::Database(_) | Self::Config(_) | Self::Serialization(_) => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PlanNotFound(_) => "PLAN_NOT_FOUND",
            Self::InvalidPlan(_) => "INVALID_PLAN",
            Self::InvalidInput(_) => "VALIDATION_ERROR",
            Self::MissingContextReference(_) => "MISSING_CONTEXT_REFERENCE",
            Self::InvalidDiscount(_) => "INVALID_DISCOUNT",
            Self::InvalidContext { .. } => "INVALID_CONTEXT",
            Self::InvalidContextDebt(_) => "INVALID_CONTEXT_DEBT",
            Self::InvalidShop(_) => "INVALID_SHOP",
            Self::MinimumPurchaseNotMet { .. } => "MINIMUM_PURCHASE_NOT_MET",
            Self::DiscountExhausted(_) => "DISCOUNT_EXHAUSTED",
            Self::AlreadyConfirmed(_) => "ALREADY_CONFIRMED",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::SubscriptionExists(_) => "SUBSCRIPTION_EXISTS",
            Self::DiscountCodeExists(_) => "DISCOUNT_CODE_EXISTS",
            Self::AccountExists(_) => "ACCOUNT_EXISTS",
            Self::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Gateway(_) => "GATEWAY_ERROR",
            Self::PaymentFailed(_) => "PAYMENT_FAILED",
            Self::Database(_) | Self::Serialization(_) => "INTERNAL_ERROR",
            Self::Config(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Caller-facing body. Internal failures never leak their detail.
    pub fn to_body(&self) -> ErrorBody {
        let message = if self.status_code() >= 500 && !matches!(self, Self::Gateway(_)) {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        ErrorBody {
            message,
            status_code: self.status_code(),
            error_code: self.error_code(),
        }
    }

    /// Whether retrying the same call could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Gateway(e) => e.is_retryable(),
            Self::ConcurrentModification(_) | Self::Database(_) => true,
            _ => false,
        }
    }

    pub(crate) fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidStateTransition {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        if let Some(db) = e.as_database_error() {
            if db.is_unique_violation() {
                return BillingError::ConcurrentModification(format!(
                    "unique constraint {} violated",
                    db.constraint().unwrap_or("(unknown)")
                ));
            }
        }
        BillingError::Database(e.to_string())
    }
}

impl From<ParseEnumError> for BillingError {
    fn from(e: ParseEnumError) -> Self {
        BillingError::InvalidInput(e.to_string())
    }
}
