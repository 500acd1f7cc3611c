//! Closed vocabularies shared by the billing engine, the API and the worker.
//!
//! Every status or kind that crosses a crate boundary is one of these enums.
//! Strings are parsed once at the boundary (`FromStr`) and never re-checked
//! further down.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a string does not name a variant of a vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident as $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $( $text => Ok($name::$variant), )+
                    _ => Err(ParseEnumError {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// Plan a subscription is on.
    PlanType as "plan type" {
        Trial => "trial",
        Monthly => "monthly",
        Yearly => "yearly",
    }
}

impl PlanType {
    /// Ordering used to tell upgrades from downgrades.
    pub fn rank(&self) -> u8 {
        match self {
            PlanType::Trial => 0,
            PlanType::Monthly => 1,
            PlanType::Yearly => 2,
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, PlanType::Trial)
    }

    /// Parse a stored plan type, falling back to `Trial` for unknown values.
    ///
    /// Only for documents written before plan types were validated on the
    /// way in. Request input must go through `FromStr`.
    pub fn parse_lenient(raw: &str) -> PlanType {
        raw.parse().unwrap_or_else(|_| {
            tracing::warn!(plan_type = %raw, "Unknown stored plan type, treating as trial");
            PlanType::Trial
        })
    }
}

string_enum! {
    /// Lifecycle state of a subscription.
    SubscriptionStatus as "subscription status" {
        Trial => "trial",
        Pending => "pending",
        Active => "active",
        Expired => "expired",
        Canceled => "canceled",
    }
}

impl SubscriptionStatus {
    /// `canceled` is the only state nothing leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }

    /// States that count towards the one-open-subscription-per-tenant rule.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

string_enum! {
    /// Ledger status of a payment.
    PaymentStatus as "payment status" {
        Pending => "pending",
        Confirmed => "confirmed",
        Failed => "failed",
        Refunded => "refunded",
        PartiallyRefunded => "partially_refunded",
    }
}

impl PaymentStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

string_enum! {
    /// What a payment pays for.
    PaymentContext as "payment context" {
        Subscription => "subscription",
        Pos => "pos",
        Debt => "debt",
    }
}

string_enum! {
    /// Contexts a discount code may be used in.
    DiscountApplicability as "discount applicability" {
        Subscription => "subscription",
        Pos => "pos",
        Debt => "debt",
        All => "all",
    }
}

impl From<PaymentContext> for DiscountApplicability {
    fn from(context: PaymentContext) -> Self {
        match context {
            PaymentContext::Subscription => DiscountApplicability::Subscription,
            PaymentContext::Pos => DiscountApplicability::Pos,
            PaymentContext::Debt => DiscountApplicability::Debt,
        }
    }
}

string_enum! {
    DiscountType as "discount type" {
        Fixed => "fixed",
        Percentage => "percentage",
    }
}

string_enum! {
    /// Collection mechanism that produced a payment.
    PaymentChannel as "payment channel" {
        /// Automated mobile-money gateway, settled by callback.
        Gateway => "gateway",
        /// Uploaded proof, settled by an admin decision.
        Offline => "offline",
    }
}

string_enum! {
    PaymentMethod as "payment method" {
        MobileMoney => "mobile_money",
        ManualMobileMoney => "manual_mobile_money",
        BankTransfer => "bank_transfer",
        Cash => "cash",
    }
}

impl PaymentMethod {
    pub fn channel(&self) -> PaymentChannel {
        match self {
            PaymentMethod::MobileMoney => PaymentChannel::Gateway,
            PaymentMethod::ManualMobileMoney | PaymentMethod::BankTransfer | PaymentMethod::Cash => {
                PaymentChannel::Offline
            }
        }
    }
}

string_enum! {
    /// Progress of the gateway leg of a payment.
    IntegrationStatus as "integration status" {
        Initiated => "initiated",
        AwaitingCallback => "awaiting_callback",
        Completed => "completed",
        Failed => "failed",
        NotApplicable => "not_applicable",
    }
}

string_enum! {
    /// Admin decision on an offline proof.
    VerificationDecision as "verification decision" {
        Approved => "approved",
        Rejected => "rejected",
    }
}

string_enum! {
    /// Role of the caller acting on a tenant's billing.
    ActorRole as "actor role" {
        Owner => "owner",
        Staff => "staff",
        /// Platform operator; may verify proofs, extend and refund.
        Admin => "admin",
    }
}
