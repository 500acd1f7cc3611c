#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ShopSub shared types
//!
//! Vocabulary enums and database helpers used by every ShopSub crate.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{
    ActorRole, DiscountApplicability, DiscountType, IntegrationStatus, ParseEnumError,
    PaymentChannel, PaymentContext, PaymentMethod, PaymentStatus, PlanType, SubscriptionStatus,
    VerificationDecision,
};
