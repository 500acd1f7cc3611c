//! Caller identity for ShopSub API routes

pub mod middleware;

pub use middleware::{require_actor, AuthError, AuthUser};
