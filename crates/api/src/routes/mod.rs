//! API routes

pub mod admin;
pub mod callbacks;
pub mod discounts;
pub mod payments;
pub mod subscriptions;


use axum::{
    middleware,
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_actor, state::AppState};

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

pub fn create_router(state: AppState) -> Router {
    // Everything below requires forwarded caller identity
    let protected = Router::new()
        // Payments
        .route("/payments", get(payments::list_payments))
        .route("/payments/gateway", post(payments::initiate_gateway_payment))
        .route("/payments/offline", post(payments::submit_offline_payment))
        .route("/payments/{id}", get(payments::get_payment))
        .route("/payments/{id}/verify", post(payments::verify_offline_payment))
        .route("/payments/{id}/confirm", post(payments::confirm_payment))
        .route("/payments/{id}/refund", post(payments::refund_payment))
        // Subscriptions
        .route("/subscriptions/{id}", get(subscriptions::get_subscription))
        .route("/subscriptions/{id}/cancel", post(subscriptions::cancel_subscription))
        .route("/subscriptions/{id}/extend", post(subscriptions::extend_subscription))
        .route("/subscriptions/{id}/plan", post(subscriptions::change_plan))
        .route(
            "/tenants/{tenant_id}/subscription",
            get(subscriptions::get_tenant_subscription),
        )
        // Discounts
        .route(
            "/discounts",
            get(discounts::list_discounts).post(discounts::create_discount),
        )
        .route("/discounts/validate", post(discounts::validate_discount))
        .route(
            "/discounts/{id}",
            patch(discounts::update_discount).delete(discounts::deactivate_discount),
        )
        // Admin
        .route("/admin/invariants", get(admin::run_invariant_checks))
        .layer(middleware::from_fn(require_actor));

    Router::new()
        .route("/health", get(health))
        .route("/plans", get(subscriptions::list_plans))
        .route("/tenants", post(subscriptions::register_tenant))
        // Gateway callbacks authenticate by signature, never by caller identity
        .route("/callbacks/gateway", post(callbacks::gateway_callback))
        .merge(protected)
        .with_state(state)
}
