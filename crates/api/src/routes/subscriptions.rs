//! Subscription routes: onboarding, read model and lifecycle requests

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use shopsub_billing::{
    CancelRequest, PlanDefinition, RegisterTenant, Registration, Subscription, SubscriptionView,
};
use shopsub_shared::PlanType;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendRequest {
    pub days: i64,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlanRequest {
    pub plan_type: PlanType,
}

pub async fn list_plans(State(state): State<AppState>) -> Json<Vec<PlanDefinition>> {
    Json(
        state
            .billing
            .catalog
            .list_active_plans()
            .into_iter()
            .cloned()
            .collect(),
    )
}

/// Shop onboarding. Creates tenant, owner and subscription together.
pub async fn register_tenant(
    State(state): State<AppState>,
    Json(request): Json<RegisterTenant>,
) -> ApiResult<(StatusCode, Json<Registration>)> {
    let registration = state.billing.settlement.register_tenant(request).await?;
    tracing::info!(
        tenant_id = %registration.tenant.id,
        subscription_id = %registration.subscription.id,
        status = %registration.subscription.status,
        "Tenant registered"
    );
    Ok((StatusCode::CREATED, Json(registration)))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    let view = state.billing.subscriptions.view(id).await?;
    auth.require_tenant(view.tenant_id)?;
    Ok(Json(view))
}

pub async fn get_tenant_subscription(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    auth.require_tenant(tenant_id)?;
    Ok(Json(
        state.billing.subscriptions.view_for_tenant(tenant_id).await?,
    ))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<Subscription>> {
    let subscription = state
        .billing
        .settlement
        .cancel_subscription(id, request, auth.actor)
        .await?;
    Ok(Json(subscription))
}

pub async fn extend_subscription(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<ExtendRequest>,
) -> ApiResult<Json<Subscription>> {
    auth.require_admin()?;
    let subscription = state
        .billing
        .settlement
        .extend_subscription(id, request.days, request.note, auth.actor)
        .await?;
    Ok(Json(subscription))
}

pub async fn change_plan(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<ChangePlanRequest>,
) -> ApiResult<Json<Subscription>> {
    auth.require_admin()?;
    let subscription = state
        .billing
        .settlement
        .change_plan(id, request.plan_type, auth.actor)
        .await?;
    Ok(Json(subscription))
}
