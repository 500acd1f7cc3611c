//! Discount routes

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use shopsub_billing::{DiscountCode, DiscountDetails, DiscountUpdate, NewDiscountCode};
use shopsub_shared::PaymentContext;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateDiscountRequest {
    pub code: String,
    pub amount: i64,
    pub context: PaymentContext,
    pub tenant_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDiscountsQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

/// Preview a code against a purchase. Does not consume a use.
pub async fn validate_discount(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<ValidateDiscountRequest>,
) -> ApiResult<Json<DiscountDetails>> {
    auth.require_tenant(request.tenant_id)?;
    let details = state
        .billing
        .discounts
        .validate(&request.code, request.amount, request.context, request.tenant_id)
        .await?;
    Ok(Json(details))
}

pub async fn list_discounts(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<ListDiscountsQuery>,
) -> ApiResult<Json<Vec<DiscountCode>>> {
    auth.require_admin()?;
    Ok(Json(
        state.billing.discounts.list(query.include_inactive).await?,
    ))
}

pub async fn create_discount(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<NewDiscountCode>,
) -> ApiResult<(StatusCode, Json<DiscountCode>)> {
    auth.require_admin()?;
    let discount = state
        .billing
        .discounts
        .create(request, Some(auth.actor.id))
        .await?;
    Ok((StatusCode::CREATED, Json(discount)))
}

pub async fn update_discount(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<DiscountUpdate>,
) -> ApiResult<Json<DiscountCode>> {
    auth.require_admin()?;
    Ok(Json(state.billing.discounts.update(id, request).await?))
}

/// Soft delete
pub async fn deactivate_discount(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DiscountCode>> {
    auth.require_admin()?;
    Ok(Json(state.billing.discounts.deactivate(id).await?))
}
