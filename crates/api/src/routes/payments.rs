//! Payment routes: gateway initiation, offline proofs, review and refunds

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use shopsub_billing::{
    GatewayPaymentRequest, OfflinePaymentRequest, Payment, PaymentFilter, RefundRequest,
    Settlement,
};
use shopsub_shared::{PaymentChannel, PaymentStatus, VerificationDecision};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentListQuery {
    pub status: Option<PaymentStatus>,
    pub channel: Option<PaymentChannel>,
    pub subscription_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub status: VerificationDecision,
    pub notes: Option<String>,
    /// Only consulted when rejection notices are sent on request
    #[serde(default)]
    pub notify_tenant: bool,
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn initiate_gateway_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<GatewayPaymentRequest>,
) -> ApiResult<(StatusCode, Json<Payment>)> {
    auth.require_tenant(request.tenant_id)?;
    let payment = state
        .billing
        .settlement
        .initiate_gateway_payment(request)
        .await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

pub async fn submit_offline_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<OfflinePaymentRequest>,
) -> ApiResult<(StatusCode, Json<Payment>)> {
    auth.require_tenant(request.tenant_id)?;
    let payment = state
        .billing
        .settlement
        .submit_offline_payment(request)
        .await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Payment>> {
    let payment = state.billing.ledger.get(id).await?;
    auth.require_tenant(payment.tenant_id)?;
    Ok(Json(payment))
}

pub async fn list_payments(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<PaymentListQuery>,
) -> ApiResult<Json<Vec<Payment>>> {
    let tenant_id = match (auth.is_admin(), query.tenant_id) {
        (true, requested) => requested,
        (false, Some(requested)) => {
            auth.require_tenant(requested)?;
            Some(requested)
        }
        (false, None) => auth.tenant_id,
    };

    let filter = PaymentFilter {
        status: query.status,
        channel: query.channel,
        subscription_id: query.subscription_id,
        tenant_id,
        ..Default::default()
    };
    Ok(Json(state.billing.ledger.list(&filter).await?))
}

pub async fn verify_offline_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<VerifyRequest>,
) -> ApiResult<Json<Settlement>> {
    auth.require_admin()?;
    let settlement = state
        .billing
        .settlement
        .verify_offline_payment(
            id,
            request.status,
            request.notes,
            request.notify_tenant,
            auth.actor,
        )
        .await?;
    Ok(Json(settlement))
}

pub async fn confirm_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Settlement>> {
    auth.require_admin()?;
    let settlement = state
        .billing
        .settlement
        .confirm_payment(id, Some(auth.actor))
        .await?;
    Ok(Json(settlement))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> ApiResult<Json<Payment>> {
    auth.require_admin()?;
    if request.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("refund reason is required".to_string()));
    }
    let payment = state
        .billing
        .settlement
        .refund_payment(id, request, auth.actor)
        .await?;
    Ok(Json(payment))
}
