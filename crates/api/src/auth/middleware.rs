//! Authentication middleware
//!
//! Identity is established by the edge proxy in front of this service, which
//! forwards the verified caller in `x-actor-id`, `x-actor-role` and, for shop
//! users, `x-tenant-id`. Requests reaching a protected route without them are
//! rejected before any handler runs.

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use shopsub_billing::{Actor, ErrorBody};
use shopsub_shared::ActorRole;
use uuid::Uuid;

use crate::error::ApiError;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";
pub const TENANT_ID_HEADER: &str = "x-tenant-id";

/// Authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub actor: Actor,
    /// Shop the caller belongs to; `None` for platform admins
    pub tenant_id: Option<Uuid>,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.actor.is_admin()
    }

    /// Admins may act on any tenant, everyone else only on their own
    pub fn require_tenant(&self, tenant_id: Uuid) -> Result<(), ApiError> {
        if self.is_admin() || self.tenant_id == Some(tenant_id) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "not allowed to act for tenant {}",
                tenant_id
            )))
        }
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden("administrator role required".to_string()))
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("No tenant found for a shop user")]
    NoTenant,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_code) = match self {
            AuthError::MissingAuth | AuthError::InvalidAuthFormat => {
                (StatusCode::UNAUTHORIZED, "UNAUTHORIZED")
            }
            AuthError::NoTenant => (StatusCode::FORBIDDEN, "FORBIDDEN"),
        };
        let body = ErrorBody {
            message: self.to_string(),
            status_code: status.as_u16(),
            error_code,
        };
        (status, Json(body)).into_response()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the caller from forwarded identity headers
pub fn authenticate(headers: &HeaderMap) -> Result<AuthUser, AuthError> {
    let id = header(headers, ACTOR_ID_HEADER).ok_or(AuthError::MissingAuth)?;
    let role = header(headers, ACTOR_ROLE_HEADER).ok_or(AuthError::MissingAuth)?;

    let id: Uuid = id.parse().map_err(|_| AuthError::InvalidAuthFormat)?;
    let role: ActorRole = role.parse().map_err(|_| AuthError::InvalidAuthFormat)?;
    let tenant_id = header(headers, TENANT_ID_HEADER)
        .map(|t| t.parse::<Uuid>().map_err(|_| AuthError::InvalidAuthFormat))
        .transpose()?;

    if role != ActorRole::Admin && tenant_id.is_none() {
        return Err(AuthError::NoTenant);
    }

    Ok(AuthUser {
        actor: Actor { id, role },
        tenant_id,
    })
}

/// Middleware that requires an authenticated caller
pub async fn require_actor(mut request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();

    match authenticate(request.headers()) {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                actor_id = %auth_user.actor.id,
                role = %auth_user.actor.role,
                tenant_id = ?auth_user.tenant_id,
                "require_actor: caller resolved"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_actor: authentication failed");
            err.into_response()
        }
    }
}
