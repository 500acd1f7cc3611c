//! Error types for the HTTP surface

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use shopsub_billing::{BillingError, ErrorBody};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    fn body(&self) -> ErrorBody {
        match self {
            Self::Unauthorized => ErrorBody {
                message: self.to_string(),
                status_code: 401,
                error_code: "UNAUTHORIZED",
            },
            Self::Forbidden(_) => ErrorBody {
                message: self.to_string(),
                status_code: 403,
                error_code: "FORBIDDEN",
            },
            Self::BadRequest(_) => ErrorBody {
                message: self.to_string(),
                status_code: 400,
                error_code: "BAD_REQUEST",
            },
            Self::Billing(e) => e.to_body(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.body();

        if body.status_code >= 500 {
            tracing::error!(error = ?self, "Internal API error");
        }

        let status =
            StatusCode::from_u16(body.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
