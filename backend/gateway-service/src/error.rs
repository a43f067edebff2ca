//! API error taxonomy and its HTTP projection.
//!
//! Validation and auth failures are final; upstream failures surface as
//! the 503 fallback contract with the failed collaborator named, and are
//! retried by the outbox machinery rather than the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Bad credentials on the token endpoint
    #[error("Invalid grant")]
    InvalidGrant,

    /// Missing, unverifiable or expired bearer token
    #[error("Invalid token")]
    InvalidToken,

    #[error("Insufficient authority: {0}")]
    InsufficientAuthority(String),

    #[error("Too many login attempts")]
    RateLimited,

    #[error("Not found")]
    NotFound,

    /// A collaborator (database, broker) is unavailable; answered with the
    /// 503 fallback body
    #[error("Upstream {upstream} unavailable: {message}")]
    Upstream {
        upstream: String,
        message: String,
        path: String,
        correlation_id: String,
    },

    /// Database failure outside a request path that carries the fallback
    /// context; handlers on the order path wrap these via [`Self::upstream`]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Wrap a collaborator failure into the fallback contract.
    pub fn upstream(
        upstream: &str,
        error: impl std::fmt::Display,
        path: &str,
        correlation_id: &str,
    ) -> Self {
        ApiError::Upstream {
            upstream: upstream.to_string(),
            message: error.to_string(),
            path: path.to_string(),
            correlation_id: correlation_id.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_request", "message": message})),
            )
                .into_response(),
            ApiError::InvalidGrant => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid_grant"})),
            )
                .into_response(),
            ApiError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid_token"})),
            )
                .into_response(),
            ApiError::InsufficientAuthority(message) => (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "insufficient_authority", "message": message})),
            )
                .into_response(),
            ApiError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": "rate_limited"})),
            )
                .into_response(),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "not_found"})),
            )
                .into_response(),
            ApiError::Upstream {
                upstream,
                message,
                path,
                correlation_id,
            } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "timestamp": Utc::now().to_rfc3339(),
                    "status": 503,
                    "error": "Service Unavailable",
                    "message": message,
                    "upstream": upstream,
                    "path": path,
                    "correlationId": correlation_id,
                })),
            )
                .into_response(),
            ApiError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({
                        "timestamp": Utc::now().to_rfc3339(),
                        "status": 503,
                        "error": "Service Unavailable",
                        "message": "database unavailable",
                        "upstream": "gateway-db",
                    })),
                )
                    .into_response()
            }
            ApiError::Internal(e) => {
                tracing::error!(error = ?e, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal_error"})),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(
            ApiError::Validation("bad".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::InvalidGrant.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::InvalidToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::InsufficientAuthority("no tenant".into())
                .into_response()
                .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::RateLimited.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::upstream("gateway-db", "pool timed out", "/orders", "corr-1")
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
