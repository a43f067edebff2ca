//! Password grant endpoint.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{ApiError, Result};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub ext: serde_json::Value,
}

/// `POST /oauth/token`
///
/// Username lookup is case-insensitive; passwords verify against the
/// stored bcrypt hash. Every attempt is recorded, and a username with too
/// many recent failures is answered 429 before any hash work happens.
pub async fn issue_token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>> {
    if request.username.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::InvalidGrant);
    }

    let failures = state
        .login_attempts
        .recent_failures(&request.username, 60)
        .await?;
    if failures >= state.config.login_failure_limit {
        warn!(username = %request.username, failures, "Login rate limit hit");
        return Err(ApiError::RateLimited);
    }

    let Some(user) = state.users.find_auth_data(&request.username).await? else {
        state.login_attempts.record(&request.username, false).await?;
        return Err(ApiError::InvalidGrant);
    };

    let password_ok =
        bcrypt::verify(&request.password, &user.password_hash).unwrap_or(false);
    state
        .login_attempts
        .record(&request.username, password_ok)
        .await?;
    if !password_ok {
        return Err(ApiError::InvalidGrant);
    }

    let issued = state
        .issuer
        .issue(
            &user.id.to_string(),
            &user.scopes,
            &state.authz.tenant_claim,
            &user.tenant_roles,
            &[],
        )
        .map_err(|e| ApiError::Internal(e.into()))?;

    info!(user_id = %user.id, "Token issued");

    Ok(Json(TokenResponse {
        access_token: issued.token,
        token_type: "Bearer".to_string(),
        expires_in: issued.expires_in,
        ext: json!({"scope": user.scopes.join(" ")}),
    }))
}
