//! Bearer-token authentication and the request principal.

use auth_core::Authority;
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

/// The authenticated caller: verified subject plus derived authorities.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub authorities: Vec<Authority>,
    pub tenants: Vec<String>,
}

impl Principal {
    pub fn has(&self, authority: &Authority) -> bool {
        self.authorities.contains(authority)
    }

    pub fn holds_tenant(&self, tenant: &str) -> bool {
        self.tenants.iter().any(|t| t == tenant)
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(ApiError::InvalidToken)?;

        let verified = state
            .verifier
            .verify(token)
            .map_err(|_| ApiError::InvalidToken)?;

        let user_id = Uuid::parse_str(&verified.subject).map_err(|_| ApiError::InvalidToken)?;
        let authorities = state.authz.authorities_from_claims(&verified.claims);
        let tenants = state.authz.tenants_of(&authorities);

        Ok(Principal {
            user_id,
            authorities,
            tenants,
        })
    }
}
