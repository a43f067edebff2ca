//! OpenID discovery and JWKS endpoints.

use axum::{
    extract::State,
    http::header::{HeaderValue, CACHE_CONTROL},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::AppState;

/// `GET /.well-known/openid-configuration`
pub async fn openid_configuration(State(state): State<AppState>) -> Json<serde_json::Value> {
    let issuer = state.issuer_url();
    Json(json!({
        "issuer": issuer,
        "jwks_uri": format!("{}/.well-known/jwks.json", issuer.trim_end_matches('/')),
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"],
    }))
}

/// `GET /.well-known/jwks.json`
///
/// Cached by clients for 10 minutes; retention keeps rotated-out keys
/// verifiable well past any cached copy.
pub async fn jwks(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CACHE_CONTROL, HeaderValue::from_static("public, max-age=600"))],
        Json(state.keys.jwks()),
    )
}
