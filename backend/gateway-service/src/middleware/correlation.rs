//! End-to-end correlation id propagation.
//!
//! Every request gets one: the inbound `X-Correlation-ID` header when it is
//! usable (trimmed, size-capped, visible ASCII), a fresh UUID otherwise.
//! The id travels in request extensions, comes back on every response, and
//! is written into the outbox headers so downstream consumers log the same
//! id.

use axum::{
    extract::{FromRequestParts, Request},
    http::{header::HeaderValue, request::Parts},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "X-Correlation-ID";
const MAX_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

/// Request-scoped data handlers need when building errors and outbox
/// headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub path: String,
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let correlation_id = parts
            .extensions
            .get::<CorrelationId>()
            .map(|c| c.0.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(RequestContext {
            correlation_id,
            path: parts.uri.path().to_string(),
        })
    }
}

pub async fn propagate(mut request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(normalize)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request
        .extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_LEN {
        return None;
    }
    if !trimmed.chars().all(|c| c.is_ascii_graphic()) {
        return None;
    }
    Some(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_ids_pass_through_trimmed() {
        assert_eq!(normalize("  corr-42  "), Some("corr-42".to_string()));
        assert_eq!(normalize("a"), Some("a".to_string()));
    }

    #[test]
    fn oversized_blank_or_binary_ids_are_replaced() {
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("   "), None);
        assert_eq!(normalize(&"x".repeat(65)), None);
        assert_eq!(normalize("has space"), None);
        assert_eq!(normalize("tab\there"), None);
    }

    #[test]
    fn max_length_is_inclusive() {
        let id = "x".repeat(64);
        assert_eq!(normalize(&id), Some(id));
    }
}
