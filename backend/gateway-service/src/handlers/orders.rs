//! Order command API.
//!
//! `POST /orders` accepts a command, writes the saga row and the
//! `OrderCreate` outbox row in one transaction, and answers 202 with the
//! saga and correlation ids. The actual work happens asynchronously on the
//! bus; `GET /orders/{sagaId}` reads the registry the gateway keeps from
//! the event stream.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use event_schema::{
    commands::{OrderCreate, OrderLine},
    headers as bus_headers, EventEnvelope, EventType,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use transactional_outbox::{NewOutboxEvent, OutboxStore};
use uuid::Uuid;
use validator::Validate;

use crate::error::{ApiError, Result};
use crate::middleware::{Principal, RequestContext};
use crate::AppState;

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 255))]
    pub customer_id: String,
    #[validate(length(min = 1), nested)]
    pub lines: Vec<OrderLineRequest>,
    #[serde(default = "default_currency")]
    pub currency_code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct OrderLineRequest {
    #[validate(length(min = 1, max = 255))]
    pub sku: String,
    #[validate(range(min = 1))]
    pub qty: u32,
    #[validate(length(min = 1, max = 32))]
    pub price: String,
}

fn default_currency() -> String {
    "EUR".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub saga_id: Uuid,
    pub correlation_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaStatusResponse {
    pub saga_id: Uuid,
    pub state: saga_core::SagaState,
    pub order_id: Option<i64>,
    pub last_event_type: Option<String>,
    pub last_event_ts: chrono::DateTime<chrono::Utc>,
}

/// `POST /orders` (requires the orders.write scope)
pub async fn create_order(
    State(state): State<AppState>,
    context: RequestContext,
    principal: Principal,
    headers: HeaderMap,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>)> {
    if !principal.has(&state.authz.scope("orders.write")) {
        return Err(ApiError::InsufficientAuthority(
            "orders.write scope required".to_string(),
        ));
    }

    let tenant_id = resolve_tenant(
        &principal.tenants,
        headers
            .get(state.authz.tenant_header.as_str())
            .and_then(|v| v.to_str().ok()),
    )?;

    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let lines: Vec<OrderLine> = request
        .lines
        .iter()
        .map(|line| OrderLine {
            sku: line.sku.clone(),
            qty: line.qty,
            price: line.price.clone(),
        })
        .collect();
    let total_amount_minor = OrderCreate::total_minor(&lines)
        .ok_or_else(|| ApiError::Validation("unparseable line price".to_string()))?;

    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty() && k.len() <= 255);

    let saga_id = Uuid::now_v7();

    let mut tx = state
        .db
        .begin()
        .await
        .map_err(|e| ApiError::upstream("gateway-db", e, &context.path, &context.correlation_id))?;

    if let Some(key) = idempotency_key {
        if let Some(existing) = state
            .sagas
            .claim_create_key(&mut tx, &tenant_id, key, saga_id)
            .await?
        {
            tx.rollback()
                .await
                .map_err(|e| {
                    ApiError::upstream("gateway-db", e, &context.path, &context.correlation_id)
                })?;
            info!(saga_id = %existing, key, "Duplicate create suppressed by idempotency key");
            return Ok((
                StatusCode::ACCEPTED,
                Json(CreateOrderResponse {
                    saga_id: existing,
                    correlation_id: context.correlation_id,
                }),
            ));
        }
    }

    state
        .sagas
        .insert(&mut tx, saga_id, &tenant_id, principal.user_id)
        .await?;

    let command = OrderCreate {
        customer_id: request.customer_id.clone(),
        user_id: principal.user_id,
        lines,
        currency_code: request.currency_code.clone(),
        total_amount_minor,
    };
    let envelope = EventEnvelope::new(
        saga_id,
        EventType::OrderCreate,
        tenant_id.clone(),
        serde_json::to_value(&command).map_err(anyhow::Error::from)?,
    );

    state
        .outbox
        .save_event(
            &mut tx,
            NewOutboxEvent::new(
                &tenant_id,
                saga_id,
                "saga",
                EventType::OrderCreate.as_str(),
            )
            .payload(serde_json::to_value(&envelope).map_err(anyhow::Error::from)?)
            .headers(json!({ bus_headers::CORRELATION_ID: context.correlation_id })),
        )
        .await
        .map_err(|e| ApiError::upstream("gateway-db", e, &context.path, &context.correlation_id))?;

    tx.commit()
        .await
        .map_err(|e| ApiError::upstream("gateway-db", e, &context.path, &context.correlation_id))?;

    info!(
        saga_id = %saga_id,
        tenant_id = %tenant_id,
        correlation_id = %context.correlation_id,
        total_amount_minor,
        "Order accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateOrderResponse {
            saga_id,
            correlation_id: context.correlation_id,
        }),
    ))
}

/// `GET /orders/{sagaId}`
pub async fn get_saga(
    State(state): State<AppState>,
    principal: Principal,
    Path(saga_id): Path<Uuid>,
) -> Result<Json<SagaStatusResponse>> {
    let saga = state.sagas.find(saga_id).await?.ok_or(ApiError::NotFound)?;
    if !principal.holds_tenant(&saga.tenant_id) {
        // Hide other tenants' sagas entirely.
        return Err(ApiError::NotFound);
    }

    Ok(Json(SagaStatusResponse {
        saga_id: saga.id,
        state: saga.state,
        order_id: saga.order_id,
        last_event_type: saga.last_event_type,
        last_event_ts: saga.last_event_ts,
    }))
}

/// Tenant resolution: the header narrows the choice but never widens it.
/// Without a header the principal must map to exactly one tenant.
fn resolve_tenant(principal_tenants: &[String], header: Option<&str>) -> Result<String> {
    let header = header.map(str::trim).filter(|t| !t.is_empty());

    match header {
        Some(requested) => {
            if principal_tenants.iter().any(|t| t == requested) {
                Ok(requested.to_string())
            } else {
                Err(ApiError::InsufficientAuthority(format!(
                    "principal is not authorized for tenant {requested}"
                )))
            }
        }
        None => match principal_tenants {
            [single] => Ok(single.clone()),
            [] => Err(ApiError::InsufficientAuthority(
                "no tenant authority on principal".to_string(),
            )),
            _ => Err(ApiError::Validation(
                "multiple tenants on principal, X-Tenant-ID header required".to_string(),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenants(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_tenant_resolves_without_header() {
        assert_eq!(resolve_tenant(&tenants(&["acme"]), None).unwrap(), "acme");
    }

    #[test]
    fn header_wins_only_when_authorized() {
        let principal = tenants(&["acme", "globex"]);
        assert_eq!(
            resolve_tenant(&principal, Some("globex")).unwrap(),
            "globex"
        );
        assert!(matches!(
            resolve_tenant(&principal, Some("initech")),
            Err(ApiError::InsufficientAuthority(_))
        ));
    }

    #[test]
    fn ambiguous_principal_requires_the_header() {
        assert!(matches!(
            resolve_tenant(&tenants(&["acme", "globex"]), None),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn tenantless_principal_is_rejected() {
        assert!(matches!(
            resolve_tenant(&[], None),
            Err(ApiError::InsufficientAuthority(_))
        ));
        assert!(matches!(
            resolve_tenant(&[], Some("acme")),
            Err(ApiError::InsufficientAuthority(_))
        ));
    }

    #[test]
    fn blank_header_is_ignored() {
        assert_eq!(
            resolve_tenant(&tenants(&["acme"]), Some("  ")).unwrap(),
            "acme"
        );
    }
}
