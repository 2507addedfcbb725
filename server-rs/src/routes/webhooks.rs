use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};

use crate::audit::AuditEvent;
use crate::error::AppError;
use crate::models::BillingEvent;
use crate::AppState;

/// Payment-processor callback. Acknowledges everything except transient
/// persistence failures, which get a 503 so the processor redelivers.
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let Some(verifier) = &state.webhook else {
        tracing::warn!("billing webhook received but no webhook secret is configured");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "billing webhooks are not configured" })),
        );
    };

    let sig = headers
        .get(state.config.billing.signature_header.as_str())
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if let Err(e) = verifier.verify(&body, sig, state.clock.now()) {
        state.audit.record(AuditEvent::WebhookRejected {
            reason: e.to_string(),
        });
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid signature" })),
        );
    }

    let event: BillingEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            state.audit.record(AuditEvent::WebhookRejected {
                reason: format!("malformed payload: {e}"),
            });
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("malformed event: {e}") })),
            );
        }
    };

    match state.engine.subscriptions.handle_event(&event).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "received": true, "outcome": outcome })),
        ),
        Err(AppError::DuplicateWebhookEvent(_)) => (
            StatusCode::OK,
            Json(json!({ "received": true, "duplicate": true })),
        ),
        Err(e) if e.is_transient() => {
            tracing::error!(event_id = %event.id, "billing event deferred: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "temporarily unavailable, retry later" })),
            )
        }
        Err(e) => {
            // redelivery would fail the same way
            tracing::error!(event_id = %event.id, event_type = event.kind.as_str(), "billing event failed: {e}");
            (
                StatusCode::OK,
                Json(json!({ "received": true, "error": e.code() })),
            )
        }
    }
}
