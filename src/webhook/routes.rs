//! HTTP surface for the delivery-event receiver.
//!
//! Authentication failures and malformed JSON get a 400 so the provider
//! retries nothing it shouldn't; everything past that point is absorbed
//! and answered 200, because provider retries can't fix an unmatched
//! message id or a database hiccup.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use chrono::Utc;
use secrecy::ExposeSecret;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::error::WebhookError;
use crate::model::{DeliveryEventKind, EventRecord};
use crate::store::Database;
use crate::webhook::event::DeliveryEnvelope;
use crate::webhook::signature;

/// Matched jobs per event. The provider message id is expected to be
/// unique, so this is a safety cap, not a paging mechanism.
const MAX_JOBS_PER_EVENT: usize = 20;

#[derive(Clone)]
pub struct WebhookState {
    pub db: Arc<dyn Database>,
    pub config: Arc<WebhookConfig>,
}

/// Router for the delivery-event endpoint.
pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route(
            "/webhooks/email",
            post(receive_delivery_event).options(preflight),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn receive_delivery_event(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match authenticate(&state, &headers, &body) {
        Ok(()) => {}
        Err(err) => {
            warn!(error = %err, "Rejected webhook delivery");
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({
                "success": false,
                "error": err.to_string(),
            })));
        }
    }

    let envelope: DeliveryEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "Malformed webhook payload");
            let err = WebhookError::MalformedPayload(err.to_string());
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({
                "success": false,
                "error": err.to_string(),
            })));
        }
    };

    // Reconciliation errors are logged, never surfaced: a retry from the
    // provider would hit the same state.
    let provider_event_id = header_str(&headers, signature::ID_HEADER).map(str::to_string);
    reconcile(&state, envelope, provider_event_id, &body).await;

    (StatusCode::OK, Json(serde_json::json!({ "success": true })))
}

fn authenticate(
    state: &WebhookState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), WebhookError> {
    let secret = state
        .config
        .signing_secret
        .as_ref()
        .map(|s| s.expose_secret().to_string());

    if secret.is_none() {
        return signature::verify(None, "", "", body, "", Utc::now(), 0);
    }

    let msg_id = header_str(headers, signature::ID_HEADER)
        .ok_or(WebhookError::MissingHeader(signature::ID_HEADER))?;
    let timestamp = header_str(headers, signature::TIMESTAMP_HEADER)
        .ok_or(WebhookError::MissingHeader(signature::TIMESTAMP_HEADER))?;
    let signature_header = header_str(headers, signature::SIGNATURE_HEADER)
        .ok_or(WebhookError::MissingHeader(signature::SIGNATURE_HEADER))?;

    signature::verify(
        secret.as_deref(),
        msg_id,
        timestamp,
        body,
        signature_header,
        Utc::now(),
        state.config.tolerance_secs,
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn reconcile(
    state: &WebhookState,
    envelope: DeliveryEnvelope,
    provider_event_id: Option<String>,
    raw_body: &[u8],
) {
    let Some(event_type) = envelope.event_type.as_deref() else {
        debug!("Webhook payload carries no event type; ignoring");
        return;
    };

    let kind = DeliveryEventKind::classify(event_type);
    if kind == DeliveryEventKind::Unknown {
        debug!(event_type, "Unrecognized delivery event type; ignoring");
        return;
    }

    let Some(message_id) = envelope.data.email_id.as_deref() else {
        debug!(event_type, "Delivery event carries no message id; ignoring");
        return;
    };

    let jobs = match state
        .db
        .jobs_by_provider_message_id(message_id, MAX_JOBS_PER_EVENT)
        .await
    {
        Ok(jobs) => jobs,
        Err(err) => {
            warn!(error = %err, message_id, "Failed to look up jobs for delivery event");
            return;
        }
    };

    if jobs.is_empty() {
        debug!(message_id, event_type, "No jobs match this delivery event");
        return;
    }

    let message = match kind {
        DeliveryEventKind::Bounced => envelope
            .data
            .bounce
            .as_ref()
            .and_then(|b| b.message.clone()),
        DeliveryEventKind::Complained => None,
        DeliveryEventKind::Failed => envelope
            .data
            .error
            .as_ref()
            .and_then(|e| e.message.clone()),
        _ => None,
    };

    let record = EventRecord {
        provider_event_id,
        occurred_at: envelope.occurred_at(Utc::now()),
        message,
        raw_payload: serde_json::from_slice(raw_body).unwrap_or(serde_json::Value::Null),
    };

    for job in &jobs {
        match state.db.apply_delivery_event(job.id, kind, &record).await {
            Ok(()) => {
                info!(
                    job_id = %job.id,
                    event = kind.as_str(),
                    message_id,
                    "Applied delivery event"
                );
            }
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "Failed to apply delivery event");
            }
        }
    }
}
