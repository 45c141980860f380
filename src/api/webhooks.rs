//! `POST /webhooks/payments` (§4.5, §6.1): the only public (non-JWT) route.
//! The payment processor authenticates itself via HMAC signature, not a
//! bearer token, so this handler sits in `super::public_router` instead of
//! behind `auth_middleware`.

use super::{ApiError, AppState};
use crate::config::StripeMode;
use crate::errors::CoreError;
use crate::ingress::{self, GateConfig, InboundWebhook, Outcome};
use crate::saga::{self, SagaContext};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Duration;
use tracing::{info, warn};

const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// A failed signature check is the one guard in §4.5 that gets a 400
/// instead of a 200-and-drop: an unsigned or forged body isn't something
/// the ordering gate's own dedup/ordering bookkeeping should ever see.
fn signature_rejected(message: impl Into<String>) -> Response {
    let message = message.into();
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": "SIGNATURE_INVALID", "message": message })),
    )
        .into_response()
}

/// Always returns 200 once the signature checks out, even when the gate
/// drops the event (§4.5: the provider's retry policy shouldn't be given a
/// 5xx/4xx to chew on for things that are our own dedup/ordering calls, not
/// the provider's fault). The single exception is a signature mismatch.
pub async fn receive(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let signature = match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(sig) => sig,
        None => return signature_rejected("missing webhook signature"),
    };

    if let Err(e) = ingress::verify_signature(&body, signature, &state.config.webhook_signing_secret) {
        return signature_rejected(e.to_string());
    }

    match receive_inner(state, &body).await {
        Ok(status) => status.into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn receive_inner(state: AppState, body: &Bytes) -> crate::errors::CoreResult<StatusCode> {
    let event: InboundWebhook = serde_json::from_slice(body)
        .map_err(|e| CoreError::Validation(format!("malformed webhook body: {e}")))?;

    let gate_config = GateConfig {
        signing_secret: state.config.webhook_signing_secret.clone(),
        expect_live: state.config.stripe_mode == StripeMode::Live,
        late_arrival_warn: Duration::milliseconds(state.config.webhook_late_arrival_warn_ms),
    };

    let outcome = {
        let conn = state.db.lock().await;
        ingress::run_gate(&conn, &state.killswitch, &gate_config, &event)?
    };

    match outcome {
        Outcome::Drop { reason } => {
            info!(reason, event_type = %event.event_type, "webhook dropped at ingress gate");
        }
        Outcome::Dispatch { internal_event_id, task_id } => {
            match ingress::dispatcher_event_for(&event.event_type) {
                Some(msm_event) => {
                    // A dispatch failure here (e.g. a post-gate race where the
                    // task's state already advanced past what this event
                    // expects) is ours to absorb, not the processor's retry
                    // policy to chew on — §4.5/§7 require 200 after ingest
                    // for everything but a signature failure.
                    if let Err(e) = saga::dispatch(
                        &state.db,
                        &state.killswitch,
                        state.provider.as_ref(),
                        &task_id,
                        msm_event,
                        &internal_event_id,
                        &SagaContext::default(),
                    )
                    .await
                    {
                        warn!(event_type = %event.event_type, %task_id, error = %e, "saga dispatch failed for an ingested webhook; absorbing rather than inviting a retry");
                    }
                }
                None => {
                    warn!(event_type = %event.event_type, %task_id, "webhook accepted but no dispatch mapping; informational only");
                }
            }
        }
    }

    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_header_name_matches_the_processor_convention() {
        assert_eq!(SIGNATURE_HEADER, "Stripe-Signature");
    }
}
