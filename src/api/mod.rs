//! HTTP surface (§6.1): thin handlers over `saga::dispatch`, `msm::load_lock`
//! and `tpee::Tpee::evaluate`. No business logic lives here; a handler's job
//! is request validation, actor-identity checks against the `Claims` the
//! auth middleware already verified, and mapping `CoreError` to a response.

pub mod admin;
pub mod escrow;
pub mod explain;
pub mod idempotency;
pub mod tasks;
pub mod webhooks;

use crate::config::Config;
use crate::db::Db;
use crate::errors::CoreError;
use crate::killswitch::KillSwitch;
use crate::provider::PaymentProvider;
use crate::tpee::VelocityTracker;
use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Db>,
    pub killswitch: Arc<KillSwitch>,
    pub provider: Arc<dyn PaymentProvider>,
    pub config: Arc<Config>,
    pub velocity: Arc<VelocityTracker>,
}

/// Wraps a `CoreError` for the HTTP boundary. Status comes straight from
/// `CoreError::http_status`; the body carries the stable reason code so
/// callers can branch on it without parsing the message string.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        ApiError(e)
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError(CoreError::from(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        let body = Json(serde_json::json!({
            "error": self.0.reason_code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Every mutating endpoint requires an `Idempotency-Key` header (§6.1.b);
/// GETs and the webhook intake (which has its own idempotency, the
/// `processed_events` table) don't call this.
pub fn require_idempotency_key(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| ApiError(CoreError::Validation("missing Idempotency-Key header".into())))
}

/// Admin claim gate, same shape as `auth::middleware::require_admin_middleware`
/// but scoped to this router so it can sit alongside the unconditional
/// `auth_middleware` layer applied in `main.rs`.
pub async fn require_admin(
    req: Request,
    next: axum::middleware::Next,
) -> Result<Response, ApiError> {
    let is_admin = req
        .extensions()
        .get::<crate::auth::models::Claims>()
        .map(|c| c.admin)
        .unwrap_or(false);
    if !is_admin {
        return Err(ApiError(CoreError::Unauthorized(
            "admin claim required".into(),
        )));
    }
    Ok(next.run(req).await)
}

/// Routes that sit behind `auth_middleware` (applied by `main.rs`): every
/// endpoint here reads `Extension<Claims>`. `financial_limiter`/
/// `admin_limiter` are the two rate-limit tiers from SPEC_FULL §6.2.a (5/min,
/// 10/min) layered on their respective route groups.
pub fn protected_router(
    state: AppState,
    financial_limiter: crate::middleware::rate_limit::RateLimitLayer,
    admin_limiter: crate::middleware::rate_limit::RateLimitLayer,
) -> Router {
    let admin_routes = Router::new()
        .route(
            "/admin/disputes/:id/resolve",
            post(admin::resolve_dispute),
        )
        .layer(from_fn(require_admin))
        .layer(from_fn_with_state(
            admin_limiter,
            crate::middleware::rate_limit::rate_limit_middleware,
        ));

    let financial_routes = Router::new()
        .route("/tasks/confirm", post(tasks::confirm))
        .route("/tasks/:taskId/payout-status", get(tasks::payout_status))
        .route("/escrow/create", post(escrow::create))
        .route("/tasks/:taskId/approve", post(escrow::approve))
        .route("/tasks/:taskId/reject", post(escrow::reject))
        .route("/escrow/:taskId/refund", post(escrow::refund))
        .layer(from_fn_with_state(
            financial_limiter,
            crate::middleware::rate_limit::rate_limit_middleware,
        ));

    Router::new()
        .merge(financial_routes)
        .merge(admin_routes)
        .with_state(state)
}

/// Routes that must stay reachable without a user JWT: the payment
/// processor signs its own requests (`ingress::verify_signature`), it
/// doesn't carry one.
pub fn public_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/payments", post(webhooks::receive))
        .route("/healthz", get(health))
        .with_state(state)
}

pub fn health() -> StatusCode {
    StatusCode::OK
}
