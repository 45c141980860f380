//! `/admin/*` (§6.1): gated on the `admin` JWT claim by the `require_admin`
//! layer in `super::router`. No DB role field is ever consulted.

use super::{idempotency, require_idempotency_key, ApiError, AppState};
use crate::auth::models::Claims;
use crate::errors::CoreError;
use crate::msm::Event;
use crate::saga::SagaContext;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;

struct DisputeRow {
    task_id: String,
    status: String,
}

fn load_open_dispute(conn: &rusqlite::Connection, dispute_id: &str) -> Result<DisputeRow, ApiError> {
    conn.query_row(
        "SELECT task_id, status FROM disputes WHERE id = ?1",
        params![dispute_id],
        |row| {
            Ok(DisputeRow {
                task_id: row.get(0)?,
                status: row.get(1)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| ApiError(CoreError::NotFound(format!("dispute {dispute_id}"))))
}

#[derive(Debug, Deserialize)]
pub struct ResolveDisputeRequest {
    /// `"refund"` resolves toward the poster (`RESOLVE_REFUND`, possibly
    /// split), `"uphold"` resolves toward the worker (`RESOLVE_UPHOLD`).
    pub resolution: DisputeResolution,
    #[serde(default)]
    pub refund_split_cents: Option<i64>,
    #[serde(default)]
    pub release_split_cents: Option<i64>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    Refund,
    Uphold,
}

/// `POST /admin/disputes/{id}/resolve`. Writes the `RESOLVE_*` event through
/// the saga and then marks the dispute row resolved; `msm`'s guard for
/// `RESOLVE_*` requires a dispute already sitting in `pending`/`under_review`
/// so that ordering can't be skipped (a resolved dispute can't be resolved
/// twice).
pub async fn resolve_dispute(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Path(dispute_id): Path<String>,
    Json(req): Json<ResolveDisputeRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    const ENDPOINT: &str = "/admin/disputes/resolve";
    let idem_key = require_idempotency_key(&headers)?;
    if let Some((status, body)) = idempotency::lookup(&state.db, ENDPOINT, &idem_key).await? {
        return Ok((status, Json(body)));
    }

    let dispute = {
        let conn = state.db.lock().await;
        load_open_dispute(&conn, &dispute_id)?
    };
    if !matches!(dispute.status.as_str(), "pending" | "under_review") {
        return Err(ApiError(CoreError::Validation(format!(
            "dispute {dispute_id} is already resolved"
        ))));
    }

    let (poster_id, worker_id, price_cents) = {
        let conn = state.db.lock().await;
        conn.query_row(
            "SELECT poster_id, worker_id, price_cents FROM tasks WHERE id = ?1",
            params![dispute.task_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?, row.get::<_, i64>(2)?)),
        )?
    };

    let event = match req.resolution {
        DisputeResolution::Refund => Event::ResolveRefund,
        DisputeResolution::Uphold => Event::ResolveUphold,
    };

    let ctx = SagaContext {
        poster_id,
        worker_id,
        price_cents,
        actor_id: Some(claims.sub.clone()),
        admin_id: Some(claims.sub.clone()),
        refund_split_cents: req.refund_split_cents,
        release_split_cents: req.release_split_cents,
        fee_bps: state.config.platform_fee_bps,
        payouts_enabled: state.config.payouts_enabled,
        ..Default::default()
    };

    let outcome = crate::saga::dispatch(
        &state.db,
        &state.killswitch,
        state.provider.as_ref(),
        &dispute.task_id,
        event,
        &idem_key,
        &ctx,
    )
    .await?;

    let resolved_status = match req.resolution {
        DisputeResolution::Refund => "resolved_refund",
        DisputeResolution::Uphold => "resolved_uphold",
    };
    {
        let conn = state.db.lock().await;
        conn.execute(
            "UPDATE disputes SET status = ?1, resolved_at = ?2 WHERE id = ?3",
            params![resolved_status, chrono::Utc::now().to_rfc3339(), dispute_id],
        )?;
    }

    let body = serde_json::json!({
        "taskId": dispute.task_id,
        "disputeId": dispute_id,
        "state": outcome.state.as_str(),
        "duplicate": outcome.duplicate,
    });
    idempotency::store(&state.db, ENDPOINT, &idem_key, StatusCode::OK, &body).await?;
    Ok((StatusCode::OK, Json(body)))
}
