//! `/escrow/*` and the poster-facing task lifecycle actions (§6.1). Every
//! handler here is a thin wrapper: load the task row for the actor check,
//! build a `SagaContext`, hand off to `saga::dispatch`.

use super::{idempotency, require_idempotency_key, ApiError, AppState};
use crate::auth::models::Claims;
use crate::errors::CoreError;
use crate::msm::Event;
use crate::saga::{self, SagaContext};
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use rusqlite::{params, OptionalExtension};
use serde::Deserialize;

struct TaskRow {
    poster_id: String,
    worker_id: Option<String>,
    price_cents: i64,
}

fn load_task(conn: &rusqlite::Connection, task_id: &str) -> Result<TaskRow, ApiError> {
    conn.query_row(
        "SELECT poster_id, worker_id, price_cents FROM tasks WHERE id = ?1",
        params![task_id],
        |row| {
            Ok(TaskRow {
                poster_id: row.get(0)?,
                worker_id: row.get(1)?,
                price_cents: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| ApiError(CoreError::NotFound(format!("task {task_id}"))))
}

async fn dispatch_and_respond(
    state: &AppState,
    endpoint: &str,
    idem_key: &str,
    task_id: &str,
    event: Event,
    ctx: &SagaContext,
) -> Result<(StatusCode, serde_json::Value), ApiError> {
    let outcome = saga::dispatch(
        &state.db,
        &state.killswitch,
        state.provider.as_ref(),
        task_id,
        event,
        idem_key,
        ctx,
    )
    .await?;

    let body = serde_json::json!({
        "taskId": task_id,
        "state": outcome.state.as_str(),
        "duplicate": outcome.duplicate,
    });
    idempotency::store(&state.db, endpoint, idem_key, StatusCode::OK, &body).await?;
    Ok((StatusCode::OK, body))
}

#[derive(Debug, Deserialize)]
pub struct CreateEscrowRequest {
    pub task_id: String,
    pub worker_id: String,
    pub amount_cents: i64,
    pub payment_method_id: String,
}

/// `POST /escrow/create` — poster only. Assigns the worker and moves the
/// task from `open` to `held`.
pub async fn create(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Json(req): Json<CreateEscrowRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    const ENDPOINT: &str = "/escrow/create";
    let idem_key = require_idempotency_key(&headers)?;
    if let Some((status, body)) = idempotency::lookup(&state.db, ENDPOINT, &idem_key).await? {
        return Ok((status, Json(body)));
    }

    let task = {
        let conn = state.db.lock().await;
        load_task(&conn, &req.task_id)?
    };
    if task.poster_id != claims.sub {
        return Err(ApiError(CoreError::Unauthorized(
            "only the posting user may fund escrow".into(),
        )));
    }
    if req.amount_cents != task.price_cents {
        return Err(ApiError(CoreError::Validation(
            "amount does not match the task's price".into(),
        )));
    }

    {
        let conn = state.db.lock().await;
        conn.execute(
            "UPDATE tasks SET worker_id = ?1 WHERE id = ?2",
            params![req.worker_id, req.task_id],
        )?;
    }

    let ctx = SagaContext {
        poster_id: task.poster_id.clone(),
        worker_id: Some(req.worker_id.clone()),
        price_cents: req.amount_cents,
        payment_method_id: Some(req.payment_method_id.clone()),
        actor_id: Some(claims.sub.clone()),
        ..Default::default()
    };
    let (status, body) =
        dispatch_and_respond(&state, ENDPOINT, &idem_key, &req.task_id, Event::HoldEscrow, &ctx).await?;
    Ok((status, Json(body)))
}

/// `POST /tasks/{taskId}/approve` — poster only. `held` -> `released`.
pub async fn approve(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    const ENDPOINT: &str = "/tasks/approve";
    let idem_key = require_idempotency_key(&headers)?;
    if let Some((status, body)) = idempotency::lookup(&state.db, ENDPOINT, &idem_key).await? {
        return Ok((status, Json(body)));
    }

    let task = {
        let conn = state.db.lock().await;
        load_task(&conn, &task_id)?
    };
    if task.poster_id != claims.sub {
        return Err(ApiError(CoreError::Unauthorized(
            "only the posting user may approve a task".into(),
        )));
    }

    let ctx = SagaContext {
        poster_id: task.poster_id.clone(),
        worker_id: task.worker_id.clone(),
        price_cents: task.price_cents,
        actor_id: Some(claims.sub.clone()),
        fee_bps: state.config.platform_fee_bps,
        payouts_enabled: state.config.payouts_enabled,
        ..Default::default()
    };
    let (status, body) =
        dispatch_and_respond(&state, ENDPOINT, &idem_key, &task_id, Event::ReleasePayout, &ctx).await?;
    Ok((status, Json(body)))
}

#[derive(Debug, Deserialize, Default)]
pub struct RejectTaskRequest {
    /// When set, the poster is opening a dispute instead of asking for a
    /// plain refund (e.g. the worker claims the task was completed).
    #[serde(default)]
    pub dispute_reason: Option<String>,
}

/// `POST /tasks/{taskId}/reject` — poster only. With no body, a plain
/// `REFUND_ESCROW`; with `dispute_reason` set, opens a dispute instead
/// (`DISPUTE_OPEN`), which an admin later resolves via `RESOLVE_*`.
pub async fn reject(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Option<Json<RejectTaskRequest>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    const ENDPOINT: &str = "/tasks/reject";
    let idem_key = require_idempotency_key(&headers)?;
    if let Some((status, body)) = idempotency::lookup(&state.db, ENDPOINT, &idem_key).await? {
        return Ok((status, Json(body)));
    }

    let task = {
        let conn = state.db.lock().await;
        load_task(&conn, &task_id)?
    };
    if task.poster_id != claims.sub {
        return Err(ApiError(CoreError::Unauthorized(
            "only the posting user may reject a task".into(),
        )));
    }

    let dispute_reason = body.and_then(|Json(r)| r.dispute_reason);
    let event = if dispute_reason.is_some() {
        Event::DisputeOpen
    } else {
        Event::RefundEscrow
    };

    let ctx = SagaContext {
        poster_id: task.poster_id.clone(),
        worker_id: task.worker_id.clone(),
        price_cents: task.price_cents,
        actor_id: Some(claims.sub.clone()),
        dispute_reason,
        ..Default::default()
    };
    let (status, resp) = dispatch_and_respond(&state, ENDPOINT, &idem_key, &task_id, event, &ctx).await?;
    Ok((status, Json(resp)))
}

#[derive(Debug, Deserialize, Default)]
pub struct RefundEscrowRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// `POST /escrow/{taskId}/refund` — poster may refund a `held` task
/// (`REFUND_ESCROW`); an admin may force-refund an already-`released` task
/// (`FORCE_REFUND`), which runs its compensating second leg out-of-band via
/// the DLQ (see `saga::run_force_refund_second_leg`).
pub async fn refund(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Option<Json<RefundEscrowRequest>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    const ENDPOINT: &str = "/escrow/refund";
    let idem_key = require_idempotency_key(&headers)?;
    if let Some((status, body)) = idempotency::lookup(&state.db, ENDPOINT, &idem_key).await? {
        return Ok((status, Json(body)));
    }

    let task = {
        let conn = state.db.lock().await;
        load_task(&conn, &task_id)?
    };

    let event = if claims.admin && task.poster_id != claims.sub {
        Event::ForceRefund
    } else if task.poster_id == claims.sub {
        Event::RefundEscrow
    } else {
        return Err(ApiError(CoreError::Unauthorized(
            "only the posting user, or an admin, may refund this task".into(),
        )));
    };

    let ctx = SagaContext {
        poster_id: task.poster_id.clone(),
        worker_id: task.worker_id.clone(),
        price_cents: task.price_cents,
        actor_id: Some(claims.sub.clone()),
        admin_id: if claims.admin { Some(claims.sub.clone()) } else { None },
        fee_bps: state.config.platform_fee_bps,
        ..Default::default()
    };
    let (status, resp) = dispatch_and_respond(&state, ENDPOINT, &idem_key, &task_id, event, &ctx).await?;
    Ok((status, Json(resp)))
}
