//! `POST /tasks/confirm` and `GET /tasks/{taskId}/payout-status` (§6.1).

use super::{explain, idempotency, require_idempotency_key, ApiError, AppState};
use crate::auth::models::Claims;
use crate::errors::CoreError;
use crate::ids::TimeOrderedId;
use crate::msm;
use crate::tpee::{Decision, TaskProposal, Tpee, TrustContext};
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

const CONFIRM_ENDPOINT: &str = "/tasks/confirm";

#[derive(Debug, Deserialize)]
pub struct ConfirmTaskRequest {
    pub title: String,
    pub description: String,
    pub category: String,
    pub price_cents: i64,
    pub city: String,
    #[serde(default)]
    pub trust_score: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmTaskResponse {
    pub task_id: Option<String>,
    pub decision: Decision,
    pub reason_code: String,
    pub recommended_price_cents: Option<i64>,
    pub evaluation_id: String,
    /// Candidate-worker matching lives outside this core (see DESIGN.md);
    /// always empty here.
    pub candidate_workers: Vec<String>,
}

/// Runs TPEE against the proposal and, on `Accept`, creates the `tasks` row
/// stamped with the evaluation that approved it. No escrow is opened here;
/// that's a separate call to `POST /escrow/create` once a worker is picked.
pub async fn confirm(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Json(req): Json<ConfirmTaskRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let idem_key = require_idempotency_key(&headers)?;

    if let Some((status, body)) = idempotency::lookup(&state.db, CONFIRM_ENDPOINT, &idem_key).await? {
        return Ok((status, Json(body)));
    }

    let rules = state.config.rules_for_city(&req.city).clone();
    let proposal = TaskProposal {
        title: req.title.clone(),
        description: req.description.clone(),
        category: req.category.clone(),
        price_cents: req.price_cents,
        poster_id: Some(claims.sub.clone()),
        city: req.city.clone(),
    };
    let trust = req.trust_score.map(|trust_score| TrustContext { trust_score });
    let tpee = Tpee {
        shadow_mode: state.config.tpee_shadow_mode,
        velocity: &state.velocity,
    };
    let result = tpee.evaluate(&proposal, &rules, trust.as_ref());

    let task_id = if result.decision == Decision::Accept {
        let id = TimeOrderedId::generate().to_string();
        let conn = state.db.lock().await;
        conn.execute(
            "INSERT INTO tasks (id, poster_id, worker_id, title, description, category, price_cents,
                city, tpee_evaluation_id, tpee_decision, tpee_reason_code, tpee_confidence,
                policy_snapshot_id, created_at)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                id,
                claims.sub,
                req.title,
                req.description,
                req.category,
                req.price_cents,
                req.city,
                result.evaluation_id,
                format!("{:?}", result.decision).to_uppercase(),
                result.reason_code,
                result.confidence,
                result.policy_version,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Some(id)
    } else {
        None
    };

    let status = match result.decision {
        Decision::Accept => StatusCode::CREATED,
        Decision::Adjust => StatusCode::OK,
        Decision::Block => StatusCode::UNPROCESSABLE_ENTITY,
    };
    let body = serde_json::to_value(ConfirmTaskResponse {
        task_id,
        decision: result.decision,
        reason_code: result.reason_code,
        recommended_price_cents: result.recommended_price_cents,
        evaluation_id: result.evaluation_id,
        candidate_workers: vec![],
    })
    .expect("ConfirmTaskResponse always serializes");

    idempotency::store(&state.db, CONFIRM_ENDPOINT, &idem_key, status, &body).await?;
    Ok((status, Json(body)))
}

pub async fn payout_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = state.db.lock().await;

    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
        params![task_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(ApiError(CoreError::NotFound(format!("task {task_id}"))));
    }

    let current_state = msm::load_lock(&conn, &task_id)?
        .map(|lock| lock.current_state)
        .unwrap_or(msm::State::Open);

    let blocking_reason: Option<String> = conn
        .query_row(
            "SELECT reason FROM disputes WHERE task_id = ?1 AND status IN ('pending', 'under_review')
             ORDER BY created_at DESC LIMIT 1",
            params![task_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    let explanation = explain::explain(current_state, blocking_reason.as_deref());
    Ok(Json(serde_json::json!({
        "taskId": task_id,
        "state": current_state.as_str(),
        "headline": explanation.headline,
        "detail": explanation.detail,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[tokio::test]
    async fn payout_status_404s_for_unknown_task() {
        let db = Db::open_in_memory().unwrap();
        let err = {
            let conn = db.lock().await;
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
                    params!["does-not-exist"],
                    |row| row.get(0),
                )
                .unwrap();
            exists
        };
        assert!(!err);
    }

    #[test]
    fn explanation_mentions_open_state_for_fresh_task() {
        let e = explain::explain(msm::State::Open, None);
        assert_eq!(e.headline, "Awaiting escrow");
    }
}
