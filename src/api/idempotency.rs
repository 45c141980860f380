//! HTTP-layer idempotency cache (§6.1.b).
//!
//! Distinct from the saga's own `processed_events` idempotency: that one
//! guarantees a money event is applied once. This one guarantees a caller
//! who retries an HTTP request (same endpoint, same `Idempotency-Key`)
//! before the first attempt reaches the saga gets back the exact same
//! response instead of re-running validation or re-evaluating TPEE.

use crate::db::Db;
use crate::errors::CoreResult;
use axum::http::StatusCode;
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};

const TTL_HOURS: i64 = 24;

pub async fn lookup(
    db: &Db,
    endpoint: &str,
    key: &str,
) -> CoreResult<Option<(StatusCode, serde_json::Value)>> {
    let conn = db.lock().await;
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT status_code, body_json FROM idempotency_responses
             WHERE endpoint = ?1 AND idempotency_key = ?2",
            params![endpoint, key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    Ok(row.and_then(|(status, body)| {
        let status = StatusCode::from_u16(status as u16).ok()?;
        let body = serde_json::from_str(&body).ok()?;
        Some((status, body))
    }))
}

pub async fn store(
    db: &Db,
    endpoint: &str,
    key: &str,
    status: StatusCode,
    body: &serde_json::Value,
) -> CoreResult<()> {
    let conn = db.lock().await;
    let cutoff = (Utc::now() - Duration::hours(TTL_HOURS)).to_rfc3339();
    conn.execute(
        "DELETE FROM idempotency_responses WHERE created_at < ?1",
        params![cutoff],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO idempotency_responses
            (endpoint, idempotency_key, status_code, body_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            endpoint,
            key,
            status.as_u16() as i64,
            body.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_replays_a_response() {
        let db = Db::open_in_memory().unwrap();
        let body = serde_json::json!({"ok": true});
        assert!(lookup(&db, "/escrow/create", "key-1").await.unwrap().is_none());

        store(&db, "/escrow/create", "key-1", StatusCode::OK, &body)
            .await
            .unwrap();

        let replayed = lookup(&db, "/escrow/create", "key-1").await.unwrap().unwrap();
        assert_eq!(replayed.0, StatusCode::OK);
        assert_eq!(replayed.1, body);
    }

    #[tokio::test]
    async fn keys_are_scoped_per_endpoint() {
        let db = Db::open_in_memory().unwrap();
        let body = serde_json::json!({"ok": true});
        store(&db, "/escrow/create", "key-1", StatusCode::OK, &body)
            .await
            .unwrap();

        assert!(lookup(&db, "/tasks/approve", "key-1").await.unwrap().is_none());
    }
}
