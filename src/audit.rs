//! Forensic audit writers: `MoneyEventAudit` and `AdminAction`.
//!
//! Both are append-only; nothing in this module ever issues an UPDATE or
//! DELETE. `write_money_event` is called once per saga commit (§4.2 step 4);
//! `write_admin_action` is written *before* any admin-initiated transition
//! per the MSM guard in spec.md §4.1.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderIds {
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub transfer_id: Option<String>,
    pub refund_id: Option<String>,
}

pub fn write_money_event(
    conn: &Connection,
    event_id: &str,
    task_id: &str,
    actor_id: Option<&str>,
    event_type: &str,
    previous_state: Option<&str>,
    new_state: Option<&str>,
    provider_ids: &ProviderIds,
    raw_context: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO money_event_audits
            (event_id, task_id, actor_id, event_type, previous_state, new_state, provider_ids, raw_context, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event_id,
            task_id,
            actor_id,
            event_type,
            previous_state,
            new_state,
            serde_json::to_string(provider_ids).unwrap_or_default(),
            raw_context.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn write_admin_action(
    conn: &Connection,
    admin_id: &str,
    action: &str,
    target_id: &str,
    task_id: Option<&str>,
    raw_context: &serde_json::Value,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO admin_actions (admin_id, action, target_id, task_id, raw_context, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            admin_id,
            action,
            target_id,
            task_id,
            raw_context.to_string(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Invariant 8: once a task is terminal, no subsequent audit rows may exist.
/// Exposed for the property tests in `tests/`.
pub fn count_audits_for_task(conn: &Connection, task_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM money_event_audits WHERE task_id = ?1",
        params![task_id],
        |row| row.get(0),
    )
}
