//! Global kill switch (§4.7): once active, the saga refuses to start new
//! money movement, the ledger refuses prepares, recovery loops pause, and
//! the ingress gate drops events. Only an explicit `resolve()` clears it.
//!
//! The spec calls for a "process-local boolean with a distributed-cache
//! mirror for multi-instance deployments." The teacher's stack has no cache
//! client (no redis/memcached crate anywhere in the pack for this purpose),
//! so the mirror is the shared SQLite database itself: every instance reads
//! the same `kill_switch_state` row, and the in-process `AtomicBool` is a
//! cache of that row refreshed on every check. This is the same substitution
//! principle as `db.rs`'s `BEGIN IMMEDIATE` stand-in for row locks.

use crate::errors::CoreResult;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

pub struct KillSwitch {
    cached_active: AtomicBool,
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self {
            cached_active: AtomicBool::new(false),
        }
    }
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast, process-local check. Callers on the hot path (ingress gate,
    /// saga entry) should call `refresh` periodically rather than hitting
    /// the DB on every request; `is_active` never touches the DB itself.
    pub fn is_active(&self) -> bool {
        self.cached_active.load(Ordering::SeqCst)
    }

    pub fn refresh(&self, conn: &Connection) -> CoreResult<bool> {
        let active = load_state(conn)?.map(|s| s.active).unwrap_or(false);
        self.cached_active.store(active, Ordering::SeqCst);
        Ok(active)
    }

    pub fn trigger(&self, conn: &Connection, reason: &str, metadata: &serde_json::Value) -> CoreResult<()> {
        conn.execute(
            "INSERT INTO kill_switch_state (id, active, reason, metadata, triggered_at)
             VALUES (1, 1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET active = 1, reason = excluded.reason,
                metadata = excluded.metadata, triggered_at = excluded.triggered_at",
            params![reason, metadata.to_string(), Utc::now().to_rfc3339()],
        )?;
        self.cached_active.store(true, Ordering::SeqCst);
        warn!(reason, "kill switch triggered");
        crate::metrics::record_kill_switch_trigger(reason);
        Ok(())
    }

    pub fn resolve(&self, conn: &Connection) -> CoreResult<()> {
        conn.execute(
            "UPDATE kill_switch_state SET active = 0, reason = NULL, metadata = NULL WHERE id = 1",
            [],
        )?;
        self.cached_active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct KillSwitchState {
    pub active: bool,
    pub reason: Option<String>,
    pub triggered_at: Option<String>,
}

pub fn load_state(conn: &Connection) -> CoreResult<Option<KillSwitchState>> {
    conn.query_row(
        "SELECT active, reason, triggered_at FROM kill_switch_state WHERE id = 1",
        [],
        |row| {
            Ok(KillSwitchState {
                active: row.get::<_, i64>(0)? != 0,
                reason: row.get(1)?,
                triggered_at: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(crate::errors::CoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::Db::migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn starts_inactive() {
        let conn = setup();
        let ks = KillSwitch::new();
        assert!(!ks.refresh(&conn).unwrap());
    }

    #[test]
    fn trigger_then_resolve_round_trips() {
        let conn = setup();
        let ks = KillSwitch::new();
        ks.trigger(&conn, "SAGA_RETRY_EXHAUSTION", &serde_json::json!({})).unwrap();
        assert!(ks.is_active());
        assert!(ks.refresh(&conn).unwrap());
        ks.resolve(&conn).unwrap();
        assert!(!ks.refresh(&conn).unwrap());
    }
}
