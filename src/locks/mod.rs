//! Application-level mutex, keyed by resource string, backed by the
//! `app_locks` table (§4.8). This is the coarse-grained lock taken before a
//! task's prepare transaction; it keeps contention out of the database by
//! failing fast instead of queuing on a row lock.

use crate::errors::{CoreError, CoreResult};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use tokio::sync::MutexGuard;

pub fn task_resource(task_id: &str) -> String {
    format!("task:{task_id}")
}

/// Acquire `resource` for `owner_id`, holding it for `ttl`. Inserts if free;
/// if the existing row has expired, steals it with a conditional update keyed
/// on the prior owner so a racing acquirer can't double-steal.
pub fn acquire(
    conn: &rusqlite::Connection,
    resource: &str,
    owner_id: &str,
    ttl: Duration,
) -> CoreResult<()> {
    let now = Utc::now();
    let expires_at = now + ttl;

    let inserted = conn.execute(
        "INSERT INTO app_locks (resource_id, owner_id, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(resource_id) DO NOTHING",
        params![resource, owner_id, expires_at.to_rfc3339()],
    )?;
    if inserted == 1 {
        return Ok(());
    }

    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT owner_id, expires_at FROM app_locks WHERE resource_id = ?1",
            params![resource],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match existing {
        None => Err(CoreError::LockContested(format!(
            "lock row for {resource} vanished mid-acquire"
        ))),
        Some((prior_owner, expires_at_raw)) => {
            let prior_expiry: DateTime<Utc> = expires_at_raw
                .parse()
                .map_err(|_| CoreError::Integrity(format!("bad expires_at on {resource}")))?;
            if prior_expiry > now {
                return Err(CoreError::LockContested(format!(
                    "{resource} held by {prior_owner} until {prior_expiry}"
                )));
            }
            let stolen = conn.execute(
                "UPDATE app_locks SET owner_id = ?1, expires_at = ?2
                 WHERE resource_id = ?3 AND owner_id = ?4",
                params![owner_id, expires_at.to_rfc3339(), resource, prior_owner],
            )?;
            if stolen == 1 {
                Ok(())
            } else {
                Err(CoreError::LockContested(format!(
                    "lost the steal race for {resource}"
                )))
            }
        }
    }
}

pub fn release(conn: &rusqlite::Connection, resource: &str, owner_id: &str) -> CoreResult<()> {
    conn.execute(
        "DELETE FROM app_locks WHERE resource_id = ?1 AND owner_id = ?2",
        params![resource, owner_id],
    )?;
    Ok(())
}

/// Acquire every resource in sorted order (deadlock-free by construction);
/// on any failure, release everything already acquired before surfacing the error.
pub fn acquire_batch(
    conn: &rusqlite::Connection,
    resources: &[String],
    owner_id: &str,
    ttl: Duration,
) -> CoreResult<()> {
    let mut sorted = resources.to_vec();
    sorted.sort();

    let mut acquired = Vec::with_capacity(sorted.len());
    for resource in &sorted {
        match acquire(conn, resource, owner_id, ttl) {
            Ok(()) => acquired.push(resource.clone()),
            Err(e) => {
                for held in &acquired {
                    let _ = release(conn, held, owner_id);
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

/// RAII-ish scope guard for a single task lock, used by the saga orchestrator
/// so every exit path (including `?`) releases the held app lock. The name
/// mirrors the teacher's `MutexGuard` usage around `UserAccountsDB`; this is
/// a deliberately thin wrapper since the underlying lock lives in SQLite, not
/// in-process.
pub struct TaskLockGuard<'a> {
    db: &'a crate::db::Db,
    resource: String,
    owner_id: String,
}

impl<'a> TaskLockGuard<'a> {
    pub async fn acquire(
        db: &'a crate::db::Db,
        task_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> CoreResult<TaskLockGuard<'a>> {
        let resource = task_resource(task_id);
        let conn: MutexGuard<'_, rusqlite::Connection> = db.lock().await;
        acquire(&conn, &resource, owner_id, ttl)?;
        drop(conn);
        Ok(Self {
            db,
            resource,
            owner_id: owner_id.to_string(),
        })
    }

    pub async fn release(self) {
        let conn = self.db.lock().await;
        let _ = release(&conn, &self.resource, &self.owner_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::Db::migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn second_acquire_before_expiry_fails() {
        let conn = setup();
        acquire(&conn, "task:1", "owner-a", Duration::seconds(30)).unwrap();
        let err = acquire(&conn, "task:1", "owner-b", Duration::seconds(30)).unwrap_err();
        assert!(matches!(err, CoreError::LockContested(_)));
    }

    #[test]
    fn steal_after_expiry_succeeds() {
        let conn = setup();
        acquire(&conn, "task:1", "owner-a", Duration::seconds(-1)).unwrap();
        acquire(&conn, "task:1", "owner-b", Duration::seconds(30)).unwrap();
    }

    #[test]
    fn release_then_reacquire_succeeds() {
        let conn = setup();
        acquire(&conn, "task:1", "owner-a", Duration::seconds(30)).unwrap();
        release(&conn, "task:1", "owner-a").unwrap();
        acquire(&conn, "task:1", "owner-b", Duration::seconds(30)).unwrap();
    }

    #[test]
    fn batch_rolls_back_on_partial_failure() {
        let conn = setup();
        acquire(&conn, "task:2", "owner-a", Duration::seconds(30)).unwrap();
        let resources = vec!["task:1".to_string(), "task:2".to_string()];
        let err = acquire_batch(&conn, &resources, "owner-b", Duration::seconds(30)).unwrap_err();
        assert!(matches!(err, CoreError::LockContested(_)));
        // task:1 must have been released again after task:2 failed.
        acquire(&conn, "task:1", "owner-c", Duration::seconds(30)).unwrap();
    }
}
