//! Money State Machine (§4.1): the authoritative per-task escrow lifecycle.
//!
//! The transition table and guards live here; the saga orchestrator
//! (`crate::saga`) is what actually wraps a call into the prepare/execute/commit
//! protocol. `validate_transition` is run inside the prepare DB tx; `apply_transition`
//! is run inside the commit DB tx, once the provider side effect is known.

use crate::errors::{CoreError, CoreResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Open,
    Held,
    Released,
    PendingDispute,
    Refunded,
    Completed,
    Upheld,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Open => "open",
            State::Held => "held",
            State::Released => "released",
            State::PendingDispute => "pending_dispute",
            State::Refunded => "refunded",
            State::Completed => "completed",
            State::Upheld => "upheld",
        }
    }

    pub fn parse(raw: &str) -> CoreResult<Self> {
        Ok(match raw {
            "open" => State::Open,
            "held" => State::Held,
            "released" => State::Released,
            "pending_dispute" => State::PendingDispute,
            "refunded" => State::Refunded,
            "completed" => State::Completed,
            "upheld" => State::Upheld,
            other => return Err(CoreError::Integrity(format!("unknown MSM state {other}"))),
        })
    }

    /// Invariant 8: terminal states accept no further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Refunded | State::Completed | State::Upheld)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    HoldEscrow,
    ReleasePayout,
    RefundEscrow,
    DisputeOpen,
    ResolveRefund,
    ResolveUphold,
    WebhookPayoutPaid,
    ForceRefund,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::HoldEscrow => "HOLD_ESCROW",
            Event::ReleasePayout => "RELEASE_PAYOUT",
            Event::RefundEscrow => "REFUND_ESCROW",
            Event::DisputeOpen => "DISPUTE_OPEN",
            Event::ResolveRefund => "RESOLVE_REFUND",
            Event::ResolveUphold => "RESOLVE_UPHOLD",
            Event::WebhookPayoutPaid => "WEBHOOK_PAYOUT_PAID",
            Event::ForceRefund => "FORCE_REFUND",
        }
    }

    pub fn parse(raw: &str) -> CoreResult<Self> {
        Ok(match raw {
            "HOLD_ESCROW" => Event::HoldEscrow,
            "RELEASE_PAYOUT" => Event::ReleasePayout,
            "REFUND_ESCROW" => Event::RefundEscrow,
            "DISPUTE_OPEN" => Event::DisputeOpen,
            "RESOLVE_REFUND" => Event::ResolveRefund,
            "RESOLVE_UPHOLD" => Event::ResolveUphold,
            "WEBHOOK_PAYOUT_PAID" => Event::WebhookPayoutPaid,
            "FORCE_REFUND" => Event::ForceRefund,
            other => return Err(CoreError::Validation(format!("unknown MSM event {other}"))),
        })
    }

    pub fn is_admin_initiated(&self) -> bool {
        matches!(self, Event::ResolveRefund | Event::ResolveUphold | Event::ForceRefund)
    }
}

const TRANSITIONS: &[(State, Event, State)] = &[
    (State::Open, Event::HoldEscrow, State::Held),
    (State::Held, Event::ReleasePayout, State::Released),
    (State::Held, Event::RefundEscrow, State::Refunded),
    (State::Held, Event::DisputeOpen, State::PendingDispute),
    (State::PendingDispute, Event::ResolveRefund, State::Refunded),
    (State::PendingDispute, Event::ResolveUphold, State::Upheld),
    (State::Released, Event::WebhookPayoutPaid, State::Completed),
    (State::Released, Event::ForceRefund, State::Refunded),
];

pub fn next_state(from: State, event: Event) -> Option<State> {
    TRANSITIONS
        .iter()
        .find(|(s, e, _)| *s == from && *e == event)
        .map(|(_, _, to)| *to)
}

/// The set of events valid from `state`, stored on the lock row so readers
/// don't need to re-derive it from the transition table.
pub fn allowed_events(state: State) -> HashSet<Event> {
    TRANSITIONS
        .iter()
        .filter(|(s, _, _)| *s == state)
        .map(|(_, e, _)| *e)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ProviderIdPatch {
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub transfer_id: Option<String>,
    pub refund_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MoneyStateLock {
    pub task_id: String,
    pub current_state: State,
    pub payment_intent_id: Option<String>,
    pub charge_id: Option<String>,
    pub transfer_id: Option<String>,
    pub refund_id: Option<String>,
    pub version: i64,
}

/// Guard/validation context threaded through from the HTTP or webhook layer.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub actor_id: Option<String>,
    pub admin_id: Option<String>,
}

pub fn load_lock(conn: &Connection, task_id: &str) -> CoreResult<Option<MoneyStateLock>> {
    conn.query_row(
        "SELECT task_id, current_state, payment_intent_id, charge_id, transfer_id, refund_id, version
         FROM money_state_locks WHERE task_id = ?1",
        params![task_id],
        |row| {
            Ok(MoneyStateLock {
                task_id: row.get(0)?,
                current_state: State::parse(&row.get::<_, String>(1)?)
                    .unwrap_or(State::Open),
                payment_intent_id: row.get(2)?,
                charge_id: row.get(3)?,
                transfer_id: row.get(4)?,
                refund_id: row.get(5)?,
                version: row.get(6)?,
            })
        },
    )
    .optional()
    .map_err(CoreError::from)
}

fn current_state(conn: &Connection, task_id: &str) -> CoreResult<State> {
    Ok(load_lock(conn, task_id)?
        .map(|l| l.current_state)
        .unwrap_or(State::Open))
}

/// Run inside the prepare DB transaction: validates the transition table
/// entry and every guard in §4.1. Returns the state the task would move to.
pub fn validate_transition(
    conn: &Connection,
    task_id: &str,
    event: Event,
    ctx: &EventContext,
) -> CoreResult<State> {
    let from = current_state(conn, task_id)?;

    if from.is_terminal() {
        return Err(CoreError::InvalidTransition {
            from: from.as_str().to_string(),
            event: event.as_str().to_string(),
        });
    }

    let to = next_state(from, event).ok_or_else(|| CoreError::InvalidTransition {
        from: from.as_str().to_string(),
        event: event.as_str().to_string(),
    })?;

    run_guards(conn, task_id, event, ctx)?;

    Ok(to)
}

fn run_guards(
    conn: &Connection,
    task_id: &str,
    event: Event,
    ctx: &EventContext,
) -> CoreResult<()> {
    let open_dispute_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM disputes WHERE task_id = ?1 AND status NOT IN ('resolved_refund', 'resolved_uphold'))",
        params![task_id],
        |row| row.get(0),
    )?;

    if event == Event::ReleasePayout && open_dispute_exists {
        return Err(CoreError::BlockedByGuard(
            "cannot release payout while a dispute is open".into(),
        ));
    }

    if matches!(event, Event::ResolveRefund | Event::ResolveUphold) {
        let resolvable: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM disputes WHERE task_id = ?1 AND status IN ('pending', 'under_review'))",
            params![task_id],
            |row| row.get(0),
        )?;
        if !resolvable {
            return Err(CoreError::BlockedByGuard(
                "no resolvable dispute exists for this task".into(),
            ));
        }
    }

    if matches!(event, Event::ReleasePayout | Event::ResolveUphold) {
        let worker_assigned: bool = conn.query_row(
            "SELECT worker_id IS NOT NULL FROM tasks WHERE id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        if !worker_assigned {
            return Err(CoreError::BlockedByGuard(
                "no worker is assigned to this task".into(),
            ));
        }
    }

    if event.is_admin_initiated() {
        let admin_id = ctx
            .admin_id
            .as_deref()
            .ok_or_else(|| CoreError::Validation("admin-initiated event requires an admin_id".into()))?;

        let (poster_id, worker_id): (String, Option<String>) = conn.query_row(
            "SELECT poster_id, worker_id FROM tasks WHERE id = ?1",
            params![task_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if admin_id == poster_id || worker_id.as_deref() == Some(admin_id) {
            return Err(CoreError::BlockedByGuard(
                "admin must not be the task's own poster or worker".into(),
            ));
        }
    }

    Ok(())
}

/// Run inside the commit DB transaction: creates the lock row on the task's
/// first `HOLD_ESCROW`, otherwise bumps `version` and advances state.
/// Provider IDs are merged with COALESCE semantics — never overwritten once set.
pub fn apply_transition(
    conn: &Connection,
    task_id: &str,
    to: State,
    patch: &ProviderIdPatch,
) -> CoreResult<()> {
    let next_allowed: Vec<&str> = allowed_events(to).iter().map(|e| e.as_str()).collect();
    let next_allowed_json = serde_json::to_string(&next_allowed).unwrap_or_else(|_| "[]".into());
    let now = Utc::now().to_rfc3339();

    let existing = load_lock(conn, task_id)?;
    match existing {
        None => {
            conn.execute(
                "INSERT INTO money_state_locks
                    (task_id, current_state, next_allowed_events, payment_intent_id, charge_id, transfer_id, refund_id, version, last_transition_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
                params![
                    task_id,
                    to.as_str(),
                    next_allowed_json,
                    patch.payment_intent_id,
                    patch.charge_id,
                    patch.transfer_id,
                    patch.refund_id,
                    now,
                ],
            )?;
        }
        Some(lock) => {
            conn.execute(
                "UPDATE money_state_locks SET
                    current_state = ?1,
                    next_allowed_events = ?2,
                    payment_intent_id = COALESCE(payment_intent_id, ?3),
                    charge_id = COALESCE(charge_id, ?4),
                    transfer_id = COALESCE(transfer_id, ?5),
                    refund_id = COALESCE(refund_id, ?6),
                    version = version + 1,
                    last_transition_at = ?7
                 WHERE task_id = ?8 AND version = ?9",
                params![
                    to.as_str(),
                    next_allowed_json,
                    patch.payment_intent_id,
                    patch.charge_id,
                    patch.transfer_id,
                    patch.refund_id,
                    now,
                    task_id,
                    lock.version,
                ],
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_spec() {
        assert_eq!(next_state(State::Open, Event::HoldEscrow), Some(State::Held));
        assert_eq!(next_state(State::Held, Event::ReleasePayout), Some(State::Released));
        assert_eq!(next_state(State::Held, Event::RefundEscrow), Some(State::Refunded));
        assert_eq!(next_state(State::Held, Event::DisputeOpen), Some(State::PendingDispute));
        assert_eq!(next_state(State::PendingDispute, Event::ResolveRefund), Some(State::Refunded));
        assert_eq!(next_state(State::PendingDispute, Event::ResolveUphold), Some(State::Upheld));
        assert_eq!(next_state(State::Released, Event::WebhookPayoutPaid), Some(State::Completed));
        assert_eq!(next_state(State::Released, Event::ForceRefund), Some(State::Refunded));
    }

    #[test]
    fn unlisted_pairs_are_rejected() {
        assert_eq!(next_state(State::Open, Event::ReleasePayout), None);
        assert_eq!(next_state(State::Completed, Event::ForceRefund), None);
    }

    #[test]
    fn terminal_states_are_correctly_flagged() {
        assert!(State::Refunded.is_terminal());
        assert!(State::Completed.is_terminal());
        assert!(State::Upheld.is_terminal());
        assert!(!State::Held.is_terminal());
        assert!(!State::PendingDispute.is_terminal());
    }

    fn setup_task(conn: &Connection, task_id: &str, poster: &str, worker: Option<&str>) {
        crate::db::Db::migrate(conn).unwrap();
        conn.execute(
            "INSERT INTO tasks (id, poster_id, worker_id, title, description, category, price_cents, city, created_at)
             VALUES (?1, ?2, ?3, 't', 'desc desc desc', 'cleaning', 1000, 'testville', ?4)",
            params![task_id, poster, worker, Utc::now().to_rfc3339()],
        )
        .unwrap();
    }

    #[test]
    fn validate_hold_escrow_from_fresh_task() {
        let conn = Connection::open_in_memory().unwrap();
        setup_task(&conn, "task1", "poster1", None);
        let to = validate_transition(&conn, "task1", Event::HoldEscrow, &EventContext::default()).unwrap();
        assert_eq!(to, State::Held);
    }

    #[test]
    fn release_payout_blocked_without_worker() {
        let conn = Connection::open_in_memory().unwrap();
        setup_task(&conn, "task1", "poster1", None);
        apply_transition(&conn, "task1", State::Held, &ProviderIdPatch::default()).unwrap();
        let err = validate_transition(&conn, "task1", Event::ReleasePayout, &EventContext::default()).unwrap_err();
        assert!(matches!(err, CoreError::BlockedByGuard(_)));
    }

    #[test]
    fn release_payout_blocked_with_open_dispute() {
        let conn = Connection::open_in_memory().unwrap();
        setup_task(&conn, "task1", "poster1", Some("worker1"));
        apply_transition(&conn, "task1", State::Held, &ProviderIdPatch::default()).unwrap();
        conn.execute(
            "INSERT INTO disputes (id, task_id, status, opened_by, created_at) VALUES ('d1', 'task1', 'pending', 'worker1', ?1)",
            params![Utc::now().to_rfc3339()],
        )
        .unwrap();
        let err = validate_transition(&conn, "task1", Event::ReleasePayout, &EventContext::default()).unwrap_err();
        assert!(matches!(err, CoreError::BlockedByGuard(_)));
    }

    #[test]
    fn admin_event_rejects_conflict_of_interest() {
        let conn = Connection::open_in_memory().unwrap();
        setup_task(&conn, "task1", "poster1", Some("worker1"));
        apply_transition(&conn, "task1", State::Held, &ProviderIdPatch::default()).unwrap();
        conn.execute(
            "INSERT INTO disputes (id, task_id, status, opened_by, created_at) VALUES ('d1', 'task1', 'pending', 'worker1', ?1)",
            params![Utc::now().to_rfc3339()],
        )
        .unwrap();
        apply_transition(&conn, "task1", State::PendingDispute, &ProviderIdPatch::default()).unwrap();

        let ctx = EventContext { admin_id: Some("poster1".into()), actor_id: None };
        let err = validate_transition(&conn, "task1", Event::ResolveRefund, &ctx).unwrap_err();
        assert!(matches!(err, CoreError::BlockedByGuard(_)));
    }

    #[test]
    fn terminal_state_rejects_any_event() {
        let conn = Connection::open_in_memory().unwrap();
        setup_task(&conn, "task1", "poster1", Some("worker1"));
        apply_transition(&conn, "task1", State::Refunded, &ProviderIdPatch::default()).unwrap();
        let err = validate_transition(&conn, "task1", Event::HoldEscrow, &EventContext::default()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }
}
