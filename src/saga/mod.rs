//! Saga Orchestrator (§4.2): the three-phase Prepare → Execute → Commit
//! coordinator between the ledger and the external payment processor.
//!
//! Grounded on the typestate saga in the pack's cashubtc-cdk swap saga: a
//! fixed phase order with compensating cleanup on the failure path, rather
//! than a generic retry-everything loop. Unlike that reference (which keeps
//! compensations in-process), durability here comes from the DB: the prepare
//! and commit phases are each one SQLite transaction, and a crash between
//! them is recovered by `crate::recovery::reaper`, not by in-memory state.

use crate::audit::{self, ProviderIds};
use crate::db::Db;
use crate::errors::{CoreError, CoreResult};
use crate::ledger::{self, AccountType, Direction, EntryInput, OwnerType, ProviderEffect};
use crate::locks;
use crate::metrics;
use crate::msm::{self, Event, EventContext, ProviderIdPatch, State};
use crate::provider::PaymentProvider;
use chrono::Duration;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct SagaContext {
    pub poster_id: String,
    pub worker_id: Option<String>,
    pub price_cents: i64,
    pub payment_method_id: Option<String>,
    pub actor_id: Option<String>,
    pub admin_id: Option<String>,
    pub dispute_reason: Option<String>,
    pub refund_split_cents: Option<i64>,
    pub release_split_cents: Option<i64>,
    /// Platform take on release, in basis points of `price_cents`
    /// (`Config::platform_fee_bps`). Zero means no fee leg is booked.
    pub fee_bps: u32,
    /// `Config::payouts_enabled` (§6.5: hard-off outside production).
    /// Defaults to `true` so every non-release event, and every existing
    /// test, is unaffected; `ReleasePayout`/`ResolveUphold` check it.
    pub payouts_enabled: bool,
}

impl Default for SagaContext {
    fn default() -> Self {
        Self {
            poster_id: String::new(),
            worker_id: None,
            price_cents: 0,
            payment_method_id: None,
            actor_id: None,
            admin_id: None,
            dispute_reason: None,
            refund_split_cents: None,
            release_split_cents: None,
            fee_bps: 0,
            payouts_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SagaOutcome {
    pub state: State,
    pub duplicate: bool,
}

const APP_LOCK_TTL_SECS: i64 = 30;

/// Entry point for every money-moving event. `event_id` must be stable
/// across retries of the same logical request (the HTTP layer derives it
/// deterministically, or carries the caller's Idempotency-Key).
pub async fn dispatch(
    db: &Db,
    killswitch: &crate::killswitch::KillSwitch,
    provider: &dyn PaymentProvider,
    task_id: &str,
    event: Event,
    event_id: &str,
    ctx: &SagaContext,
) -> CoreResult<SagaOutcome> {
    {
        let conn = db.lock().await;
        if killswitch.refresh(&conn)? {
            return Err(CoreError::KillSwitchActive(
                "new money movement is frozen".into(),
            ));
        }
        if let Some(result) = already_processed(&conn, event_id)? {
            return Ok(result);
        }
    }

    let guard = locks::TaskLockGuard::acquire(
        db,
        task_id,
        event_id,
        Duration::seconds(APP_LOCK_TTL_SECS),
    )
    .await?;

    let outcome = run_event(db, provider, task_id, event, event_id, ctx).await;

    guard.release().await;
    outcome
}

fn already_processed(
    conn: &rusqlite::Connection,
    event_id: &str,
) -> CoreResult<Option<SagaOutcome>> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT result_json FROM processed_events WHERE event_id = ?1",
            rusqlite::params![event_id],
            |row| row.get(0),
        )
        .optional_or_none()?;
    match existing {
        None => Ok(None),
        Some(raw) => {
            let state_str: String = serde_json::from_str::<serde_json::Value>(&raw)
                .ok()
                .and_then(|v| v.get("state").and_then(|s| s.as_str()).map(str::to_string))
                .unwrap_or_else(|| "open".to_string());
            Ok(Some(SagaOutcome {
                state: State::parse(&state_str).unwrap_or(State::Open),
                duplicate: true,
            }))
        }
    }
}

trait OptionalOrNone<T> {
    fn optional_or_none(self) -> CoreResult<Option<T>>;
}

impl<T> OptionalOrNone<T> for rusqlite::Result<T> {
    fn optional_or_none(self) -> CoreResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(CoreError::from(e)),
        }
    }
}

async fn run_event(
    db: &Db,
    provider: &dyn PaymentProvider,
    task_id: &str,
    event: Event,
    event_id: &str,
    ctx: &SagaContext,
) -> CoreResult<SagaOutcome> {
    if matches!(event, Event::ReleasePayout | Event::ResolveUphold) && !ctx.payouts_enabled {
        return Err(CoreError::BlockedByGuard(
            "payouts are disabled outside production".into(),
        ));
    }

    let started = Instant::now();
    let event_ctx = EventContext {
        actor_id: ctx.actor_id.clone(),
        admin_id: ctx.admin_id.clone(),
    };

    // Phase 1: Prepare (DB tx A).
    let prepared = {
        let mut conn = db.lock().await;
        let tx = Db::begin_immediate(&mut conn)?;

        if let Some(result) = already_processed(&tx, event_id)? {
            tx.commit()?;
            return Ok(result);
        }

        let to_state = msm::validate_transition(&tx, task_id, event, &event_ctx)?;

        if event.is_admin_initiated() {
            audit::write_admin_action(
                &tx,
                ctx.admin_id.as_deref().unwrap_or("unknown"),
                event.as_str(),
                task_id,
                Some(task_id),
                &serde_json::json!({ "event_id": event_id }),
            )?;
        }

        let plan = build_ledger_plan(&tx, task_id, event, ctx)?;
        let prepared_tx = match &plan {
            Some(p) => Some(ledger::prepare_transaction(
                &tx,
                &format!("ledger_{event_id}"),
                &p.type_label,
                &p.metadata,
                &p.entries,
            )?),
            None => None,
        };

        if event == Event::DisputeOpen {
            tx.execute(
                "INSERT INTO disputes (id, task_id, status, opened_by, reason, created_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
                rusqlite::params![
                    format!("dispute_{event_id}"),
                    task_id,
                    ctx.actor_id.clone().unwrap_or_default(),
                    ctx.dispute_reason,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
        }

        audit::write_money_event(
            &tx,
            event_id,
            task_id,
            ctx.actor_id.as_deref(),
            &format!("{}_PREPARE", event.as_str()),
            None,
            None,
            &ProviderIds {
                payment_intent_id: None,
                charge_id: None,
                transfer_id: None,
                refund_id: None,
            },
            &serde_json::json!({}),
        )?;

        tx.commit()?;
        (to_state, plan, prepared_tx)
    };

    let (to_state, plan, prepared_tx) = prepared;

    // Phase 2: Execute (no DB tx). Runs the provider side effect(s) for this event.
    let effect = execute_provider_step(provider, event, event_id, task_id, ctx, &plan).await?;

    // Phase 3: Commit (DB tx B).
    {
        let mut conn = db.lock().await;
        let tx = Db::begin_immediate(&mut conn)?;

        if let Some(p) = &prepared_tx {
            ledger::commit_transaction(&tx, &p.id, &effect)?;
        }

        let patch = ProviderIdPatch {
            payment_intent_id: effect.payment_intent_id.clone(),
            charge_id: effect.charge_id.clone(),
            transfer_id: effect.transfer_id.clone(),
            refund_id: effect.refund_id.clone(),
        };
        msm::apply_transition(&tx, task_id, to_state, &patch)?;

        let result_json = serde_json::json!({ "state": to_state.as_str() });
        tx.execute(
            "INSERT INTO processed_events (event_id, task_id, event_type, result_json, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                event_id,
                task_id,
                event.as_str(),
                result_json.to_string(),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;

        audit::write_money_event(
            &tx,
            event_id,
            task_id,
            ctx.actor_id.as_deref(),
            event.as_str(),
            None,
            Some(to_state.as_str()),
            &ProviderIds {
                payment_intent_id: effect.payment_intent_id.clone(),
                charge_id: effect.charge_id.clone(),
                transfer_id: effect.transfer_id.clone(),
                refund_id: effect.refund_id.clone(),
            },
            &serde_json::json!({}),
        )?;

        tx.commit()?;
    }

    metrics::record_saga_phase(event.as_str(), "commit", "ok");
    metrics::record_saga_latency_ms(event.as_str(), started.elapsed().as_secs_f64() * 1000.0);

    if event == Event::ForceRefund {
        run_force_refund_second_leg(db, provider, task_id, event_id, ctx).await?;
    }

    Ok(SagaOutcome {
        state: to_state,
        duplicate: false,
    })
}

struct LedgerPlan {
    type_label: String,
    entries: Vec<EntryInput>,
    metadata: serde_json::Value,
}

fn platform_float(conn: &rusqlite::Connection) -> CoreResult<crate::ledger::Account> {
    ledger::get_or_create_account(conn, OwnerType::Platform, "float", AccountType::Asset)
}

fn task_escrow(conn: &rusqlite::Connection, task_id: &str) -> CoreResult<crate::ledger::Account> {
    ledger::get_or_create_account(conn, OwnerType::Task, task_id, AccountType::Liability)
}

fn worker_payable(conn: &rusqlite::Connection, worker_id: &str) -> CoreResult<crate::ledger::Account> {
    ledger::get_or_create_account(conn, OwnerType::User, worker_id, AccountType::Liability)
}

fn platform_fees(conn: &rusqlite::Connection) -> CoreResult<crate::ledger::Account> {
    ledger::get_or_create_account(conn, OwnerType::Platform, "fees", AccountType::Equity)
}

/// `price_cents * fee_bps / 10_000`, clamped to `price_cents` so a
/// misconfigured fee can never exceed the amount being released.
fn fee_cents(price_cents: i64, fee_bps: u32) -> i64 {
    (price_cents * fee_bps as i64 / 10_000).min(price_cents)
}

/// Builds the ledger entries for events that move money. `DISPUTE_OPEN` and
/// `WEBHOOK_PAYOUT_PAID` return `None`: the former only records a dispute
/// row, the latter only confirms a transaction that already committed
/// (invariant 6 only requires a ledger row for transitions that move money).
fn build_ledger_plan(
    conn: &rusqlite::Connection,
    task_id: &str,
    event: Event,
    ctx: &SagaContext,
) -> CoreResult<Option<LedgerPlan>> {
    let float = platform_float(conn)?;
    let escrow = task_escrow(conn, task_id)?;

    let plan = match event {
        Event::HoldEscrow => Some(LedgerPlan {
            type_label: "hold_escrow".into(),
            entries: vec![
                EntryInput { account_id: float.id, direction: Direction::Debit, amount: ctx.price_cents },
                EntryInput { account_id: escrow.id, direction: Direction::Credit, amount: ctx.price_cents },
            ],
            metadata: serde_json::json!({ "task_id": task_id }),
        }),
        Event::ReleasePayout | Event::ResolveUphold => {
            let worker_id = ctx
                .worker_id
                .as_deref()
                .ok_or_else(|| CoreError::Validation("release requires a worker_id".into()))?;
            let worker = worker_payable(conn, worker_id)?;
            let fee = fee_cents(ctx.price_cents, ctx.fee_bps);
            let payout = ctx.price_cents - fee;

            let mut entries = vec![EntryInput {
                account_id: escrow.id,
                direction: Direction::Debit,
                amount: ctx.price_cents,
            }];
            if payout > 0 {
                entries.push(EntryInput { account_id: worker.id, direction: Direction::Credit, amount: payout });
            }
            if fee > 0 {
                let fees = platform_fees(conn)?;
                entries.push(EntryInput { account_id: fees.id, direction: Direction::Credit, amount: fee });
            }

            Some(LedgerPlan {
                type_label: if event == Event::ReleasePayout { "release_payout".into() } else { "resolve_uphold".into() },
                entries,
                metadata: serde_json::json!({ "task_id": task_id, "worker_id": worker_id, "fee_cents": fee }),
            })
        }
        Event::RefundEscrow => Some(LedgerPlan {
            type_label: "refund_escrow".into(),
            entries: vec![
                EntryInput { account_id: escrow.id, direction: Direction::Debit, amount: ctx.price_cents },
                EntryInput { account_id: float.id, direction: Direction::Credit, amount: ctx.price_cents },
            ],
            metadata: serde_json::json!({ "task_id": task_id }),
        }),
        Event::ResolveRefund => {
            let refund_amount = ctx.refund_split_cents.unwrap_or(ctx.price_cents);
            let release_amount = ctx.release_split_cents.unwrap_or(0);
            if refund_amount + release_amount != ctx.price_cents {
                return Err(CoreError::Validation(
                    "dispute split amounts must sum to the task price".into(),
                ));
            }
            let mut entries = vec![];
            if refund_amount > 0 {
                entries.push(EntryInput { account_id: escrow.id.clone(), direction: Direction::Debit, amount: refund_amount });
                entries.push(EntryInput { account_id: float.id, direction: Direction::Credit, amount: refund_amount });
            }
            if release_amount > 0 {
                let worker_id = ctx.worker_id.as_deref().ok_or_else(|| {
                    CoreError::Validation("a split release requires a worker_id".into())
                })?;
                let worker = worker_payable(conn, worker_id)?;
                entries.push(EntryInput { account_id: escrow.id, direction: Direction::Debit, amount: release_amount });
                entries.push(EntryInput { account_id: worker.id, direction: Direction::Credit, amount: release_amount });
            }
            Some(LedgerPlan {
                type_label: "resolve_refund".into(),
                entries,
                metadata: serde_json::json!({ "task_id": task_id, "refund_amount": refund_amount, "release_amount": release_amount }),
            })
        }
        Event::ForceRefund => {
            // Leg 1 only: reverse the prior transfer, crediting the escrow
            // account back in full. Leg 2 (the actual refund out of the
            // platform) runs after Execute, in
            // `run_force_refund_second_leg`. If the original release
            // booked a fee leg, that's reversed too, otherwise the fee
            // would be stranded in the platform's fees account while the
            // escrow credit comes up short.
            let worker_id = ctx
                .worker_id
                .as_deref()
                .ok_or_else(|| CoreError::Validation("force refund requires a worker_id".into()))?;
            let worker = worker_payable(conn, worker_id)?;
            let fee = fee_cents(ctx.price_cents, ctx.fee_bps);
            let payout = ctx.price_cents - fee;

            let mut entries = vec![];
            if payout > 0 {
                entries.push(EntryInput { account_id: worker.id, direction: Direction::Debit, amount: payout });
            }
            if fee > 0 {
                let fees = platform_fees(conn)?;
                entries.push(EntryInput { account_id: fees.id, direction: Direction::Debit, amount: fee });
            }
            entries.push(EntryInput { account_id: escrow.id, direction: Direction::Credit, amount: ctx.price_cents });

            Some(LedgerPlan {
                type_label: "force_refund_reversal".into(),
                entries,
                metadata: serde_json::json!({ "task_id": task_id, "fee_cents": fee }),
            })
        }
        Event::DisputeOpen | Event::WebhookPayoutPaid => None,
    };

    Ok(plan)
}

async fn execute_provider_step(
    provider: &dyn PaymentProvider,
    event: Event,
    event_id: &str,
    _task_id: &str,
    ctx: &SagaContext,
    plan: &Option<LedgerPlan>,
) -> CoreResult<ProviderEffect> {
    match event {
        Event::HoldEscrow => {
            let pm = ctx.payment_method_id.as_deref().unwrap_or("");
            let hold = provider
                .create_hold(&format!("{event_id}-confirm"), ctx.price_cents, pm)
                .await?;
            Ok(ProviderEffect {
                payment_intent_id: Some(hold.payment_intent_id),
                charge_id: Some(hold.charge_id),
                ..Default::default()
            })
        }
        Event::ReleasePayout | Event::ResolveUphold => {
            let worker_id = ctx.worker_id.as_deref().unwrap_or("");
            provider
                .capture(&format!("{event_id}-capture"), "")
                .await?;
            let transfer = provider
                .transfer(
                    &format!("{event_id}-transfer"),
                    ctx.price_cents,
                    worker_id,
                    "",
                    _task_id,
                )
                .await?;
            Ok(ProviderEffect {
                transfer_id: Some(transfer.transfer_id),
                ..Default::default()
            })
        }
        Event::RefundEscrow => {
            provider.cancel(&format!("{event_id}-cancel"), "", "task_rejected").await?;
            Ok(ProviderEffect::default())
        }
        Event::ResolveRefund => {
            let plan = plan.as_ref();
            let release_amount = ctx.release_split_cents.unwrap_or(0);
            if release_amount > 0 {
                let worker_id = ctx.worker_id.as_deref().unwrap_or("");
                provider.capture(&format!("{event_id}-capture"), "").await?;
                provider
                    .transfer(&format!("{event_id}-transfer"), release_amount, worker_id, "", _task_id)
                    .await?;
            }
            let refund_amount = ctx.refund_split_cents.unwrap_or(ctx.price_cents);
            if refund_amount > 0 && plan.map(|p| !p.entries.is_empty()).unwrap_or(true) {
                provider.cancel(&format!("{event_id}-cancel"), "", "dispute_resolved_refund").await?;
            }
            Ok(ProviderEffect::default())
        }
        Event::ForceRefund => {
            let transfer_id = "";
            let reversal = provider
                .reverse_transfer(&format!("{event_id}-reversal"), transfer_id, ctx.price_cents)
                .await?;
            let _ = reversal;
            Ok(ProviderEffect::default())
        }
        Event::DisputeOpen | Event::WebhookPayoutPaid => Ok(ProviderEffect::default()),
    }
}

/// `FORCE_REFUND`'s second leg: the actual refund to the poster, run after
/// the reversal has committed. Per the admin post-payout refund policy (see
/// DESIGN.md), failure here does not roll back the reversal — it is queued
/// to the DLQ with unlimited retries rather than the standard 5-attempt cap,
/// since the alternative (an un-refunded poster with reversed worker pay)
/// is worse than a slow convergence.
pub(crate) async fn run_force_refund_second_leg(
    db: &Db,
    provider: &dyn PaymentProvider,
    task_id: &str,
    event_id: &str,
    ctx: &SagaContext,
) -> CoreResult<()> {
    let refund_result = provider
        .refund(&format!("{event_id}-refund"), "", ctx.price_cents)
        .await;

    let mut conn = db.lock().await;
    let tx = Db::begin_immediate(&mut conn)?;
    let float = platform_float(&tx)?;
    let escrow = task_escrow(&tx, task_id)?;
    let entries = vec![
        EntryInput { account_id: escrow.id, direction: Direction::Debit, amount: ctx.price_cents },
        EntryInput { account_id: float.id, direction: Direction::Credit, amount: ctx.price_cents },
    ];

    match refund_result {
        Ok(refund) => {
            let prepared = ledger::prepare_transaction(
                &tx,
                &format!("ledger_{event_id}-refund-leg"),
                "force_refund_refund",
                &serde_json::json!({ "task_id": task_id }),
                &entries,
            )?;
            ledger::commit_transaction(
                &tx,
                &prepared.id,
                &ProviderEffect {
                    refund_id: Some(refund.refund_id),
                    ..Default::default()
                },
            )?;
            tx.commit()?;
            metrics::record_saga_phase("FORCE_REFUND", "force_refund_leg2", "ok");
            Ok(())
        }
        Err(e) => {
            tx.execute(
                "INSERT INTO pending_actions (id, transaction_id, type, payload, status, next_retry_at, error_log, created_at)
                 VALUES (?1, NULL, 'FORCE_REFUND_STAGE2', ?2, 'pending', ?3, ?4, ?5)",
                rusqlite::params![
                    format!("dlq_{event_id}-refund-leg"),
                    serde_json::json!({ "task_id": task_id, "event_id": event_id, "price_cents": ctx.price_cents }).to_string(),
                    chrono::Utc::now().to_rfc3339(),
                    e.to_string(),
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            tx.commit()?;
            metrics::record_saga_phase("FORCE_REFUND", "force_refund_leg2", "queued_dlq");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::killswitch::KillSwitch;
    use crate::provider::MockProvider;
    use chrono::Utc;

    fn seed_task(db_conn: &rusqlite::Connection, task_id: &str, poster: &str, worker: Option<&str>) {
        db_conn
            .execute(
                "INSERT INTO tasks (id, poster_id, worker_id, title, description, category, price_cents, city, created_at)
                 VALUES (?1, ?2, ?3, 'title', 'description long enough', 'cleaning', 2000, 'testville', ?4)",
                rusqlite::params![task_id, poster, worker, Utc::now().to_rfc3339()],
            )
            .unwrap();
    }

    #[tokio::test]
    async fn hold_then_release_moves_money_to_worker() {
        let db = Db::open_in_memory().unwrap();
        let killswitch = KillSwitch::new();
        let provider = MockProvider::new();

        {
            let conn = db.lock().await;
            seed_task(&conn, "task1", "poster1", Some("worker1"));
        }

        let ctx = SagaContext {
            poster_id: "poster1".into(),
            worker_id: Some("worker1".into()),
            price_cents: 2000,
            payment_method_id: Some("pm_1".into()),
            ..Default::default()
        };

        let hold = dispatch(&db, &killswitch, &provider, "task1", Event::HoldEscrow, "evt-hold-1", &ctx)
            .await
            .unwrap();
        assert_eq!(hold.state, State::Held);
        assert!(!hold.duplicate);

        let release = dispatch(&db, &killswitch, &provider, "task1", Event::ReleasePayout, "evt-release-1", &ctx)
            .await
            .unwrap();
        assert_eq!(release.state, State::Released);

        let conn = db.lock().await;
        let worker_account = worker_payable(&conn, "worker1").unwrap();
        assert_eq!(worker_account.balance, 2000);
        let escrow_account = task_escrow(&conn, "task1").unwrap();
        assert_eq!(escrow_account.balance, 0);
    }

    #[tokio::test]
    async fn replaying_same_event_id_is_a_no_op() {
        let db = Db::open_in_memory().unwrap();
        let killswitch = KillSwitch::new();
        let provider = MockProvider::new();
        {
            let conn = db.lock().await;
            seed_task(&conn, "task1", "poster1", Some("worker1"));
        }
        let ctx = SagaContext {
            poster_id: "poster1".into(),
            price_cents: 2000,
            payment_method_id: Some("pm_1".into()),
            ..Default::default()
        };
        let first = dispatch(&db, &killswitch, &provider, "task1", Event::HoldEscrow, "evt-hold-2", &ctx)
            .await
            .unwrap();
        let second = dispatch(&db, &killswitch, &provider, "task1", Event::HoldEscrow, "evt-hold-2", &ctx)
            .await
            .unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.state, second.state);
    }

    #[tokio::test]
    async fn kill_switch_blocks_new_sagas() {
        let db = Db::open_in_memory().unwrap();
        let killswitch = KillSwitch::new();
        let provider = MockProvider::new();
        {
            let conn = db.lock().await;
            seed_task(&conn, "task1", "poster1", Some("worker1"));
            killswitch.trigger(&conn, "manual_test", &serde_json::json!({})).unwrap();
        }
        let ctx = SagaContext {
            poster_id: "poster1".into(),
            price_cents: 2000,
            payment_method_id: Some("pm_1".into()),
            ..Default::default()
        };
        let err = dispatch(&db, &killswitch, &provider, "task1", Event::HoldEscrow, "evt-hold-3", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::KillSwitchActive(_)));
    }

    #[tokio::test]
    async fn release_payout_is_blocked_when_payouts_are_disabled() {
        let db = Db::open_in_memory().unwrap();
        let killswitch = KillSwitch::new();
        let provider = MockProvider::new();
        {
            let conn = db.lock().await;
            seed_task(&conn, "task1", "poster1", Some("worker1"));
        }
        let ctx = SagaContext {
            poster_id: "poster1".into(),
            worker_id: Some("worker1".into()),
            price_cents: 2000,
            payment_method_id: Some("pm_1".into()),
            payouts_enabled: false,
            ..Default::default()
        };
        dispatch(&db, &killswitch, &provider, "task1", Event::HoldEscrow, "evt-hold-4", &ctx)
            .await
            .unwrap();
        let err = dispatch(&db, &killswitch, &provider, "task1", Event::ReleasePayout, "evt-release-4", &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BlockedByGuard(_)));

        let conn = db.lock().await;
        let lock = msm::load_lock(&conn, "task1").unwrap().unwrap();
        assert_eq!(lock.current_state, State::Held);
    }
}
