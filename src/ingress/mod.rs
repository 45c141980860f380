//! Webhook Ordering Gate (§4.5, §6.3). Every inbound provider event passes
//! through these guards, in this order, before it ever reaches the MSM.
//! A guard failure drops the event with `Outcome::Drop` (caller still
//! returns 200, per spec, except signature failures which are 400) rather
//! than propagating a hard error — retries from the provider are expected
//! and must not pile up as 5xxs.

use crate::errors::{CoreError, CoreResult};
use crate::ids::EventId;
use crate::killswitch::KillSwitch;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use rusqlite::{params, Connection};
use serde::Deserialize;
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

pub const ACCEPTED_EVENT_TYPES: &[&str] = &[
    "charge.authorized",
    "payment_intent.succeeded",
    "payment_intent.payment_failed",
    "transfer.succeeded",
    "payout.paid",
    "dispute.opened",
    "dispute.closed",
    "refund.succeeded",
];

#[derive(Debug, Clone, Deserialize)]
pub struct InboundWebhook {
    pub provider_event_id: String,
    pub event_type: String,
    pub livemode: bool,
    pub created: i64,
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Dispatch { internal_event_id: String, task_id: String },
    Drop { reason: &'static str },
}

pub struct GateConfig {
    pub signing_secret: String,
    pub expect_live: bool,
    pub late_arrival_warn: Duration,
}

/// Verifies the raw body's HMAC signature. Returns a 400-worthy error on
/// mismatch, distinct from every other guard (which silently drops).
pub fn verify_signature(raw_body: &[u8], signature_header: &str, secret: &str) -> CoreResult<()> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| CoreError::Integrity(format!("bad webhook secret: {e}")))?;
    mac.update(raw_body);
    let expected = hex::encode(mac.finalize().into_bytes());

    let provided = signature_header.trim();
    if provided.len() != expected.len()
        || !provided
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            .eq(&0)
    {
        return Err(CoreError::Unauthorized("webhook signature mismatch".into()));
    }
    Ok(())
}

/// Runs guards 1, 3, 4, 5, 6 (source/HMAC is verified by the caller before
/// this, since it needs the raw body the deserialized `InboundWebhook`
/// no longer carries). Returns the MSM dispatch target, or a drop reason.
pub fn run_gate(
    conn: &Connection,
    killswitch: &KillSwitch,
    config: &GateConfig,
    event: &InboundWebhook,
) -> CoreResult<Outcome> {
    if killswitch.refresh(conn)? {
        crate::metrics::record_ingress_drop("kill_switch_active");
        return Ok(Outcome::Drop { reason: "kill_switch_active" });
    }

    if event.livemode != config.expect_live {
        crate::metrics::record_ingress_drop("livemode_mismatch");
        return Ok(Outcome::Drop { reason: "livemode_mismatch" });
    }

    if !ACCEPTED_EVENT_TYPES.contains(&event.event_type.as_str()) {
        crate::metrics::record_ingress_drop("event_type_not_allowed");
        return Ok(Outcome::Drop { reason: "event_type_not_allowed" });
    }

    // Dedup on the provider's own event id, not `processed_events` — that
    // table is keyed by the saga's internal event id, a distinct id space
    // the ingress layer never sees until after this gate runs.
    let already_seen: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM webhook_receipts WHERE provider_event_id = ?1)",
        params![event.provider_event_id],
        |row| row.get(0),
    )?;
    if already_seen {
        crate::metrics::record_ingress_drop("replay");
        return Ok(Outcome::Drop { reason: "replay" });
    }

    let internal_event_id = EventId::generate().to_string();

    let currency = event
        .object
        .get("currency")
        .and_then(|v| v.as_str())
        .unwrap_or("usd");
    if !currency.eq_ignore_ascii_case("usd") {
        crate::metrics::record_ingress_drop("non_usd_currency");
        return Ok(Outcome::Drop { reason: "non_usd_currency" });
    }
    let amount_ok = event
        .object
        .get("amount")
        .and_then(|v| v.as_i64())
        .map(|a| a >= 0)
        .unwrap_or(true);
    if !amount_ok {
        crate::metrics::record_ingress_drop("negative_amount");
        return Ok(Outcome::Drop { reason: "negative_amount" });
    }

    let task_id = extract_task_id(&event.object);
    let Some(task_id) = task_id else {
        crate::metrics::record_ingress_drop("missing_task_id");
        return Ok(Outcome::Drop { reason: "missing_task_id" });
    };

    if let Some(head) = current_owner_head(conn, &task_id)? {
        let event_timestamp = EventId::parse(&internal_event_id)
            .map(|id| id.timestamp_millis())
            .unwrap_or(0);
        if (event_timestamp as i64) <= head {
            crate::metrics::record_ingress_drop("temporal_time_travel");
            return Ok(Outcome::Drop { reason: "temporal_time_travel" });
        }
    }

    let age = Utc::now().timestamp_millis() - event.created * 1000;
    if age > config.late_arrival_warn.num_milliseconds() {
        warn!(task_id = %task_id, provider_event_id = %event.provider_event_id, age_ms = age, "late-arriving webhook event");
    }

    conn.execute(
        "INSERT INTO webhook_receipts (provider_event_id, received_at) VALUES (?1, ?2)",
        params![event.provider_event_id, Utc::now().to_rfc3339()],
    )?;

    Ok(Outcome::Dispatch { internal_event_id, task_id })
}

fn extract_task_id(object: &serde_json::Value) -> Option<String> {
    object
        .pointer("/metadata/taskId")
        .or_else(|| object.pointer("/metadata/task_id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn current_owner_head(conn: &Connection, task_id: &str) -> CoreResult<Option<i64>> {
    let raw: Option<String> = conn.query_row(
        "SELECT last_transition_at FROM money_state_locks WHERE task_id = ?1",
        params![task_id],
        |row| row.get(0),
    ).optional_or_none()?;
    Ok(raw.and_then(|r| chrono::DateTime::parse_from_rfc3339(&r).ok()).map(|dt| dt.timestamp_millis()))
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

/// Maps an accepted provider event type to the MSM event it triggers, if
/// any (some accepted types, e.g. `charge.authorized`, are informational
/// only and never drive a transition on their own).
pub fn dispatcher_event_for(event_type: &str) -> Option<crate::msm::Event> {
    match event_type {
        "payout.paid" => Some(crate::msm::Event::WebhookPayoutPaid),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let secret = "whsec_test";
        let body = b"{\"hello\":\"world\"}";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_signature(body, &sig, secret).is_ok());
    }

    #[test]
    fn signature_mismatch_is_rejected() {
        assert!(verify_signature(b"body", "deadbeef", "whsec_test").is_err());
    }

    #[test]
    fn unknown_event_type_is_dropped() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::Db::migrate(&conn).unwrap();
        let killswitch = KillSwitch::new();
        let config = GateConfig {
            signing_secret: "whsec".into(),
            expect_live: false,
            late_arrival_warn: Duration::minutes(10),
        };
        let event = InboundWebhook {
            provider_event_id: "evt_1".into(),
            event_type: "account.updated".into(),
            livemode: false,
            created: Utc::now().timestamp(),
            object: serde_json::json!({}),
        };
        let outcome = run_gate(&conn, &killswitch, &config, &event).unwrap();
        assert_eq!(outcome, Outcome::Drop { reason: "event_type_not_allowed" });
    }

    #[test]
    fn missing_task_id_is_dropped_not_errored() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::Db::migrate(&conn).unwrap();
        let killswitch = KillSwitch::new();
        let config = GateConfig {
            signing_secret: "whsec".into(),
            expect_live: false,
            late_arrival_warn: Duration::minutes(10),
        };
        let event = InboundWebhook {
            provider_event_id: "evt_2".into(),
            event_type: "payout.paid".into(),
            livemode: false,
            created: Utc::now().timestamp(),
            object: serde_json::json!({ "currency": "usd", "amount": 100 }),
        };
        let outcome = run_gate(&conn, &killswitch, &config, &event).unwrap();
        assert_eq!(outcome, Outcome::Drop { reason: "missing_task_id" });
    }

    #[test]
    fn replaying_a_provider_event_id_is_dropped() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::Db::migrate(&conn).unwrap();
        let killswitch = KillSwitch::new();
        let config = GateConfig {
            signing_secret: "whsec".into(),
            expect_live: false,
            late_arrival_warn: Duration::minutes(10),
        };
        let event = InboundWebhook {
            provider_event_id: "evt_replay".into(),
            event_type: "payout.paid".into(),
            livemode: false,
            created: Utc::now().timestamp(),
            object: serde_json::json!({ "currency": "usd", "amount": 100, "metadata": { "taskId": "task1" } }),
        };
        let first = run_gate(&conn, &killswitch, &config, &event).unwrap();
        assert!(matches!(first, Outcome::Dispatch { .. }));
        let second = run_gate(&conn, &killswitch, &config, &event).unwrap();
        assert_eq!(second, Outcome::Drop { reason: "replay" });
    }
}
