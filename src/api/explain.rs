//! Payout-status explainer (§4.9): turns an MSM state plus an optional
//! blocking reason into a user-facing headline/detail pair for
//! `GET /tasks/{taskId}/payout-status`. Table-driven, same shape as
//! `msm::State::as_str`.

use crate::msm::State;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Explanation {
    pub headline: String,
    pub detail: String,
}

pub fn explain(state: State, blocking_reason: Option<&str>) -> Explanation {
    if let Some(reason) = blocking_reason {
        if matches!(state, State::Held | State::PendingDispute) {
            return Explanation {
                headline: "Payout on hold".into(),
                detail: format!("Release is blocked: {reason}."),
            };
        }
    }

    let (headline, detail) = match state {
        State::Open => (
            "Awaiting escrow",
            "The task has been confirmed but no funds have been placed in escrow yet.",
        ),
        State::Held => (
            "Funds in escrow",
            "Payment is held in escrow until the poster approves the completed task.",
        ),
        State::Released => (
            "Payout on the way",
            "The payout has been sent to the worker and is awaiting confirmation from the payment processor.",
        ),
        State::PendingDispute => (
            "Dispute under review",
            "A dispute has been opened on this task; funds stay in escrow until it's resolved.",
        ),
        State::Refunded => (
            "Refunded",
            "The escrowed funds were returned to the poster.",
        ),
        State::Completed => (
            "Payout complete",
            "The worker has been paid and the payout is confirmed.",
        ),
        State::Upheld => (
            "Dispute resolved for the worker",
            "The dispute was resolved and the worker's payout was upheld.",
        ),
    };
    Explanation {
        headline: headline.into(),
        detail: detail.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_state_explains_awaiting_escrow() {
        let e = explain(State::Open, None);
        assert_eq!(e.headline, "Awaiting escrow");
    }

    #[test]
    fn blocking_reason_overrides_held_copy() {
        let e = explain(State::Held, Some("an open dispute"));
        assert_eq!(e.headline, "Payout on hold");
        assert!(e.detail.contains("an open dispute"));
    }

    #[test]
    fn blocking_reason_is_ignored_once_terminal() {
        let e = explain(State::Completed, Some("stale dispute reference"));
        assert_eq!(e.headline, "Payout complete");
    }

    #[test]
    fn terminal_states_have_distinct_copy() {
        assert_ne!(
            explain(State::Completed, None).headline,
            explain(State::Refunded, None).headline
        );
    }
}
