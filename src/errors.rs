//! Sealed error taxonomy for the money core.
//!
//! Every fallible operation in `msm`, `saga`, `ledger`, `ingress` and `tpee`
//! returns a `CoreError`. Handlers at the HTTP boundary (see `api`) map each
//! variant to a stable status code and reason code; nothing below that
//! boundary is allowed to leak a raw `rusqlite`/`anyhow` error to a caller.

use axum::http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// Bad input. Never retried by the core.
    #[error("validation: {0}")]
    Validation(String),

    /// TPEE or guard rejection with a stable reason code for audit/human review.
    #[error("policy: {reason_code} (eval {evaluation_id})")]
    Policy {
        reason_code: String,
        evaluation_id: String,
        human_review: bool,
    },

    /// Provider/network hiccup. Saga aborts the current attempt; the
    /// reaper/DLQ re-drives on schedule.
    #[error("transient: {0}")]
    Transient(String),

    /// Zero-sum failure, deep-idempotency mismatch, snapshot hash mismatch,
    /// or monotonicity violation. Fatal: must trip the kill switch.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Lock contested or row-lock timeout. Retryable by the caller.
    #[error("concurrency: {0}")]
    Concurrency(String),

    #[error("invalid transition: {from} -[{event}]-> ?")]
    InvalidTransition { from: String, event: String },

    #[error("blocked by guard: {0}")]
    BlockedByGuard(String),

    #[error("lock contested on {0}")]
    LockContested(String),

    #[error("provider failure (retryable): {0}")]
    ProviderFailure(String),

    #[error("provider failure (terminal): {0}")]
    ProviderTerminal(String),

    #[error("rate limited")]
    RateLimited,

    #[error("kill switch active: {0}")]
    KillSwitchActive(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl CoreError {
    /// Stable machine-readable code surfaced to callers and logged in audit rows.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "INSUFFICIENT_INFO",
            CoreError::Policy { .. } => "POLICY_REJECTED",
            CoreError::Transient(_) => "TRANSIENT_PROVIDER_ERROR",
            CoreError::Integrity(_) => "INTEGRITY_VIOLATION",
            CoreError::Concurrency(_) => "CONCURRENCY_CONFLICT",
            CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoreError::BlockedByGuard(_) => "BLOCKED_BY_GUARD",
            CoreError::LockContested(_) => "LOCK_CONTESTED",
            CoreError::ProviderFailure(_) => "PROVIDER_FAILURE",
            CoreError::ProviderTerminal(_) => "PROVIDER_TERMINAL",
            CoreError::RateLimited => "RATE_LIMITED",
            CoreError::KillSwitchActive(_) => "KILL_SWITCH_ACTIVE",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Unauthorized(_) => "UNAUTHORIZED",
            CoreError::Db(_) => "STORAGE_ERROR",
        }
    }

    /// Whether the saga/caller may safely retry this exact request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transient(_)
                | CoreError::Concurrency(_)
                | CoreError::LockContested(_)
                | CoreError::ProviderFailure(_)
        )
    }

    /// Whether this is fatal and must trip the kill switch.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, CoreError::Integrity(_))
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Policy { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::Transient(_) | CoreError::ProviderFailure(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Concurrency(_) | CoreError::LockContested(_) => StatusCode::CONFLICT,
            CoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
            CoreError::BlockedByGuard(_) => StatusCode::FORBIDDEN,
            CoreError::ProviderTerminal(_) => StatusCode::BAD_GATEWAY,
            CoreError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            CoreError::KillSwitchActive(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
