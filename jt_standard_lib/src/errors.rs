use std::time::Duration;
use thiserror::Error;

/// Platform wide error type. Adapters never panic and never throw; every
/// operation returns one of these kinds so callers can decide on retry policy
/// without string matching.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JtError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials require refresh or re-auth. Callers must not retry in a
    /// tight loop; the credential keeper owns recovery.
    #[error("auth expired: {0}")]
    AuthExpired(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// The broker declined the order. Not retried.
    #[error("broker rejected: {reason}")]
    BrokerRejected { reason: String },

    /// Transport level failure talking to a broker. Retried with backoff.
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl JtError {
    /// Only transport failures and rate limits are safe to retry blindly.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            JtError::RateLimited { .. } | JtError::BrokerUnreachable(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JtError::BadRequest(_) => "bad_request",
            JtError::NotFound(_) => "not_found",
            JtError::AuthExpired(_) => "auth_expired",
            JtError::RateLimited { .. } => "rate_limited",
            JtError::BrokerRejected { .. } => "broker_rejected",
            JtError::BrokerUnreachable(_) => "broker_unreachable",
            JtError::StoreUnavailable(_) => "store_unavailable",
            JtError::IntegrityViolation(_) => "integrity_violation",
            JtError::Timeout(_) => "timeout",
            JtError::Internal(_) => "internal",
        }
    }
}
