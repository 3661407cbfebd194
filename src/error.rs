//! Error taxonomy (§7).
//!
//! Internal plumbing (ingest, replay, snapshot I/O) keeps using
//! `anyhow::Result` with `.context(...)` the way the rest of this codebase
//! does. Anything that crosses a caller-visible boundary — order
//! validation, locate decisions — returns one of the closed enums below so
//! the reply never leaks an internal identifier or stack trace.

use thiserror::Error;

/// Reason a short-sell order validation was rejected. Closed set per §7/§8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RejectionReason {
    InsufficientClientLimit,
    InsufficientAuLimit,
    UnknownSecurity,
    InactiveClient,
    MarketClosed,
}

impl RejectionReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            RejectionReason::InsufficientClientLimit => "INSUFFICIENT_CLIENT_LIMIT",
            RejectionReason::InsufficientAuLimit => "INSUFFICIENT_AU_LIMIT",
            RejectionReason::UnknownSecurity => "UNKNOWN_SECURITY",
            RejectionReason::InactiveClient => "INACTIVE_CLIENT",
            RejectionReason::MarketClosed => "MARKET_CLOSED",
        }
    }
}

/// Error surfaced to a synchronous caller of the hot path (§4.8, §5, §7).
/// Never carries shard ids, event ids, or other internal identifiers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HotPathError {
    #[error("validation deadline exceeded")]
    Timeout,
    #[error("bulkhead at capacity")]
    Busy,
    #[error("internal error")]
    Internal,
}

impl HotPathError {
    pub fn as_code(&self) -> &'static str {
        match self {
            HotPathError::Timeout => "TIMEOUT",
            HotPathError::Busy => "BUSY",
            HotPathError::Internal => "INTERNAL",
        }
    }
}

/// Reason a locate request was auto-rejected. Closed set per §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LocateRejectionReason {
    InsufficientInventory,
    RuleBlocked,
    Timeout,
}

/// Errors internal to a shard's event-processing loop (§4.4, §7). These are
/// logged with full shard/event context; they never cross the hot-path
/// boundary directly.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("decode failure: {0}")]
    Decode(String),

    #[error("event out of order beyond configured skew")]
    OutOfOrderBeyondSkew,

    #[error("invariant violated on key {key}: {detail}")]
    InvariantViolation { key: String, detail: String },

    #[error("arithmetic overflow applying event {event_id} to {key}")]
    Overflow { key: String, event_id: String },

    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("rule evaluation error: {0}")]
    RuleEvaluation(String),

    #[error("unknown event type, skipped")]
    UnknownEventType,
}
