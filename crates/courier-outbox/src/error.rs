//! Outbox error types.

use thiserror::Error;

/// Outbox error type.
///
/// Only storage failures and caller mistakes surface here. Missing items,
/// lost races and bad cursors are reported as `false`, `None` or a first page.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] courier_database::DatabaseError),

    /// Payload failed validation at enqueue time
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Caller-chosen item id that a page cursor cannot carry
    #[error("Invalid item id: {0}")]
    InvalidId(String),

    /// Idempotency key rejected
    #[error("Invalid idempotency key: {0}")]
    InvalidKey(String),

    /// Duration that cannot be applied to a timestamp
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Cursor encode/decode failure. Never crosses a port boundary on decode.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor is {len} chars, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("unsupported cursor version: {0}")]
    UnsupportedVersion(String),

    #[error("malformed cursor: {0}")]
    Malformed(String),

    #[error("cursor checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid sort value: {0}")]
    InvalidSortValue(String),

    #[error("invalid tiebreak id: {0}")]
    InvalidTiebreakId(String),
}
