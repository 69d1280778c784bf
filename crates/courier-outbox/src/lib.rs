//! Reliable delivery core: outbox, dead-letter queue and idempotency tracking.
//!
//! This crate provides:
//! - `SqliteOutbox`: durable queue with atomic per-item claiming and backoff
//! - `DlqManager`: listing, stats, retry and purge of dead items
//! - `SqliteIdempotencyTracker`: exactly-one-winner guard for retried operations
//! - Cursor codec for opaque, versioned pagination tokens
//!
//! All three stores implement `async_trait` ports and receive their database
//! and clock through constructors, so callers can hold them as `Arc<dyn _>`.

mod backoff;
mod clock;
mod cursor;
mod dlq;
mod error;
mod idempotency;
mod outbox;
mod payload;

pub use backoff::RetryPolicy;
pub use clock::{Clock, ManualClock, SystemClock};
pub use courier_database::OutboxStatus;
pub use cursor::{decode_cursor, encode_cursor, try_decode_cursor, PaginationCursor, CURSOR_MAX_LEN};
pub use dlq::{
    BatchFailure, DlqFilter, DlqListOptions, DlqManager, DlqPort, DlqStats, ErrorPrefixCount,
    RetryBatchResult, DEFAULT_TOP_ERRORS, ERROR_PREFIX_LEN,
};
pub use error::{CursorError, OutboxError, OutboxResult};
pub use idempotency::{
    IdempotencyCheck, IdempotencyConfig, IdempotencyPort, SqliteIdempotencyTracker, MAX_KEY_LEN,
};
pub use outbox::{
    FailureOutcome, NewOutboxItem, OutboxItem, OutboxPort, Page, SqliteOutbox, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};
pub use payload::{EmailMessage, OutboxMessage, WebhookMessage};
