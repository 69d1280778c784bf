//! SQLite-backed outbox store.
//!
//! Every mutation is a single conditional statement, so any number of
//! processes can share one database file. Claiming issues one atomic
//! select-and-transition per item rather than a bulk update.

use crate::backoff::RetryPolicy;
use crate::clock::{after, before, Clock};
use crate::cursor::{decode_cursor, encode_cursor, validate_tiebreak_id, PaginationCursor};
use crate::{OutboxError, OutboxMessage, OutboxResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_database::{
    queries, AsyncDatabase, DeadItemFilter, DeadPagePosition, NewOutboxRecord, OutboxRecord,
    OutboxStatus,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on items claimed or listed per call.
pub const MAX_PAGE_SIZE: usize = 100;

/// Page size used when the caller asks for zero items.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// An outbox item as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxItem {
    pub id: String,
    pub scope_id: Option<String>,
    pub kind: String,
    /// Decoded JSON payload. A stored payload that is not JSON is kept as a
    /// string so the item can still be inspected and dead-lettered.
    pub payload: Value,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxItem {
    /// Typed view of the payload.
    pub fn message(&self) -> OutboxResult<OutboxMessage> {
        OutboxMessage::from_parts(&self.kind, &self.payload)
    }
}

impl From<OutboxRecord> for OutboxItem {
    fn from(record: OutboxRecord) -> Self {
        let payload =
            serde_json::from_str(&record.payload).unwrap_or(Value::String(record.payload));
        Self {
            id: record.id,
            scope_id: record.scope_id,
            kind: record.kind,
            payload,
            status: record.status,
            attempts: u32::try_from(record.attempts.max(0)).unwrap_or(u32::MAX),
            next_attempt_at: record.next_attempt_at,
            last_error: record.last_error,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// An item to enqueue.
#[derive(Debug, Clone)]
pub struct NewOutboxItem {
    /// Caller-chosen id; a UUID v4 is generated when absent.
    pub id: Option<String>,
    pub scope_id: Option<String>,
    pub message: OutboxMessage,
}

impl NewOutboxItem {
    pub fn new(message: OutboxMessage) -> Self {
        Self {
            id: None,
            scope_id: None,
            message,
        }
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Use a caller-chosen id. It must be a UUID or 1-128 chars of
    /// `[A-Za-z0-9_-]`, or `enqueue` fails with `InvalidId`.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Token for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// What `mark_failure` did to the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Back in the queue as `failed`, due at `next_attempt_at`.
    Retrying { next_attempt_at: DateTime<Utc> },
    /// Attempt budget spent; the item is now `dead`.
    DeadLettered,
    /// No matching item, or it was already delivered or dead.
    Skipped,
}

/// Outbox operations.
#[async_trait]
pub trait OutboxPort: Send + Sync {
    /// Validate and persist a message as `queued`, due now. Returns its id.
    async fn enqueue(&self, item: NewOutboxItem) -> OutboxResult<String>;

    /// Lease up to `limit` due items, most overdue first.
    async fn claim_batch(&self, now: DateTime<Utc>, limit: usize) -> OutboxResult<Vec<OutboxItem>>;

    async fn mark_success(&self, id: &str) -> OutboxResult<bool>;

    /// Record a failed attempt. `attempts` is the count before this failure.
    async fn mark_failure(&self, id: &str, error: &str, attempts: u32)
        -> OutboxResult<FailureOutcome>;

    /// Dead-letter immediately, for failures that retrying cannot fix.
    async fn mark_dead(&self, id: &str, error: &str) -> OutboxResult<bool>;

    /// Hand a lease back without counting an attempt.
    async fn release(&self, id: &str) -> OutboxResult<bool>;

    async fn list_dead(&self, limit: usize) -> OutboxResult<Vec<OutboxItem>>;

    async fn list_dead_page(&self, cursor: Option<&str>, limit: usize)
        -> OutboxResult<Page<OutboxItem>>;

    /// Put `dead` or `failed` items back in the queue. Returns how many moved.
    async fn requeue(&self, ids: &[String], now: DateTime<Utc>) -> OutboxResult<usize>;

    async fn count_dead(&self) -> OutboxResult<u64>;

    /// Delete dead items; other ids are skipped. Returns how many were deleted.
    async fn purge(&self, ids: &[String]) -> OutboxResult<usize>;

    async fn reclaim_expired_leases(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> OutboxResult<usize>;

    async fn prune_delivered(&self, older_than: DateTime<Utc>) -> OutboxResult<usize>;

    async fn get_item(&self, id: &str) -> OutboxResult<Option<OutboxItem>>;
}

/// Outbox backed by the `outbox_items` table.
#[derive(Clone)]
pub struct SqliteOutbox {
    db: AsyncDatabase,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl SqliteOutbox {
    pub fn new(db: AsyncDatabase, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self { db, clock, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl OutboxPort for SqliteOutbox {
    async fn enqueue(&self, item: NewOutboxItem) -> OutboxResult<String> {
        item.message.validate()?;
        if let Some(id) = &item.id {
            validate_tiebreak_id(id).map_err(|e| OutboxError::InvalidId(e.to_string()))?;
        }
        let (kind, payload) = item.message.to_parts()?;
        let record = NewOutboxRecord {
            id: item.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            scope_id: item.scope_id,
            kind: kind.to_string(),
            payload,
        };
        let now = self.clock.now();

        let inserted = self
            .db
            .call(move |conn| queries::insert_outbox_item(conn, &record, now))
            .await?;
        info!(id = %inserted.id, kind = %inserted.kind, "Enqueued outbox item");
        Ok(inserted.id)
    }

    async fn claim_batch(&self, now: DateTime<Utc>, limit: usize) -> OutboxResult<Vec<OutboxItem>> {
        let limit = limit.min(MAX_PAGE_SIZE);
        let mut claimed = Vec::with_capacity(limit);
        while claimed.len() < limit {
            let next = self
                .db
                .call(move |conn| queries::claim_next_due(conn, now))
                .await?;
            match next {
                Some(record) => claimed.push(OutboxItem::from(record)),
                None => break,
            }
        }
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed outbox batch");
        }
        Ok(claimed)
    }

    async fn mark_success(&self, id: &str) -> OutboxResult<bool> {
        let id = id.to_string();
        let now = self.clock.now();
        Ok(self
            .db
            .call(move |conn| queries::mark_outbox_delivered(conn, &id, now))
            .await?)
    }

    async fn mark_failure(
        &self,
        id: &str,
        error: &str,
        attempts: u32,
    ) -> OutboxResult<FailureOutcome> {
        let now = self.clock.now();
        let dead = self.policy.is_exhausted(attempts);
        let (status, next_attempt_at) = if dead {
            (OutboxStatus::Dead, now)
        } else {
            let delay = self.policy.delay_for(attempts, &mut rand::thread_rng());
            (OutboxStatus::Failed, after(now, delay)?)
        };

        let id_owned = id.to_string();
        let error_owned = error.to_string();
        let updated = self
            .db
            .call(move |conn| {
                queries::mark_outbox_failed(
                    conn,
                    &id_owned,
                    &error_owned,
                    i64::from(attempts),
                    status,
                    next_attempt_at,
                    now,
                )
            })
            .await?;

        if !updated {
            debug!(id, "Failure not recorded: item missing, delivered or dead");
            return Ok(FailureOutcome::Skipped);
        }
        if dead {
            warn!(id, attempts, error, "Outbox item dead-lettered");
            Ok(FailureOutcome::DeadLettered)
        } else {
            debug!(id, attempts, %next_attempt_at, "Outbox item scheduled for retry");
            Ok(FailureOutcome::Retrying { next_attempt_at })
        }
    }

    async fn mark_dead(&self, id: &str, error: &str) -> OutboxResult<bool> {
        let id_owned = id.to_string();
        let error_owned = error.to_string();
        let now = self.clock.now();
        let updated = self
            .db
            .call(move |conn| queries::mark_outbox_dead(conn, &id_owned, &error_owned, now))
            .await?;
        if updated {
            warn!(id, error, "Outbox item dead-lettered without retry");
        }
        Ok(updated)
    }

    async fn release(&self, id: &str) -> OutboxResult<bool> {
        let id = id.to_string();
        let now = self.clock.now();
        Ok(self
            .db
            .call(move |conn| queries::release_outbox_item(conn, &id, now))
            .await?)
    }

    async fn list_dead(&self, limit: usize) -> OutboxResult<Vec<OutboxItem>> {
        let page = fetch_dead_page(&self.db, DeadItemFilter::default(), None, limit).await?;
        Ok(page.items)
    }

    async fn list_dead_page(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> OutboxResult<Page<OutboxItem>> {
        fetch_dead_page(&self.db, DeadItemFilter::default(), cursor, limit).await
    }

    async fn requeue(&self, ids: &[String], now: DateTime<Utc>) -> OutboxResult<usize> {
        let mut requeued = 0;
        for id in ids {
            let id = id.clone();
            if self
                .db
                .call(move |conn| queries::requeue_outbox_item(conn, &id, now))
                .await?
            {
                requeued += 1;
            }
        }
        info!(requested = ids.len(), requeued, "Requeued outbox items");
        Ok(requeued)
    }

    async fn count_dead(&self) -> OutboxResult<u64> {
        Ok(self
            .db
            .call(|conn| queries::count_dead_items(conn, &DeadItemFilter::default()))
            .await?)
    }

    async fn purge(&self, ids: &[String]) -> OutboxResult<usize> {
        let mut purged = 0;
        for id in ids {
            let id = id.clone();
            if self
                .db
                .call(move |conn| queries::purge_dead_item(conn, &id))
                .await?
            {
                purged += 1;
            }
        }
        info!(requested = ids.len(), purged, "Purged dead outbox items");
        Ok(purged)
    }

    async fn reclaim_expired_leases(
        &self,
        now: DateTime<Utc>,
        lease_timeout: Duration,
    ) -> OutboxResult<usize> {
        let cutoff = before(now, lease_timeout)?;
        let reclaimed = self
            .db
            .call(move |conn| queries::reclaim_expired_leases(conn, cutoff, now))
            .await?;
        if reclaimed > 0 {
            warn!(reclaimed, %cutoff, "Reclaimed expired delivery leases");
        }
        Ok(reclaimed)
    }

    async fn prune_delivered(&self, older_than: DateTime<Utc>) -> OutboxResult<usize> {
        let pruned = self
            .db
            .call(move |conn| queries::prune_delivered(conn, older_than))
            .await?;
        if pruned > 0 {
            info!(pruned, %older_than, "Pruned delivered outbox items");
        }
        Ok(pruned)
    }

    async fn get_item(&self, id: &str) -> OutboxResult<Option<OutboxItem>> {
        let id = id.to_string();
        let record = self
            .db
            .call(move |conn| queries::get_outbox_item(conn, &id))
            .await?;
        Ok(record.map(OutboxItem::from))
    }
}

/// Clamp a requested page size to `1..=MAX_PAGE_SIZE`, zero meaning default.
pub(crate) fn page_size(limit: usize) -> usize {
    if limit == 0 {
        DEFAULT_PAGE_SIZE
    } else {
        limit.min(MAX_PAGE_SIZE)
    }
}

/// One page of dead items, newest first. Shared by the outbox and the DLQ.
pub(crate) async fn fetch_dead_page(
    db: &AsyncDatabase,
    filter: DeadItemFilter,
    cursor: Option<&str>,
    limit: usize,
) -> OutboxResult<Page<OutboxItem>> {
    let limit = page_size(limit);
    let after = cursor.and_then(decode_cursor).map(|c| DeadPagePosition {
        updated_at: c.sort_value,
        id: c.tiebreak_id,
    });

    let mut records = db
        .call(move |conn| queries::list_dead_items(conn, &filter, after.as_ref(), limit + 1))
        .await?;
    let has_more = records.len() > limit;
    records.truncate(limit);

    let next_cursor = match (has_more, records.last()) {
        (true, Some(last)) => next_page_token(last),
        _ => None,
    };
    Ok(Page {
        items: records.into_iter().map(OutboxItem::from).collect(),
        next_cursor,
        has_more,
    })
}

fn next_page_token(last: &OutboxRecord) -> Option<String> {
    let cursor = PaginationCursor {
        sort_value: last.updated_at,
        tiebreak_id: last.id.clone(),
    };
    match encode_cursor(&cursor) {
        Ok(token) => Some(token),
        Err(error) => {
            // Ids that cannot be carried in a cursor end pagination here.
            warn!(id = %last.id, %error, "Cannot encode next-page cursor");
            None
        }
    }
}
