//! Dead-letter queue administration.
//!
//! Everything here is scoped to items in the `dead` state. Batch operations
//! attempt every id and report per-id outcomes.

use crate::clock::Clock;
use crate::outbox::{fetch_dead_page, OutboxItem, Page};
use crate::OutboxResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_database::{queries, AsyncDatabase, DeadItemFilter};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Characters of `last_error` used to group errors in stats.
pub const ERROR_PREFIX_LEN: usize = 50;

/// Error prefixes reported by stats unless configured otherwise.
pub const DEFAULT_TOP_ERRORS: usize = 10;

const NOT_FOUND_OR_NOT_DEAD: &str = "not found or not dead";

/// Filters shared by `list` and `count`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DlqFilter {
    /// Exact item kind, e.g. `email`.
    pub kind: Option<String>,
    pub scope_id: Option<String>,
    /// Case-insensitive regex over `last_error`. Invalid regexes match as
    /// literal substrings.
    pub error_pattern: Option<String>,
}

impl DlqFilter {
    fn to_query(&self) -> DeadItemFilter {
        DeadItemFilter {
            kind: self.kind.clone(),
            scope_id: self.scope_id.clone(),
            error_regex: self.error_pattern.as_deref().map(error_regex),
        }
    }
}

/// Options for [`DlqPort::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DlqListOptions {
    pub filter: DlqFilter,
    /// Token from a previous page. Unusable tokens restart from the first page.
    pub cursor: Option<String>,
    /// Page size, clamped to `1..=100`; zero means the default of 20.
    pub limit: usize,
}

/// An id that could not be processed by a batch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of [`DlqPort::retry_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryBatchResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

/// A grouped error count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPrefixCount {
    pub prefix: String,
    pub count: u64,
}

/// Aggregate view of the dead set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DlqStats {
    pub total_dead: u64,
    pub oldest_dead_at: Option<DateTime<Utc>>,
    pub newest_dead_at: Option<DateTime<Utc>>,
    pub by_kind: BTreeMap<String, u64>,
    /// Most frequent first.
    pub by_error_prefix: Vec<ErrorPrefixCount>,
}

/// Dead-letter queue operations.
#[async_trait]
pub trait DlqPort: Send + Sync {
    async fn list(&self, options: DlqListOptions) -> OutboxResult<Page<OutboxItem>>;

    /// A dead item by id; `None` if missing or not dead.
    async fn get_by_id(&self, id: &str) -> OutboxResult<Option<OutboxItem>>;

    /// Requeue a dead item with a fresh attempt budget.
    async fn retry(&self, id: &str) -> OutboxResult<bool>;

    async fn retry_batch(&self, ids: &[String]) -> OutboxResult<RetryBatchResult>;

    async fn purge(&self, id: &str) -> OutboxResult<bool>;

    async fn purge_batch(&self, ids: &[String]) -> OutboxResult<usize>;

    async fn get_stats(&self) -> OutboxResult<DlqStats>;

    async fn count(&self, filter: &DlqFilter) -> OutboxResult<u64>;
}

/// DLQ over the shared `outbox_items` table.
#[derive(Clone)]
pub struct DlqManager {
    db: AsyncDatabase,
    clock: Arc<dyn Clock>,
    top_errors: usize,
}

impl DlqManager {
    pub fn new(db: AsyncDatabase, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            top_errors: DEFAULT_TOP_ERRORS,
        }
    }

    /// Number of error prefixes reported by [`DlqPort::get_stats`].
    pub fn with_top_errors(mut self, top_errors: usize) -> Self {
        self.top_errors = top_errors.max(1);
        self
    }
}

#[async_trait]
impl DlqPort for DlqManager {
    async fn list(&self, options: DlqListOptions) -> OutboxResult<Page<OutboxItem>> {
        fetch_dead_page(
            &self.db,
            options.filter.to_query(),
            options.cursor.as_deref(),
            options.limit,
        )
        .await
    }

    async fn get_by_id(&self, id: &str) -> OutboxResult<Option<OutboxItem>> {
        let id = id.to_string();
        let record = self
            .db
            .call(move |conn| queries::get_dead_item(conn, &id))
            .await?;
        Ok(record.map(OutboxItem::from))
    }

    async fn retry(&self, id: &str) -> OutboxResult<bool> {
        let id_owned = id.to_string();
        let now = self.clock.now();
        let retried = self
            .db
            .call(move |conn| queries::retry_dead_item(conn, &id_owned, now))
            .await?;
        if retried {
            info!(id, "Dead item requeued");
        }
        Ok(retried)
    }

    async fn retry_batch(&self, ids: &[String]) -> OutboxResult<RetryBatchResult> {
        let mut result = RetryBatchResult::default();
        for id in ids {
            match self.retry(id).await {
                Ok(true) => result.succeeded.push(id.clone()),
                Ok(false) => result.failed.push(BatchFailure {
                    id: id.clone(),
                    error: NOT_FOUND_OR_NOT_DEAD.to_string(),
                }),
                Err(e) => {
                    warn!(id = %id, error = %e, "Dead item retry failed");
                    result.failed.push(BatchFailure {
                        id: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            "Dead item batch retry finished"
        );
        Ok(result)
    }

    async fn purge(&self, id: &str) -> OutboxResult<bool> {
        let id_owned = id.to_string();
        let purged = self
            .db
            .call(move |conn| queries::purge_dead_item(conn, &id_owned))
            .await?;
        if purged {
            info!(id, "Dead item purged");
        }
        Ok(purged)
    }

    async fn purge_batch(&self, ids: &[String]) -> OutboxResult<usize> {
        let mut purged = 0;
        for id in ids {
            match self.purge(id).await {
                Ok(true) => purged += 1,
                Ok(false) => debug!(id = %id, "Skipping purge: not found or not dead"),
                Err(e) => warn!(id = %id, error = %e, "Dead item purge failed"),
            }
        }
        Ok(purged)
    }

    async fn get_stats(&self) -> OutboxResult<DlqStats> {
        let top = self.top_errors;
        let (aggregate, by_kind, by_prefix) = self
            .db
            .call(move |conn| {
                Ok((
                    queries::dead_aggregate(conn)?,
                    queries::dead_counts_by_kind(conn)?,
                    queries::dead_counts_by_error_prefix(conn, ERROR_PREFIX_LEN, top)?,
                ))
            })
            .await?;

        Ok(DlqStats {
            total_dead: aggregate.total,
            oldest_dead_at: aggregate.oldest_updated_at,
            newest_dead_at: aggregate.newest_updated_at,
            by_kind: by_kind.into_iter().map(|g| (g.key, g.count)).collect(),
            by_error_prefix: by_prefix
                .into_iter()
                .map(|g| ErrorPrefixCount {
                    prefix: g.key,
                    count: g.count,
                })
                .collect(),
        })
    }

    async fn count(&self, filter: &DlqFilter) -> OutboxResult<u64> {
        let query = filter.to_query();
        Ok(self
            .db
            .call(move |conn| queries::count_dead_items(conn, &query))
            .await?)
    }
}

/// Case-insensitive regex for a user-supplied error pattern.
fn error_regex(pattern: &str) -> String {
    let candidate = format!("(?i){pattern}");
    if Regex::new(&candidate).is_ok() {
        candidate
    } else {
        debug!(pattern, "Error pattern is not a valid regex, matching literally");
        format!("(?i){}", regex::escape(pattern))
    }
}
