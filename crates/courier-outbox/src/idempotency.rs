//! Idempotency tracking for retried operations.
//!
//! One record per key moves `absent -> in_progress -> {completed, failed}`.
//! The primary key decides insert races and conditional updates decide stale
//! reclaims, so exactly one concurrent caller gets [`IdempotencyCheck::New`].
//! Expired records are treated as absent.

use crate::clock::{after, before, Clock};
use crate::{OutboxError, OutboxResult};
use async_trait::async_trait;
use courier_config_and_utils::IdempotencySettings;
use courier_database::{queries, AsyncDatabase, IdempotencyStatus};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest accepted key.
pub const MAX_KEY_LEN: usize = 255;

/// Rounds of insert/re-read before giving up and reporting `InProgress`.
const CHECK_ROUNDS: usize = 3;

/// Result of [`IdempotencyPort::check`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IdempotencyCheck {
    /// The caller owns this attempt and should run the operation.
    New,
    /// Another caller owns a live attempt; do not re-execute.
    InProgress,
    /// Already done; reuse the cached result.
    Completed { result: Option<Value> },
    /// Already failed with this error.
    Failed { error: String },
}

/// Tracker timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// An `in_progress` record older than this may be taken over.
    pub in_progress_timeout: Duration,
    /// Record lifetime when `check` is given no TTL.
    pub default_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self::from_settings(&IdempotencySettings::default())
    }
}

impl IdempotencyConfig {
    pub fn from_settings(settings: &IdempotencySettings) -> Self {
        Self {
            in_progress_timeout: Duration::from_millis(settings.in_progress_timeout_ms),
            default_ttl: Duration::from_millis(settings.default_ttl_ms),
        }
    }
}

/// Idempotency operations.
#[async_trait]
pub trait IdempotencyPort: Send + Sync {
    /// Claim `key` or report what an earlier caller did with it.
    async fn check(&self, key: &str, ttl: Option<Duration>) -> OutboxResult<IdempotencyCheck>;

    async fn complete(&self, key: &str, result: Option<Value>) -> OutboxResult<()>;

    async fn fail(&self, key: &str, error: &str) -> OutboxResult<()>;

    /// Forget `key` so the next `check` starts over.
    async fn clear(&self, key: &str) -> OutboxResult<bool>;

    /// Cached result, only for completed keys.
    async fn get_result(&self, key: &str) -> OutboxResult<Option<Value>>;

    /// Delete every expired record.
    async fn purge_expired(&self) -> OutboxResult<usize>;
}

/// Tracker backed by the `idempotency_records` table.
#[derive(Clone)]
pub struct SqliteIdempotencyTracker {
    db: AsyncDatabase,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

/// What one round of `check` observed.
enum Round {
    Settled(IdempotencyCheck),
    Completed(Option<String>),
    Reclaimed,
    Retry,
}

impl SqliteIdempotencyTracker {
    pub fn new(db: AsyncDatabase, clock: Arc<dyn Clock>, config: IdempotencyConfig) -> Self {
        Self { db, clock, config }
    }

    async fn check_round(&self, key: &str, ttl: Duration) -> OutboxResult<Round> {
        let now = self.clock.now();
        let expires_at = after(now, ttl)?;
        let stale_before = before(now, self.config.in_progress_timeout)?;
        let key = key.to_string();

        let round = self
            .db
            .call(move |conn| {
                if queries::insert_idempotency_record(conn, &key, now, expires_at)? {
                    return Ok(Round::Settled(IdempotencyCheck::New));
                }
                let Some(record) = queries::get_idempotency_record(conn, &key)? else {
                    return Ok(Round::Retry);
                };
                if record.expires_at <= now {
                    queries::delete_expired_idempotency_record(conn, &key, now)?;
                    return Ok(Round::Retry);
                }
                let round = match record.status {
                    IdempotencyStatus::Completed => Round::Completed(record.result),
                    IdempotencyStatus::Failed => Round::Settled(IdempotencyCheck::Failed {
                        error: record.error.unwrap_or_default(),
                    }),
                    IdempotencyStatus::InProgress if record.started_at < stale_before => {
                        if queries::reclaim_stale_idempotency_record(
                            conn,
                            &key,
                            stale_before,
                            now,
                            expires_at,
                        )? {
                            Round::Reclaimed
                        } else {
                            Round::Retry
                        }
                    }
                    IdempotencyStatus::InProgress => Round::Settled(IdempotencyCheck::InProgress),
                };
                Ok(round)
            })
            .await?;
        Ok(round)
    }
}

#[async_trait]
impl IdempotencyPort for SqliteIdempotencyTracker {
    async fn check(&self, key: &str, ttl: Option<Duration>) -> OutboxResult<IdempotencyCheck> {
        validate_key(key)?;
        let ttl = ttl.unwrap_or(self.config.default_ttl);

        for _ in 0..CHECK_ROUNDS {
            match self.check_round(key, ttl).await? {
                Round::Settled(check) => {
                    debug!(key, ?check, "Idempotency check");
                    return Ok(check);
                }
                Round::Completed(result) => {
                    let result = result
                        .as_deref()
                        .map(serde_json::from_str::<Value>)
                        .transpose()?;
                    return Ok(IdempotencyCheck::Completed { result });
                }
                Round::Reclaimed => {
                    warn!(key, "Reclaimed stale in-progress idempotency record");
                    return Ok(IdempotencyCheck::New);
                }
                Round::Retry => continue,
            }
        }

        // Another caller keeps recreating the record; let it own the attempt.
        debug!(key, "Idempotency check contended, reporting in progress");
        Ok(IdempotencyCheck::InProgress)
    }

    async fn complete(&self, key: &str, result: Option<Value>) -> OutboxResult<()> {
        validate_key(key)?;
        let result = result.as_ref().map(serde_json::to_string).transpose()?;
        let now = self.clock.now();
        let expires_at = after(now, self.config.default_ttl)?;
        let key_owned = key.to_string();
        self.db
            .call(move |conn| {
                queries::complete_idempotency_record(
                    conn,
                    &key_owned,
                    result.as_deref(),
                    now,
                    expires_at,
                )
            })
            .await?;
        debug!(key, "Idempotency key completed");
        Ok(())
    }

    async fn fail(&self, key: &str, error: &str) -> OutboxResult<()> {
        validate_key(key)?;
        let now = self.clock.now();
        let expires_at = after(now, self.config.default_ttl)?;
        let key_owned = key.to_string();
        let error_owned = error.to_string();
        self.db
            .call(move |conn| {
                queries::fail_idempotency_record(conn, &key_owned, &error_owned, now, expires_at)
            })
            .await?;
        debug!(key, error, "Idempotency key failed");
        Ok(())
    }

    async fn clear(&self, key: &str) -> OutboxResult<bool> {
        validate_key(key)?;
        let key = key.to_string();
        Ok(self
            .db
            .call(move |conn| queries::delete_idempotency_record(conn, &key))
            .await?)
    }

    async fn get_result(&self, key: &str) -> OutboxResult<Option<Value>> {
        validate_key(key)?;
        let key = key.to_string();
        let now = self.clock.now();
        let record = self
            .db
            .call(move |conn| queries::get_idempotency_record(conn, &key))
            .await?;

        match record {
            Some(record)
                if record.status == IdempotencyStatus::Completed && record.expires_at > now =>
            {
                Ok(record
                    .result
                    .as_deref()
                    .map(serde_json::from_str::<Value>)
                    .transpose()?)
            }
            _ => Ok(None),
        }
    }

    async fn purge_expired(&self) -> OutboxResult<usize> {
        let now = self.clock.now();
        let purged = self
            .db
            .call(move |conn| queries::purge_expired_idempotency_records(conn, now))
            .await?;
        if purged > 0 {
            info!(purged, "Purged expired idempotency records");
        }
        Ok(purged)
    }
}

fn validate_key(key: &str) -> OutboxResult<()> {
    if key.trim().is_empty() {
        return Err(OutboxError::InvalidKey("key is empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(OutboxError::InvalidKey(format!(
            "key is {} bytes, limit is {MAX_KEY_LEN}",
            key.len()
        )));
    }
    Ok(())
}
