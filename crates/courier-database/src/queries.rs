//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter and performs a
//! single atomic statement, except the claim which wraps its conditional update
//! in an immediate transaction. Callers pass `now` explicitly so that time is
//! owned by the caller's clock.

use crate::{
    DatabaseError, DatabaseResult, DeadAggregate, DeadItemFilter, DeadPagePosition, GroupCount,
    IdempotencyRecord, IdempotencyStatus, NewOutboxRecord, OutboxRecord, OutboxStatus,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use rusqlite::{Transaction, TransactionBehavior};
use tracing::debug;

const OUTBOX_COLUMNS: &str =
    "id, scope_id, kind, payload, status, attempts, next_attempt_at, last_error, created_at, updated_at";

const IDEMPOTENCY_COLUMNS: &str =
    "key, status, started_at, completed_at, failed_at, result, error, expires_at";

// ==========================================
// Outbox items
// ==========================================

/// Insert a new queued outbox item, due immediately.
pub fn insert_outbox_item(
    conn: &Connection,
    item: &NewOutboxRecord,
    now: DateTime<Utc>,
) -> DatabaseResult<OutboxRecord> {
    let now = format_datetime(&now);
    conn.execute(
        "INSERT INTO outbox_items (id, scope_id, kind, payload, status, attempts, next_attempt_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?5, ?5)",
        params![item.id, item.scope_id, item.kind, item.payload, now],
    )?;
    get_outbox_item(conn, &item.id)?
        .ok_or_else(|| DatabaseError::NotFound("Outbox item not found after insert".to_string()))
}

/// Get an outbox item by ID, whatever its status.
pub fn get_outbox_item(conn: &Connection, id: &str) -> DatabaseResult<Option<OutboxRecord>> {
    let mut stmt =
        conn.prepare_cached(&format!("SELECT {OUTBOX_COLUMNS} FROM outbox_items WHERE id = ?1"))?;
    Ok(stmt.query_row(params![id], row_to_outbox).optional()?)
}

/// Claim the single most-due claimable item.
///
/// Selection and the `delivering` transition happen in one conditional UPDATE
/// inside `BEGIN IMMEDIATE`, so the write lock is held before the candidate is
/// chosen and two connections can never hand back the same row.
pub fn claim_next_due(conn: &Connection, now: DateTime<Utc>) -> DatabaseResult<Option<OutboxRecord>> {
    let now = format_datetime(&now);
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let claimed = {
        let mut stmt = tx.prepare_cached(&format!(
            "UPDATE outbox_items SET status = 'delivering', updated_at = ?1
             WHERE id = (
                 SELECT id FROM outbox_items
                 WHERE status IN ('queued', 'failed') AND next_attempt_at <= ?1
                 ORDER BY next_attempt_at ASC, id ASC
                 LIMIT 1
             )
             AND status IN ('queued', 'failed')
             RETURNING {OUTBOX_COLUMNS}"
        ))?;
        stmt.query_row(params![now], row_to_outbox).optional()?
    };
    tx.commit()?;

    if let Some(item) = &claimed {
        debug!(id = %item.id, kind = %item.kind, attempts = item.attempts, "Claimed outbox item");
    }
    Ok(claimed)
}

/// Mark an item delivered. Dead items are never touched.
pub fn mark_outbox_delivered(conn: &Connection, id: &str, now: DateTime<Utc>) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_items SET status = 'delivered', last_error = NULL, updated_at = ?2
         WHERE id = ?1 AND status != 'dead'",
        params![id, format_datetime(&now)],
    )?;
    Ok(count > 0)
}

/// Record a failed attempt, moving the item to `failed` or `dead`.
///
/// Stored attempts become `max(stored, attempts) + 1`, so the counter never
/// decreases even when a caller reports a stale value.
pub fn mark_outbox_failed(
    conn: &Connection,
    id: &str,
    error: &str,
    attempts: i64,
    status: OutboxStatus,
    next_attempt_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    if !matches!(status, OutboxStatus::Failed | OutboxStatus::Dead) {
        return Err(DatabaseError::InvalidData(format!(
            "Failure cannot transition to status {status}"
        )));
    }
    let count = conn.execute(
        "UPDATE outbox_items
         SET status = ?2, attempts = MAX(attempts, ?3) + 1, last_error = ?4,
             next_attempt_at = ?5, updated_at = ?6
         WHERE id = ?1 AND status NOT IN ('dead', 'delivered')",
        params![
            id,
            status.as_str(),
            attempts,
            error,
            format_datetime(&next_attempt_at),
            format_datetime(&now),
        ],
    )?;
    Ok(count > 0)
}

/// Move an item straight to `dead` (permanent failure). Counts as an attempt.
pub fn mark_outbox_dead(
    conn: &Connection,
    id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE outbox_items
         SET status = 'dead', attempts = attempts + 1, last_error = ?2, updated_at = ?3
         WHERE id = ?1 AND status NOT IN ('dead', 'delivered')",
        params![id, error, format_datetime(&now)],
    )?;
    Ok(count > 0)
}

/// Return a `delivering` lease to `queued` without counting an attempt.
pub fn release_outbox_item(conn: &Connection, id: &str, now: DateTime<Utc>) -> DatabaseResult<bool> {
    let now = format_datetime(&now);
    let count = conn.execute(
        "UPDATE outbox_items SET status = 'queued', next_attempt_at = ?2, updated_at = ?2
         WHERE id = ?1 AND status = 'delivering'",
        params![id, now],
    )?;
    Ok(count > 0)
}

/// Requeue a `dead` or `failed` item for immediate delivery. Attempts are kept.
pub fn requeue_outbox_item(conn: &Connection, id: &str, now: DateTime<Utc>) -> DatabaseResult<bool> {
    let now = format_datetime(&now);
    let count = conn.execute(
        "UPDATE outbox_items SET status = 'queued', next_attempt_at = ?2, updated_at = ?2
         WHERE id = ?1 AND status IN ('dead', 'failed')",
        params![id, now],
    )?;
    Ok(count > 0)
}

/// Move leases older than `cutoff` back to `queued`.
pub fn reclaim_expired_leases(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let now = format_datetime(&now);
    let count = conn.execute(
        "UPDATE outbox_items
         SET status = 'queued', last_error = 'lease expired', next_attempt_at = ?2, updated_at = ?2
         WHERE status = 'delivering' AND updated_at < ?1",
        params![format_datetime(&cutoff), now],
    )?;
    Ok(count)
}

/// Delete delivered items last updated before `cutoff`.
pub fn prune_delivered(conn: &Connection, cutoff: DateTime<Utc>) -> DatabaseResult<usize> {
    let count = conn.execute(
        "DELETE FROM outbox_items WHERE status = 'delivered' AND updated_at < ?1",
        params![format_datetime(&cutoff)],
    )?;
    Ok(count)
}

// ==========================================
// Dead items
// ==========================================

/// Get an item by ID only if it is dead.
pub fn get_dead_item(conn: &Connection, id: &str) -> DatabaseResult<Option<OutboxRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_items WHERE id = ?1 AND status = 'dead'"
    ))?;
    Ok(stmt.query_row(params![id], row_to_outbox).optional()?)
}

/// List dead items, newest first, starting strictly after `after`.
pub fn list_dead_items(
    conn: &Connection,
    filter: &DeadItemFilter,
    after: Option<&DeadPagePosition>,
    limit: usize,
) -> DatabaseResult<Vec<OutboxRecord>> {
    let (mut clause, mut values) = dead_filter_clause(filter);
    if let Some(position) = after {
        let updated_at = format_datetime(&position.updated_at);
        clause.push_str(" AND (updated_at < ? OR (updated_at = ? AND id < ?))");
        values.push(Value::Text(updated_at.clone()));
        values.push(Value::Text(updated_at));
        values.push(Value::Text(position.id.clone()));
    }
    values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox_items
         WHERE {clause}
         ORDER BY updated_at DESC, id DESC
         LIMIT ?"
    ))?;
    let items = stmt
        .query_map(params_from_iter(values), row_to_outbox)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

/// Count dead items matching the filter.
pub fn count_dead_items(conn: &Connection, filter: &DeadItemFilter) -> DatabaseResult<u64> {
    let (clause, values) = dead_filter_clause(filter);
    let mut stmt =
        conn.prepare_cached(&format!("SELECT COUNT(*) FROM outbox_items WHERE {clause}"))?;
    let count: i64 = stmt.query_row(params_from_iter(values), |row| row.get(0))?;
    Ok(count as u64)
}

/// Retry a dead item: back to `queued` with a fresh attempt budget.
pub fn retry_dead_item(conn: &Connection, id: &str, now: DateTime<Utc>) -> DatabaseResult<bool> {
    let now = format_datetime(&now);
    let count = conn.execute(
        "UPDATE outbox_items
         SET status = 'queued', attempts = 0, last_error = NULL, next_attempt_at = ?2, updated_at = ?2
         WHERE id = ?1 AND status = 'dead'",
        params![id, now],
    )?;
    Ok(count > 0)
}

/// Delete an item only if it is dead.
pub fn purge_dead_item(conn: &Connection, id: &str) -> DatabaseResult<bool> {
    let count = conn.execute(
        "DELETE FROM outbox_items WHERE id = ?1 AND status = 'dead'",
        params![id],
    )?;
    Ok(count > 0)
}

/// Total and time range of the dead set.
pub fn dead_aggregate(conn: &Connection) -> DatabaseResult<DeadAggregate> {
    let (total, oldest, newest): (i64, Option<String>, Option<String>) = conn.query_row(
        "SELECT COUNT(*), MIN(updated_at), MAX(updated_at) FROM outbox_items WHERE status = 'dead'",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(DeadAggregate {
        total: total as u64,
        oldest_updated_at: oldest.as_deref().map(parse_stored_datetime).transpose()?,
        newest_updated_at: newest.as_deref().map(parse_stored_datetime).transpose()?,
    })
}

/// Dead item counts grouped by kind.
pub fn dead_counts_by_kind(conn: &Connection) -> DatabaseResult<Vec<GroupCount>> {
    let mut stmt = conn.prepare_cached(
        "SELECT kind, COUNT(*) AS n FROM outbox_items
         WHERE status = 'dead'
         GROUP BY kind
         ORDER BY n DESC, kind ASC",
    )?;
    let counts = stmt
        .query_map([], row_to_group_count)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(counts)
}

/// The `top` most frequent error prefixes among dead items.
///
/// A prefix is the first `prefix_len` characters of `last_error`, or
/// `"unknown"` when no error was recorded.
pub fn dead_counts_by_error_prefix(
    conn: &Connection,
    prefix_len: usize,
    top: usize,
) -> DatabaseResult<Vec<GroupCount>> {
    let mut stmt = conn.prepare_cached(
        "SELECT COALESCE(substr(last_error, 1, ?1), 'unknown') AS prefix, COUNT(*) AS n
         FROM outbox_items
         WHERE status = 'dead'
         GROUP BY prefix
         ORDER BY n DESC, prefix ASC
         LIMIT ?2",
    )?;
    let counts = stmt
        .query_map(
            params![
                i64::try_from(prefix_len).unwrap_or(i64::MAX),
                i64::try_from(top).unwrap_or(i64::MAX)
            ],
            row_to_group_count,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(counts)
}

fn dead_filter_clause(filter: &DeadItemFilter) -> (String, Vec<Value>) {
    let mut clause = String::from("status = 'dead'");
    let mut values = Vec::new();
    if let Some(kind) = &filter.kind {
        clause.push_str(" AND kind = ?");
        values.push(Value::Text(kind.clone()));
    }
    if let Some(scope_id) = &filter.scope_id {
        clause.push_str(" AND scope_id = ?");
        values.push(Value::Text(scope_id.clone()));
    }
    if let Some(pattern) = &filter.error_regex {
        clause.push_str(" AND last_error REGEXP ?");
        values.push(Value::Text(pattern.clone()));
    }
    (clause, values)
}

// ==========================================
// Idempotency records
// ==========================================

/// Insert a fresh `in_progress` record.
///
/// Returns `false` when the key already exists; the primary key decides the
/// race between concurrent inserts.
pub fn insert_idempotency_record(
    conn: &Connection,
    key: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let result = conn.execute(
        "INSERT INTO idempotency_records (key, status, started_at, expires_at)
         VALUES (?1, 'in_progress', ?2, ?3)",
        params![key, format_datetime(&now), format_datetime(&expires_at)],
    );
    match result {
        Ok(_) => Ok(true),
        Err(e) => {
            let err = DatabaseError::from(e);
            if err.is_unique_violation() {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}

/// Get an idempotency record by key.
pub fn get_idempotency_record(
    conn: &Connection,
    key: &str,
) -> DatabaseResult<Option<IdempotencyRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {IDEMPOTENCY_COLUMNS} FROM idempotency_records WHERE key = ?1"
    ))?;
    Ok(stmt.query_row(params![key], row_to_idempotency).optional()?)
}

/// Take over an `in_progress` record started before `cutoff`.
///
/// Only one caller can match the conditional update for a given `started_at`.
pub fn reclaim_stale_idempotency_record(
    conn: &Connection,
    key: &str,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "UPDATE idempotency_records SET started_at = ?3, expires_at = ?4
         WHERE key = ?1 AND status = 'in_progress' AND started_at < ?2",
        params![
            key,
            format_datetime(&cutoff),
            format_datetime(&now),
            format_datetime(&expires_at),
        ],
    )?;
    Ok(count > 0)
}

/// Delete a record only if it has expired by `now`.
pub fn delete_expired_idempotency_record(
    conn: &Connection,
    key: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<bool> {
    let count = conn.execute(
        "DELETE FROM idempotency_records WHERE key = ?1 AND expires_at <= ?2",
        params![key, format_datetime(&now)],
    )?;
    Ok(count > 0)
}

/// Upsert a `completed` record with an optional JSON result.
pub fn complete_idempotency_record(
    conn: &Connection,
    key: &str,
    result: Option<&str>,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> DatabaseResult<()> {
    let now = format_datetime(&now);
    conn.execute(
        "INSERT INTO idempotency_records (key, status, started_at, completed_at, result, expires_at)
         VALUES (?1, 'completed', ?2, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
             status = 'completed',
             completed_at = excluded.completed_at,
             result = excluded.result,
             failed_at = NULL,
             error = NULL",
        params![key, now, result, format_datetime(&expires_at)],
    )?;
    Ok(())
}

/// Upsert a `failed` record with its error text.
pub fn fail_idempotency_record(
    conn: &Connection,
    key: &str,
    error: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> DatabaseResult<()> {
    let now = format_datetime(&now);
    conn.execute(
        "INSERT INTO idempotency_records (key, status, started_at, failed_at, error, expires_at)
         VALUES (?1, 'failed', ?2, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
             status = 'failed',
             failed_at = excluded.failed_at,
             error = excluded.error,
             completed_at = NULL,
             result = NULL",
        params![key, now, error, format_datetime(&expires_at)],
    )?;
    Ok(())
}

/// Delete a record by key.
pub fn delete_idempotency_record(conn: &Connection, key: &str) -> DatabaseResult<bool> {
    let count = conn.execute(
        "DELETE FROM idempotency_records WHERE key = ?1",
        params![key],
    )?;
    Ok(count > 0)
}

/// Delete every record that has expired by `now`.
pub fn purge_expired_idempotency_records(
    conn: &Connection,
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let count = conn.execute(
        "DELETE FROM idempotency_records WHERE expires_at <= ?1",
        params![format_datetime(&now)],
    )?;
    Ok(count)
}

// ==========================================
// Helpers
// ==========================================

/// Format a timestamp for storage.
///
/// Fixed-width RFC 3339 with microseconds and a `Z` suffix, so string
/// comparison in SQL matches chronological order.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stored_datetime(s: &str) -> DatabaseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::InvalidData(format!("Invalid timestamp {s:?}: {e}")))
}

fn column_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn column_optional_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => column_datetime(row, idx).map(Some),
        None => Ok(None),
    }
}

fn invalid_text(idx: usize, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown status {value:?}").into(),
    )
}

fn row_to_outbox(row: &Row<'_>) -> rusqlite::Result<OutboxRecord> {
    let status: String = row.get(4)?;
    Ok(OutboxRecord {
        id: row.get(0)?,
        scope_id: row.get(1)?,
        kind: row.get(2)?,
        payload: row.get(3)?,
        status: OutboxStatus::parse(&status).ok_or_else(|| invalid_text(4, status))?,
        attempts: row.get(5)?,
        next_attempt_at: column_datetime(row, 6)?,
        last_error: row.get(7)?,
        created_at: column_datetime(row, 8)?,
        updated_at: column_datetime(row, 9)?,
    })
}

fn row_to_idempotency(row: &Row<'_>) -> rusqlite::Result<IdempotencyRecord> {
    let status: String = row.get(1)?;
    Ok(IdempotencyRecord {
        key: row.get(0)?,
        status: IdempotencyStatus::parse(&status).ok_or_else(|| invalid_text(1, status))?,
        started_at: column_datetime(row, 2)?,
        completed_at: column_optional_datetime(row, 3)?,
        failed_at: column_optional_datetime(row, 4)?,
        result: row.get(5)?,
        error: row.get(6)?,
        expires_at: column_datetime(row, 7)?,
    })
}

fn row_to_group_count(row: &Row<'_>) -> rusqlite::Result<GroupCount> {
    let count: i64 = row.get(1)?;
    Ok(GroupCount {
        key: row.get(0)?,
        count: count as u64,
    })
}
