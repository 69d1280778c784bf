//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an outbox item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    /// Waiting to be claimed once `next_attempt_at` is due.
    Queued,
    /// Leased by a worker.
    Delivering,
    /// Delivered successfully. Terminal.
    Delivered,
    /// Last attempt failed; claimable again once due.
    Failed,
    /// Retries exhausted. Only requeue or purge touch it.
    Dead,
}

impl Default for OutboxStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Parse a stored status. Unknown values are rejected rather than defaulted,
    /// so a corrupt row can never become claimable.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "delivering" => Some(Self::Delivering),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbox item row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub scope_id: Option<String>,
    pub kind: String,
    /// JSON-encoded payload, validated before insert.
    pub payload: String,
    pub status: OutboxStatus,
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New outbox item for insertion.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub id: String,
    pub scope_id: Option<String>,
    pub kind: String,
    pub payload: String,
}

/// Filter applied to dead-item queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadItemFilter {
    /// Exact match on `kind`.
    pub kind: Option<String>,
    /// Exact match on `scope_id`.
    pub scope_id: Option<String>,
    /// Regex matched against `last_error` with the `REGEXP` operator.
    pub error_regex: Option<String>,
}

/// Position after which a dead-item page starts (exclusive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadPagePosition {
    pub updated_at: DateTime<Utc>,
    pub id: String,
}

/// Aggregate over the dead set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadAggregate {
    pub total: u64,
    pub oldest_updated_at: Option<DateTime<Utc>>,
    pub newest_updated_at: Option<DateTime<Utc>>,
}

/// A grouped count (by kind or by error prefix).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCount {
    pub key: String,
    pub count: u64,
}

/// Idempotency record status. Absence of a row means "never seen".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Idempotency record row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// JSON-encoded cached result.
    pub result: Option<String>,
    pub error: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_status_roundtrip() {
        for status in [
            OutboxStatus::Queued,
            OutboxStatus::Delivering,
            OutboxStatus::Delivered,
            OutboxStatus::Failed,
            OutboxStatus::Dead,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("QUEUED"), None);
        assert_eq!(OutboxStatus::parse(""), None);
    }

    #[test]
    fn test_outbox_status_serde_matches_storage() {
        let json = serde_json::to_string(&OutboxStatus::Delivering).unwrap();
        assert_eq!(json, "\"delivering\"");
    }

    #[test]
    fn test_idempotency_status_roundtrip() {
        for status in [
            IdempotencyStatus::InProgress,
            IdempotencyStatus::Completed,
            IdempotencyStatus::Failed,
        ] {
            assert_eq!(IdempotencyStatus::parse(status.as_str()), Some(status));
        }
        let json = serde_json::to_string(&IdempotencyStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
