//! Command execution against the local database.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use courier_config_and_utils::Config;
use courier_database::{queries, AsyncDatabase};
use courier_outbox::{
    Clock, DlqFilter, DlqListOptions, DlqManager, DlqPort, IdempotencyConfig, IdempotencyPort,
    NewOutboxItem, OutboxMessage, OutboxPort, RetryPolicy, SqliteIdempotencyTracker, SqliteOutbox,
    SystemClock,
};
use serde_json::{json, Value};
use tracing::info;

use crate::{Commands, DlqCommand, DlqFilterArgs, IdempotencyCommand, OutboxCommand};

/// Stores wired to one database.
pub struct Services {
    db: AsyncDatabase,
    clock: Arc<dyn Clock>,
    outbox: Arc<dyn OutboxPort>,
    dlq: Arc<dyn DlqPort>,
    idempotency: Arc<dyn IdempotencyPort>,
}

impl Services {
    pub async fn open(path: &Path, config: &Config) -> anyhow::Result<Self> {
        let db = AsyncDatabase::open(path)
            .await
            .with_context(|| format!("opening database {}", path.display()))?;
        Ok(Self::new(db, Arc::new(SystemClock), config))
    }

    pub fn new(db: AsyncDatabase, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let outbox = SqliteOutbox::new(
            db.clone(),
            clock.clone(),
            RetryPolicy::from_settings(&config.retry),
        );
        let dlq = DlqManager::new(db.clone(), clock.clone())
            .with_top_errors(config.dlq.stats_top_errors);
        let idempotency = SqliteIdempotencyTracker::new(
            db.clone(),
            clock.clone(),
            IdempotencyConfig::from_settings(&config.idempotency),
        );
        Self {
            db,
            clock,
            outbox: Arc::new(outbox),
            dlq: Arc::new(dlq),
            idempotency: Arc::new(idempotency),
        }
    }

    pub async fn close(self) -> anyhow::Result<()> {
        self.db.close().await?;
        Ok(())
    }
}

impl DlqFilterArgs {
    fn into_filter(self) -> DlqFilter {
        DlqFilter {
            kind: self.kind,
            scope_id: self.scope,
            error_pattern: self.error,
        }
    }
}

/// Run one command and return its JSON output.
pub async fn execute(
    services: &Services,
    config: &Config,
    command: Commands,
) -> anyhow::Result<Value> {
    match command {
        Commands::Dlq(command) => execute_dlq(services, command).await,
        Commands::Outbox(command) => execute_outbox(services, config, command).await,
        Commands::Idempotency(command) => execute_idempotency(services, command).await,
    }
}

async fn execute_dlq(services: &Services, command: DlqCommand) -> anyhow::Result<Value> {
    let dlq = &services.dlq;
    let output = match command {
        DlqCommand::List {
            filter,
            cursor,
            limit,
        } => {
            let page = dlq
                .list(DlqListOptions {
                    filter: filter.into_filter(),
                    cursor,
                    limit,
                })
                .await?;
            serde_json::to_value(page)?
        }
        DlqCommand::Show { id } => match dlq.get_by_id(&id).await? {
            Some(item) => serde_json::to_value(item)?,
            None => bail!("no dead item with id {id}"),
        },
        DlqCommand::Stats => serde_json::to_value(dlq.get_stats().await?)?,
        DlqCommand::Count { filter } => {
            json!({ "count": dlq.count(&filter.into_filter()).await? })
        }
        DlqCommand::Retry { ids } => serde_json::to_value(dlq.retry_batch(&ids).await?)?,
        DlqCommand::Purge { ids } => {
            let purged = dlq.purge_batch(&ids).await?;
            info!(requested = ids.len(), purged, "Purged dead items");
            json!({ "purged": purged })
        }
    };
    Ok(output)
}

async fn execute_outbox(
    services: &Services,
    config: &Config,
    command: OutboxCommand,
) -> anyhow::Result<Value> {
    let outbox = &services.outbox;
    let output = match command {
        OutboxCommand::Enqueue { message, id, scope } => {
            let message: OutboxMessage =
                serde_json::from_str(&message).context("parsing message JSON")?;
            let mut item = NewOutboxItem::new(message);
            item.id = id;
            item.scope_id = scope;
            json!({ "id": outbox.enqueue(item).await? })
        }
        OutboxCommand::ReclaimLeases { older_than_secs } => {
            let lease = Duration::from_secs(
                older_than_secs.unwrap_or(config.worker.lease_timeout_secs),
            );
            let reclaimed = outbox
                .reclaim_expired_leases(services.clock.now(), lease)
                .await?;
            json!({ "reclaimed": reclaimed })
        }
        OutboxCommand::PruneDelivered { older_than_secs } => {
            let Some(secs) = older_than_secs.or(config.worker.prune_delivered_after_secs) else {
                bail!("no retention configured; pass --older-than-secs");
            };
            let retention = chrono::Duration::try_seconds(i64::try_from(secs)?)
                .context("retention out of range")?;
            let cutoff = services
                .clock
                .now()
                .checked_sub_signed(retention)
                .context("retention out of range")?;
            json!({ "pruned": outbox.prune_delivered(cutoff).await? })
        }
        OutboxCommand::Requeue { ids } => {
            let requeued = outbox.requeue(&ids, services.clock.now()).await?;
            json!({ "requeued": requeued })
        }
    };
    Ok(output)
}

async fn execute_idempotency(
    services: &Services,
    command: IdempotencyCommand,
) -> anyhow::Result<Value> {
    let output = match command {
        IdempotencyCommand::Show { key } => {
            let record = services
                .db
                .call(move |conn| queries::get_idempotency_record(conn, &key))
                .await?;
            serde_json::to_value(record)?
        }
        IdempotencyCommand::Clear { key } => {
            json!({ "cleared": services.idempotency.clear(&key).await? })
        }
        IdempotencyCommand::PurgeExpired => {
            json!({ "purged": services.idempotency.purge_expired().await? })
        }
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use courier_outbox::ManualClock;

    const EMAIL: &str = r#"{"kind":"email","payload":{"to":["ops@example.com"],"subject":"Weekly report","text_body":"All green."}}"#;

    async fn setup() -> (Services, Config, Arc<ManualClock>) {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0).unwrap(),
        ));
        let config = Config::default();
        (Services::new(db, clock.clone(), &config), config, clock)
    }

    async fn enqueue(services: &Services, config: &Config, id: &str) {
        execute(
            services,
            config,
            Commands::Outbox(OutboxCommand::Enqueue {
                message: EMAIL.to_string(),
                id: Some(id.to_string()),
                scope: Some("tenant-1".to_string()),
            }),
        )
        .await
        .unwrap();
    }

    async fn kill(services: &Services, id: &str) {
        let claimed = services
            .outbox
            .claim_batch(services.clock.now(), 10)
            .await
            .unwrap();
        assert!(claimed.iter().any(|item| item.id == id));
        assert!(services.outbox.mark_dead(id, "smtp 550").await.unwrap());
    }

    #[tokio::test]
    async fn enqueue_returns_the_id() {
        let (services, config, _) = setup().await;
        let output = execute(
            &services,
            &config,
            Commands::Outbox(OutboxCommand::Enqueue {
                message: EMAIL.to_string(),
                id: Some("report-1".to_string()),
                scope: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(output, json!({ "id": "report-1" }));
    }

    #[tokio::test]
    async fn enqueue_rejects_email_without_body() {
        let (services, config, _) = setup().await;
        let err = execute(
            &services,
            &config,
            Commands::Outbox(OutboxCommand::Enqueue {
                message: r#"{"kind":"email","payload":{"to":["ops@example.com"],"subject":"Empty"}}"#
                    .to_string(),
                id: Some("empty-1".to_string()),
                scope: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<courier_outbox::OutboxError>(),
            Some(courier_outbox::OutboxError::InvalidPayload(_))
        ));
        assert!(services.outbox.get_item("empty-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_rejects_ids_a_cursor_cannot_carry() {
        let (services, config, _) = setup().await;
        let err = execute(
            &services,
            &config,
            Commands::Outbox(OutboxCommand::Enqueue {
                message: EMAIL.to_string(),
                id: Some("report.2026".to_string()),
                scope: None,
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<courier_outbox::OutboxError>(),
            Some(courier_outbox::OutboxError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_kinds() {
        let (services, config, _) = setup().await;
        let result = execute(
            &services,
            &config,
            Commands::Outbox(OutboxCommand::Enqueue {
                message: r#"{"kind":"sms","payload":{}}"#.to_string(),
                id: None,
                scope: None,
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn dlq_commands_see_dead_items() {
        let (services, config, _) = setup().await;
        enqueue(&services, &config, "a").await;
        kill(&services, "a").await;

        let count = execute(
            &services,
            &config,
            Commands::Dlq(DlqCommand::Count {
                filter: DlqFilterArgs {
                    error: Some("SMTP".to_string()),
                    ..DlqFilterArgs::default()
                },
            }),
        )
        .await
        .unwrap();
        assert_eq!(count, json!({ "count": 1 }));

        let page = execute(
            &services,
            &config,
            Commands::Dlq(DlqCommand::List {
                filter: DlqFilterArgs::default(),
                cursor: None,
                limit: 20,
            }),
        )
        .await
        .unwrap();
        assert_eq!(page["items"][0]["id"], "a");
        assert_eq!(page["has_more"], false);

        let stats = execute(&services, &config, Commands::Dlq(DlqCommand::Stats))
            .await
            .unwrap();
        assert_eq!(stats["total_dead"], 1);
        assert_eq!(stats["by_kind"]["email"], 1);

        let retried = execute(
            &services,
            &config,
            Commands::Dlq(DlqCommand::Retry {
                ids: vec!["a".to_string(), "missing".to_string()],
            }),
        )
        .await
        .unwrap();
        assert_eq!(retried["succeeded"], json!(["a"]));
        assert_eq!(retried["failed"][0]["id"], "missing");
    }

    #[tokio::test]
    async fn dlq_show_fails_for_live_items() {
        let (services, config, _) = setup().await;
        enqueue(&services, &config, "live").await;
        let result = execute(
            &services,
            &config,
            Commands::Dlq(DlqCommand::Show {
                id: "live".to_string(),
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reclaim_leases_uses_configured_timeout() {
        let (services, config, clock) = setup().await;
        enqueue(&services, &config, "a").await;
        services
            .outbox
            .claim_batch(clock.now(), 1)
            .await
            .unwrap();

        let command = || Commands::Outbox(OutboxCommand::ReclaimLeases {
            older_than_secs: None,
        });
        let output = execute(&services, &config, command()).await.unwrap();
        assert_eq!(output, json!({ "reclaimed": 0 }));

        clock.advance(Duration::from_secs(config.worker.lease_timeout_secs + 1));
        let output = execute(&services, &config, command()).await.unwrap();
        assert_eq!(output, json!({ "reclaimed": 1 }));
    }

    #[tokio::test]
    async fn prune_requires_a_retention() {
        let (services, mut config, _) = setup().await;
        config.worker.prune_delivered_after_secs = None;
        let result = execute(
            &services,
            &config,
            Commands::Outbox(OutboxCommand::PruneDelivered {
                older_than_secs: None,
            }),
        )
        .await;
        assert!(result.is_err());

        let output = execute(
            &services,
            &config,
            Commands::Outbox(OutboxCommand::PruneDelivered {
                older_than_secs: Some(60),
            }),
        )
        .await
        .unwrap();
        assert_eq!(output, json!({ "pruned": 0 }));
    }

    #[tokio::test]
    async fn idempotency_show_and_clear() {
        let (services, config, _) = setup().await;
        services.idempotency.check("order-7", None).await.unwrap();
        services
            .idempotency
            .complete("order-7", Some(json!({ "charge": "ch_1" })))
            .await
            .unwrap();

        let shown = execute(
            &services,
            &config,
            Commands::Idempotency(IdempotencyCommand::Show {
                key: "order-7".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(shown["status"], "completed");

        let cleared = execute(
            &services,
            &config,
            Commands::Idempotency(IdempotencyCommand::Clear {
                key: "order-7".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(cleared, json!({ "cleared": true }));

        let shown = execute(
            &services,
            &config,
            Commands::Idempotency(IdempotencyCommand::Show {
                key: "order-7".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(shown, Value::Null);
    }

    #[tokio::test]
    async fn open_creates_the_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("courier.sqlite");
        let services = Services::open(&path, &Config::default()).await.unwrap();
        assert!(path.exists());
        services.close().await.unwrap();
    }
}
