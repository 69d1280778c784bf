//! Claims raced across separate connections to one database file.

use chrono::Utc;
use courier_database::AsyncDatabase;
use courier_outbox::{
    EmailMessage, NewOutboxItem, OutboxMessage, OutboxPort, OutboxStatus, RetryPolicy,
    SqliteOutbox, SystemClock,
};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

const WORKERS: usize = 6;
const ITEMS: usize = 60;

fn message(i: usize) -> OutboxMessage {
    OutboxMessage::Email(EmailMessage {
        to: vec![format!("user{i}@example.com")],
        subject: format!("Receipt {i}"),
        text_body: Some("Thanks".to_string()),
        html_body: None,
    })
}

async fn open_outbox(path: &Path) -> SqliteOutbox {
    let db = AsyncDatabase::open(path).await.unwrap();
    SqliteOutbox::new(db, Arc::new(SystemClock), RetryPolicy::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_item_is_claimed_twice() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.sqlite");

    // Each outbox has its own connection and executor thread, like separate processes.
    let mut outboxes = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
        outboxes.push(open_outbox(&path).await);
    }

    let mut enqueued = HashSet::new();
    for i in 0..ITEMS {
        enqueued.insert(outboxes[0].enqueue(NewOutboxItem::new(message(i))).await.unwrap());
    }

    let now = Utc::now();
    let runs = outboxes.into_iter().map(|outbox| {
        tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = outbox.claim_batch(now, 4).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                for item in batch {
                    assert_eq!(item.status, OutboxStatus::Delivering);
                    mine.push(item.id);
                }
            }
            mine
        })
    });
    let per_worker: Vec<Vec<String>> = join_all(runs)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let all: Vec<&String> = per_worker.iter().flatten().collect();
    let distinct: HashSet<String> = all.iter().map(|id| id.to_string()).collect();
    assert_eq!(all.len(), ITEMS, "every item claimed exactly once");
    assert_eq!(distinct, enqueued);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_single_claims_on_one_item() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.sqlite");

    let mut outboxes = Vec::with_capacity(WORKERS);
    for _ in 0..WORKERS {
        outboxes.push(open_outbox(&path).await);
    }
    let id = outboxes[0].enqueue(NewOutboxItem::new(message(0))).await.unwrap();

    let now = Utc::now();
    let runs = outboxes
        .into_iter()
        .map(|outbox| tokio::spawn(async move { outbox.claim_batch(now, 1).await.unwrap() }));
    let winners: Vec<_> = join_all(runs)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|batch| !batch.is_empty())
        .collect();

    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0][0].id, id);
}
