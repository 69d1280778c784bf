//! # DeliveryWorker: outbox delivery loop
//!
//! Polls the outbox for due items, hands each one to a caller-supplied
//! [`Dispatcher`], and reports the outcome back to the outbox. The outbox owns
//! retry timing through `next_attempt_at`; this crate owns polling, deadlines
//! and cancellation.
//!
//! ## Poll cycle
//!
//! ```text
//! reclaim expired leases ─▶ claim batch ─▶ dispatch each ─▶ mark outcome
//!                                              │
//!                                   deadline passed? release the rest
//! ```
//!
//! | Dispatch result            | Outbox call                          |
//! |----------------------------|--------------------------------------|
//! | `Ok(())`                   | `mark_success`                       |
//! | `DispatchError::Transient` | `mark_failure` with stored attempts  |
//! | `DispatchError::Permanent` | `mark_dead`                          |
//! | payload does not decode    | `mark_dead`                          |
//!
//! ## Example
//!
//! ```ignore
//! let worker = Arc::new(DeliveryWorker::new(outbox, dispatcher, clock, config));
//! let token = CancellationToken::new();
//! let handle = worker.clone().start(token.clone());
//! // ...
//! token.cancel();
//! handle.await?;
//! ```

use async_trait::async_trait;
use courier_config_and_utils::WorkerSettings;
use courier_outbox::{
    Clock, FailureOutcome, OutboxItem, OutboxMessage, OutboxPort, OutboxResult,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a dispatch did not deliver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Worth retrying later (timeouts, 5xx, throttling).
    #[error("transient dispatch error: {0}")]
    Transient(String),

    /// Retrying cannot help (rejected recipient, 4xx, bad credentials).
    #[error("permanent dispatch error: {0}")]
    Permanent(String),
}

/// Performs the actual delivery for one item.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, item: &OutboxItem, message: &OutboxMessage)
        -> Result<(), DispatchError>;
}

/// Configuration for polling and lease handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryWorkerConfig {
    /// Items claimed per poll.
    pub batch_size: usize,
    /// Wait between polls when the last poll did not fill a batch.
    pub poll_interval: Duration,
    /// Leases older than this are returned to the queue at the next poll.
    pub lease_timeout: Duration,
    /// Delivered items older than this are deleted at each poll.
    pub prune_delivered_after: Option<Duration>,
}

impl Default for DeliveryWorkerConfig {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default())
    }
}

impl DeliveryWorkerConfig {
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            lease_timeout: Duration::from_secs(settings.lease_timeout_secs),
            prune_delivered_after: settings.prune_delivered_after_secs.map(Duration::from_secs),
        }
    }
}

/// Counts from one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub reclaimed: usize,
    pub claimed: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub dead_lettered: usize,
    /// Claimed but handed back because the deadline passed.
    pub released: usize,
    pub pruned: usize,
}

/// Outbox delivery worker.
pub struct DeliveryWorker {
    outbox: Arc<dyn OutboxPort>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    config: DeliveryWorkerConfig,
}

impl DeliveryWorker {
    pub fn new(
        outbox: Arc<dyn OutboxPort>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
        config: DeliveryWorkerConfig,
    ) -> Self {
        Self {
            outbox,
            dispatcher,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &DeliveryWorkerConfig {
        &self.config
    }

    /// Runs a single poll.
    ///
    /// No dispatch starts after `deadline`; items already claimed at that point
    /// are released without counting an attempt. Storage errors abort the poll
    /// and are returned; leases left behind are recovered by lease expiry.
    pub async fn run_once(&self, deadline: Option<Instant>) -> OutboxResult<DeliveryReport> {
        let mut report = DeliveryReport::default();
        let now = self.clock.now();

        report.reclaimed = self
            .outbox
            .reclaim_expired_leases(now, self.config.lease_timeout)
            .await?;

        if let Some(retention) = self.config.prune_delivered_after {
            if let Some(cutoff) = chrono::Duration::from_std(retention)
                .ok()
                .and_then(|retention| now.checked_sub_signed(retention))
            {
                report.pruned = self.outbox.prune_delivered(cutoff).await?;
            }
        }

        let items = self.outbox.claim_batch(now, self.config.batch_size).await?;
        report.claimed = items.len();

        let mut pending = items.into_iter();
        for item in pending.by_ref() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                self.release(&item, &mut report).await?;
                break;
            }
            self.deliver(item, &mut report).await?;
        }
        for item in pending {
            self.release(&item, &mut report).await?;
        }

        if report.claimed > 0 || report.reclaimed > 0 {
            info!(
                claimed = report.claimed,
                delivered = report.delivered,
                retrying = report.retrying,
                dead_lettered = report.dead_lettered,
                released = report.released,
                reclaimed = report.reclaimed,
                "Delivery poll finished"
            );
        }
        Ok(report)
    }

    async fn deliver(&self, item: OutboxItem, report: &mut DeliveryReport) -> OutboxResult<()> {
        let message = match item.message() {
            Ok(message) => message,
            Err(e) => {
                warn!(id = %item.id, kind = %item.kind, error = %e, "Undeliverable payload");
                if self
                    .outbox
                    .mark_dead(&item.id, &format!("invalid payload: {e}"))
                    .await?
                {
                    report.dead_lettered += 1;
                }
                return Ok(());
            }
        };

        match self.dispatcher.dispatch(&item, &message).await {
            Ok(()) => {
                if self.outbox.mark_success(&item.id).await? {
                    report.delivered += 1;
                }
            }
            Err(DispatchError::Transient(error)) => {
                match self
                    .outbox
                    .mark_failure(&item.id, &error, item.attempts)
                    .await?
                {
                    FailureOutcome::Retrying { .. } => report.retrying += 1,
                    FailureOutcome::DeadLettered => report.dead_lettered += 1,
                    FailureOutcome::Skipped => {
                        debug!(id = %item.id, "Failure not recorded, item changed meanwhile")
                    }
                }
            }
            Err(DispatchError::Permanent(error)) => {
                if self.outbox.mark_dead(&item.id, &error).await? {
                    report.dead_lettered += 1;
                }
            }
        }
        Ok(())
    }

    async fn release(&self, item: &OutboxItem, report: &mut DeliveryReport) -> OutboxResult<()> {
        if self.outbox.release(&item.id).await? {
            report.released += 1;
        }
        Ok(())
    }

    /// Starts the polling loop.
    ///
    /// Polls again immediately after a full batch, otherwise waits
    /// `poll_interval`. Each poll stops dispatching once its claimed leases
    /// could expire. Returns when `token` is cancelled.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                batch_size = self.config.batch_size,
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                "Delivery worker started"
            );
            let mut wait = Duration::ZERO;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let deadline = Instant::now() + self.config.lease_timeout;
                wait = match self.run_once(Some(deadline)).await {
                    Ok(report) if report.claimed >= self.config.batch_size.max(1) => Duration::ZERO,
                    Ok(_) => self.config.poll_interval,
                    Err(e) => {
                        warn!(error = %e, "Delivery poll failed");
                        self.config.poll_interval
                    }
                };
            }
            info!("Delivery worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_settings() {
        let settings = WorkerSettings {
            batch_size: 25,
            poll_interval_ms: 250,
            lease_timeout_secs: 60,
            prune_delivered_after_secs: None,
        };
        let config = DeliveryWorkerConfig::from_settings(&settings);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.lease_timeout, Duration::from_secs(60));
        assert_eq!(config.prune_delivered_after, None);
    }

    #[test]
    fn default_config_keeps_a_week_of_deliveries() {
        let config = DeliveryWorkerConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(
            config.prune_delivered_after,
            Some(Duration::from_secs(7 * 24 * 3600))
        );
    }

    #[test]
    fn dispatch_error_messages() {
        assert_eq!(
            DispatchError::Transient("timeout".to_string()).to_string(),
            "transient dispatch error: timeout"
        );
        assert_eq!(
            DispatchError::Permanent("550".to_string()).to_string(),
            "permanent dispatch error: 550"
        );
    }
}
