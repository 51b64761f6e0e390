//! Outbox Dispatcher
//!
//! Background worker that claims due outbox events and hands them to a
//! [`TaskDistributor`]. Delivery is at-least-once: an event whose delivery
//! succeeded but whose batch failed to commit is delivered again.
//!
//! A failed delivery pushes the event's `next_attempt_at` back by
//! [`OutboxConfig::retry_delay`], so an outage of the queue costs a bounded
//! number of attempts spread over time rather than a burst of retries.
//!
//! The claiming transaction stays open while the batch is delivered, holding
//! the claimed rows' locks (and one pooled connection) for that long. Each
//! delivery is bounded by `outbox.delivery_timeout_ms`, so a batch holds them
//! for at most `batch_size * delivery_timeout`, and `store.tx_timeout_ms`
//! caps the whole body.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::OutboxConfig;
use crate::store::{OutboxEvent, Repository, Store, StoreError};
use crate::worker::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL, TaskDistributor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub dispatched: usize,
    pub failed: usize,
}

impl DispatchReport {
    /// More events may be waiting: the batch was full and at least one
    /// delivery went through. A full batch of failures waits for the next
    /// poll like any other.
    pub fn should_poll_again(&self, batch_size: i64) -> bool {
        self.dispatched > 0 && self.claimed as i64 >= batch_size
    }
}

/// Route one event to the distributor by topic.
pub async fn deliver<D>(distributor: &D, event: &OutboxEvent) -> anyhow::Result<()>
where
    D: TaskDistributor + ?Sized,
{
    match event.topic.as_str() {
        TASK_SEND_VERIFY_EMAIL => {
            let payload: PayloadSendVerifyEmail = serde_json::from_value(event.payload.clone())?;
            distributor.distribute_send_verify_email(&payload).await
        }
        other => anyhow::bail!("unknown outbox topic: {other}"),
    }
}

/// Claim up to `batch_size` due events and deliver each one. A failed or
/// timed-out delivery is counted on the row and the event is held back for
/// the backoff delay; it is no longer claimed once `max_attempts` is reached.
pub async fn dispatch_batch<R, D>(
    repo: &mut R,
    distributor: &D,
    config: &OutboxConfig,
) -> Result<DispatchReport, StoreError>
where
    R: Repository + ?Sized,
    D: TaskDistributor + ?Sized,
{
    let events = repo
        .claim_pending_outbox_events(config.batch_size, config.max_attempts)
        .await?;
    let mut report = DispatchReport {
        claimed: events.len(),
        ..Default::default()
    };

    let timeout = config.delivery_timeout();
    for event in &events {
        let outcome = match tokio::time::timeout(timeout, deliver(distributor, event)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("delivery timed out after {timeout:?}")),
        };

        match outcome {
            Ok(()) => {
                repo.mark_outbox_event_dispatched(event.id).await?;
                report.dispatched += 1;
            }
            Err(e) => {
                let retry_after = config.retry_delay(event.attempts);
                warn!(
                    event_id = event.id,
                    topic = %event.topic,
                    attempts = event.attempts + 1,
                    retry_after_ms = retry_after.as_millis() as u64,
                    error = %e,
                    "Outbox delivery failed"
                );
                repo.record_outbox_event_failure(event.id, &e.to_string(), retry_after)
                    .await?;
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

pub struct OutboxDispatcher {
    store: Store,
    distributor: Arc<dyn TaskDistributor>,
    config: OutboxConfig,
}

impl OutboxDispatcher {
    pub fn new(store: Store, distributor: Arc<dyn TaskDistributor>, config: OutboxConfig) -> Self {
        Self {
            store,
            distributor,
            config,
        }
    }

    /// Run the dispatcher loop until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            retry_base_ms = self.config.retry_base_ms,
            "Starting outbox dispatcher"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let poll_again = match self.dispatch_once().await {
                Ok(report) => report.should_poll_again(self.config.batch_size),
                Err(e) => {
                    error!(error = %e, code = e.code(), "Outbox dispatch failed");
                    false
                }
            };
            if poll_again {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Outbox dispatcher stopped");
    }

    /// Dispatch a single batch in its own transaction.
    pub async fn dispatch_once(&self) -> Result<DispatchReport, StoreError> {
        let distributor = self.distributor.clone();
        let config = self.config.clone();

        let report = self
            .store
            .run_in_transaction(move |repo| {
                Box::pin(async move { dispatch_batch(repo, distributor.as_ref(), &config).await })
            })
            .await?;

        if report.claimed > 0 {
            debug!(
                claimed = report.claimed,
                dispatched = report.dispatched,
                failed = report.failed,
                "Outbox batch dispatched"
            );
        }
        Ok(report)
    }
}
