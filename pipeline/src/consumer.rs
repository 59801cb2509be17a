//! Consumes the primary queue and drives each transaction through
//! `Pending -> Rejected* -> Success`.
//!
//! A failed attempt is never retried in-process. The consumer records the
//! rejection, republishes the same payload to the delay queue with the
//! backoff delay as ttl, and acknowledges the delivery. The next attempt only
//! exists once the broker moves the message back to the primary queue, so a
//! transaction's own retries never overlap.
//!
//! Infrastructure errors while handling (store writes, publishes, an
//! unavailable verifier) leave the delivery unacknowledged and the broker
//! redelivers it. A crash between `mark_rejected` and the ack therefore
//! counts that attempt twice; `mark_success` is idempotent and absorbs the
//! same race on the success path.

use crate::backoff::BackoffPolicy;
use crate::broker::{Broker, BrokerError, Delivery, Disposition, PublishOptions, QueueTopology};
use crate::message::TransactionMessage;
use crate::notify::Notifier;
use crate::outcome::{Outcome, OutcomeDecider, OutcomeError};
use crate::store::{MarkOutcome, StoreError, TransactionStore};
use crate::transaction::{Transaction, TransactionId};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to publish retry: {0}")]
    Publish(#[from] BrokerError),
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
}

/// How a delivery was resolved. Every variant is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Succeeded(TransactionId),
    Retrying {
        id: TransactionId,
        attempt: u32,
        delay: Duration,
    },
    /// Duplicate delivery for a transaction that already succeeded.
    AlreadySucceeded(TransactionId),
    /// The referenced transaction does not exist.
    Stale(TransactionId),
    Malformed,
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Maximum deliveries handled concurrently.
    pub prefetch: usize,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_grace: Duration,
    /// Upper bound on one outcome decision. Must stay below the broker's
    /// delivery lease, or a slow decision overlaps its own redelivery.
    pub decide_timeout: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            prefetch: 16,
            shutdown_grace: Duration::from_secs(30),
            decide_timeout: Duration::from_secs(60),
        }
    }
}

pub struct Consumer {
    store: Arc<dyn TransactionStore>,
    broker: Arc<dyn Broker>,
    outcome: Arc<dyn OutcomeDecider>,
    notifier: Arc<dyn Notifier>,
    backoff: BackoffPolicy,
    topology: QueueTopology,
    options: ConsumerOptions,
}

impl Consumer {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        broker: Arc<dyn Broker>,
        outcome: Arc<dyn OutcomeDecider>,
        notifier: Arc<dyn Notifier>,
        backoff: BackoffPolicy,
        topology: QueueTopology,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            store,
            broker,
            outcome,
            notifier,
            backoff,
            topology,
            options,
        }
    }

    /// Runs one attempt for the transaction referenced by `payload`.
    pub async fn process(&self, payload: &Bytes) -> Result<Handled, HandleError> {
        let msg = match TransactionMessage::parse(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "discarding malformed message");
                return Ok(Handled::Malformed);
            }
        };

        let Some(tx) = self.store.get(msg.id).await? else {
            tracing::warn!(transaction_id = %msg.id, "transaction not found, acking");
            return Ok(Handled::Stale(msg.id));
        };

        if tx.status.is_terminal() {
            tracing::debug!(transaction_id = %tx.id, "transaction already succeeded, acking");
            return Ok(Handled::AlreadySucceeded(tx.id));
        }

        tracing::debug!(
            transaction_id = %tx.id,
            correlation_id = %tx.correlation_id,
            attempt = tx.attempt_count + 1,
            "processing transaction"
        );

        let outcome = tokio::time::timeout(self.options.decide_timeout, self.outcome.decide(&tx))
            .await
            .map_err(|_| {
                tracing::warn!(
                    transaction_id = %tx.id,
                    timeout_secs = self.options.decide_timeout.as_secs(),
                    "outcome decision timed out"
                );
                OutcomeError::Unavailable
            })??;

        match outcome {
            Outcome::Succeeded => self.succeed(tx).await,
            Outcome::Failed => self.reject(tx, payload.clone()).await,
        }
    }

    async fn succeed(&self, tx: Transaction) -> Result<Handled, HandleError> {
        match self.store.mark_success(tx.id).await {
            Ok(MarkOutcome::Applied(updated)) => {
                self.notifier.notify(&updated).await;
                tracing::info!(
                    transaction_id = %updated.id,
                    attempts = updated.attempt_count + 1,
                    "processed successfully"
                );
                Ok(Handled::Succeeded(updated.id))
            }
            Ok(MarkOutcome::AlreadySucceeded) => Ok(Handled::AlreadySucceeded(tx.id)),
            Err(StoreError::NotFound(id)) => Ok(Handled::Stale(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn reject(&self, tx: Transaction, payload: Bytes) -> Result<Handled, HandleError> {
        let attempt = tx.attempt_count + 1;
        let delay = self.backoff.delay(attempt);
        let next_attempt_at = OffsetDateTime::now_utc() + delay;

        match self.store.mark_rejected(tx.id, next_attempt_at).await {
            Ok(MarkOutcome::Applied(_)) => {}
            Ok(MarkOutcome::AlreadySucceeded) => return Ok(Handled::AlreadySucceeded(tx.id)),
            Err(StoreError::NotFound(id)) => return Ok(Handled::Stale(id)),
            Err(e) => return Err(e.into()),
        }

        self.broker
            .enqueue(&self.topology.delay, payload, PublishOptions::with_ttl(delay))
            .await?;

        tracing::info!(
            transaction_id = %tx.id,
            attempt,
            delay_secs = delay.as_secs(),
            "attempt failed, retry scheduled"
        );
        Ok(Handled::Retrying {
            id: tx.id,
            attempt,
            delay,
        })
    }

    /// Handles one delivery and says how to settle it.
    pub async fn handle(&self, delivery: &Delivery) -> Disposition {
        match self.process(&delivery.payload).await {
            Ok(_) => Disposition::Ack,
            Err(e) => {
                tracing::error!(
                    tag = delivery.tag,
                    redelivered = delivery.redelivered,
                    error = %e,
                    "processing error, leaving message unacknowledged"
                );
                Disposition::Requeue
            }
        }
    }

    /// Consumes the primary queue until `shutdown` fires, then waits up to
    /// the grace period for in-flight handlers.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.options.prefetch.max(1)));
        let mut in_flight = JoinSet::new();

        tracing::info!(
            queue = %self.topology.primary,
            prefetch = self.options.prefetch,
            "consumer started"
        );

        loop {
            while let Some(res) = in_flight.try_join_next() {
                if let Err(e) = res {
                    tracing::error!(error = %e, "delivery handler panicked");
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = self.broker.next_delivery(&self.topology.primary) => delivery,
            };

            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(BrokerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to receive delivery");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => continue,
                    }
                }
            };

            let consumer = self.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                let disposition = consumer.handle(&delivery).await;
                if let Err(e) = consumer.broker.settle(&delivery, disposition).await {
                    tracing::error!(
                        tag = delivery.tag,
                        error = %e,
                        "failed to settle delivery"
                    );
                }
            });
        }

        tracing::info!(in_flight = in_flight.len(), "consumer stopping");

        let grace = self.options.shutdown_grace;
        if tokio::time::timeout(grace, Self::drain(&mut in_flight))
            .await
            .is_err()
        {
            tracing::warn!(
                abandoned = in_flight.len(),
                "grace period elapsed, remaining deliveries stay unacknowledged"
            );
            in_flight.detach_all();
        }

        tracing::info!("consumer stopped");
    }

    async fn drain(in_flight: &mut JoinSet<()>) {
        while let Some(res) = in_flight.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "delivery handler panicked");
            }
        }
    }
}
