use crate::broker::{Broker, BrokerError, PublishOptions};
use crate::message::TransactionMessage;
use crate::store::{StoreError, TransactionStore};
use crate::transaction::{Amount, CorrelationId, NewTransaction, Transaction};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("failed to persist transaction: {0}")]
    Store(#[from] StoreError),
    #[error("failed to publish transaction {id}: {source}")]
    Publish {
        id: crate::transaction::TransactionId,
        #[source]
        source: BrokerError,
    },
}

/// Supplies the business fields of each generated transaction.
pub trait WorkItemSource: Send + Sync {
    fn next_item(&self) -> NewTransaction;
}

/// Uniformly random correlation ids and amounts.
#[derive(Debug, Clone)]
pub struct RandomWorkItems {
    correlation_range: u32,
    amounts: RangeInclusive<i64>,
}

impl RandomWorkItems {
    /// `amounts` is clamped to start at 1.
    pub fn new(correlation_range: u32, amounts: RangeInclusive<i64>) -> Self {
        let (lo, hi) = amounts.into_inner();
        let lo = lo.max(1);
        Self {
            correlation_range: correlation_range.max(1),
            amounts: lo..=hi.max(lo),
        }
    }
}

impl Default for RandomWorkItems {
    fn default() -> Self {
        Self::new(1000, 10..=999)
    }
}

impl WorkItemSource for RandomWorkItems {
    fn next_item(&self) -> NewTransaction {
        let mut rng = rand::rng();
        let correlation = rng.random_range(0..self.correlation_range);
        let minor_units = rng.random_range(self.amounts.clone());

        NewTransaction::new(
            CorrelationId::from(correlation),
            Amount::clamped(minor_units),
        )
    }
}

/// Creates work items, persists them, then publishes them to the primary
/// queue.
pub struct Producer {
    store: Arc<dyn TransactionStore>,
    broker: Arc<dyn Broker>,
    queue: String,
    source: Arc<dyn WorkItemSource>,
}

impl Producer {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        source: Arc<dyn WorkItemSource>,
    ) -> Self {
        Self {
            store,
            broker,
            queue: queue.into(),
            source,
        }
    }

    /// Produces `count` transactions one after another.
    ///
    /// Stops at the first failure. Transactions produced before it stay
    /// stored and queued and are processed normally.
    pub async fn generate(&self, count: usize) -> Result<Vec<Transaction>, ProducerError> {
        let mut produced = Vec::new();

        for _ in 0..count {
            produced.push(self.produce_one(self.source.next_item()).await?);
        }

        if count > 0 {
            tracing::info!(count, queue = %self.queue, "generated transactions");
        }
        Ok(produced)
    }

    pub async fn produce_one(&self, new: NewTransaction) -> Result<Transaction, ProducerError> {
        let tx = self.store.create(new).await?;

        let payload = TransactionMessage::from(&tx).to_bytes();
        if let Err(source) = self
            .broker
            .enqueue(&self.queue, payload, PublishOptions::default())
            .await
        {
            tracing::error!(
                transaction_id = %tx.id,
                error = %source,
                "stored transaction could not be published"
            );
            return Err(ProducerError::Publish { id: tx.id, source });
        }

        tracing::debug!(
            transaction_id = %tx.id,
            correlation_id = %tx.correlation_id,
            amount = %tx.amount,
            "inserted transaction"
        );
        Ok(tx)
    }
}
