#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use pipeline::broker::MemoryBroker;
use pipeline::store::MemoryTransactionStore;
use pipeline::{
    Amount, BackoffPolicy, Broker, BrokerError, Consumer, ConsumerOptions, CorrelationId,
    Delivery, Disposition, MarkOutcome, NewTransaction, Notifier, Outcome, OutcomeDecider,
    OutcomeError, Producer, PublishOptions, QueueTopology, StatusSummary, StoreError,
    Transaction, TransactionId, TransactionStore, WorkItemSource,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

pub const PRIMARY: &str = "processing_queue";
pub const DELAY: &str = "retry_queue";
pub const REDELIVERY: Duration = Duration::from_secs(30);

pub fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

/// Fails the first `n` attempts of every transaction, then succeeds.
pub struct FailTimes(pub u32);

#[async_trait]
impl OutcomeDecider for FailTimes {
    async fn decide(&self, tx: &Transaction) -> Result<Outcome, OutcomeError> {
        if tx.attempt_count >= self.0 {
            Ok(Outcome::Succeeded)
        } else {
            Ok(Outcome::Failed)
        }
    }
}

/// Fails the first `n` calls with an unavailable verifier, then defers.
pub struct UnavailableFirst {
    pub remaining: AtomicU32,
    pub then: FailTimes,
}

#[async_trait]
impl OutcomeDecider for UnavailableFirst {
    async fn decide(&self, tx: &Transaction) -> Result<Outcome, OutcomeError> {
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OutcomeError::Unavailable);
        }
        self.then.decide(tx).await
    }
}

/// A verifier that accepts the request and never replies.
pub struct NeverAnswers;

#[async_trait]
impl OutcomeDecider for NeverAnswers {
    async fn decide(&self, _tx: &Transaction) -> Result<Outcome, OutcomeError> {
        std::future::pending().await
    }
}

#[derive(Default)]
pub struct CountingNotifier {
    pub calls: AtomicUsize,
}

impl CountingNotifier {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn notify(&self, _tx: &Transaction) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Always yields the same correlation id and amount.
pub struct FixedWorkItems {
    pub correlation_id: &'static str,
    pub amount: i64,
}

impl WorkItemSource for FixedWorkItems {
    fn next_item(&self) -> NewTransaction {
        NewTransaction::new(
            CorrelationId::new(self.correlation_id),
            Amount::new(self.amount).unwrap(),
        )
    }
}

/// Memory store whose next `fail_rejects` rejections error out, and whose
/// creates fail once `create_limit` of them have been attempted.
pub struct FlakyStore {
    pub inner: Arc<MemoryTransactionStore>,
    pub fail_rejects: AtomicU32,
    pub creates: AtomicUsize,
    pub create_limit: usize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryTransactionStore>, fail_rejects: u32) -> Self {
        Self {
            inner,
            fail_rejects: AtomicU32::new(fail_rejects),
            creates: AtomicUsize::new(0),
            create_limit: usize::MAX,
        }
    }

    pub fn with_create_limit(mut self, limit: usize) -> Self {
        self.create_limit = limit;
        self
    }
}

#[async_trait]
impl TransactionStore for FlakyStore {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, StoreError> {
        if self.creates.fetch_add(1, Ordering::SeqCst) >= self.create_limit {
            return Err(StoreError::Unavailable(deadpool_postgres::PoolError::Closed));
        }
        self.inner.create(new).await
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        self.inner.get(id).await
    }

    async fn mark_success(&self, id: TransactionId) -> Result<MarkOutcome, StoreError> {
        self.inner.mark_success(id).await
    }

    async fn mark_rejected(
        &self,
        id: TransactionId,
        next_attempt_at: OffsetDateTime,
    ) -> Result<MarkOutcome, StoreError> {
        if self
            .fail_rejects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable(deadpool_postgres::PoolError::Closed));
        }
        self.inner.mark_rejected(id, next_attempt_at).await
    }

    async fn summary(&self) -> Result<StatusSummary, StoreError> {
        self.inner.summary().await
    }
}

/// Memory broker whose next `fail_publishes` publishes error out, that
/// refuses everything after `publish_limit` successful publishes, and that
/// counts successful publishes.
pub struct FlakyBroker {
    pub inner: Arc<MemoryBroker>,
    pub fail_publishes: AtomicU32,
    pub publishes: AtomicUsize,
    pub publish_limit: usize,
}

impl FlakyBroker {
    pub fn new(inner: Arc<MemoryBroker>, fail_publishes: u32) -> Self {
        Self {
            inner,
            fail_publishes: AtomicU32::new(fail_publishes),
            publishes: AtomicUsize::new(0),
            publish_limit: usize::MAX,
        }
    }

    pub fn with_publish_limit(mut self, limit: usize) -> Self {
        self.publish_limit = limit;
        self
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn declare(&self, topology: &QueueTopology) -> Result<(), BrokerError> {
        self.inner.declare(topology).await
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        if self.publishes.load(Ordering::SeqCst) >= self.publish_limit
            || self
                .fail_publishes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(BrokerError::Unavailable(deadpool_postgres::PoolError::Closed));
        }
        self.inner.enqueue(queue, payload, options).await?;
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_delivery(&self, queue: &str) -> Result<Delivery, BrokerError> {
        self.inner.next_delivery(queue).await
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        disposition: Disposition,
    ) -> Result<(), BrokerError> {
        self.inner.settle(delivery, disposition).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

pub struct Harness {
    pub store: Arc<MemoryTransactionStore>,
    pub broker: Arc<MemoryBroker>,
    pub notifier: Arc<CountingNotifier>,
    pub producer: Producer,
    pub consumer: Arc<Consumer>,
}

pub async fn harness(
    decider: Arc<dyn OutcomeDecider>,
    items: Arc<dyn WorkItemSource>,
) -> Harness {
    let store = Arc::new(MemoryTransactionStore::new());
    let broker = Arc::new(MemoryBroker::new(REDELIVERY));
    harness_with(store.clone(), broker.clone(), store, broker, decider, items).await
}

/// Wires producer and consumer through `store_view`/`broker_view`, which may
/// wrap the inspected `store`/`broker`.
pub async fn harness_with(
    store: Arc<MemoryTransactionStore>,
    broker: Arc<MemoryBroker>,
    store_view: Arc<dyn TransactionStore>,
    broker_view: Arc<dyn Broker>,
    decider: Arc<dyn OutcomeDecider>,
    items: Arc<dyn WorkItemSource>,
) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let topology = QueueTopology::new(PRIMARY, DELAY);
    broker_view.declare(&topology).await.unwrap();

    let notifier = Arc::new(CountingNotifier::default());
    let producer = Producer::new(store_view.clone(), broker_view.clone(), PRIMARY, items);
    let consumer = Arc::new(Consumer::new(
        store_view,
        broker_view,
        decider,
        notifier.clone(),
        BackoffPolicy::reference(),
        topology,
        ConsumerOptions {
            prefetch: 4,
            shutdown_grace: Duration::from_secs(5),
            decide_timeout: Duration::from_secs(10),
        },
    ));

    Harness {
        store,
        broker,
        notifier,
        producer,
        consumer,
    }
}

impl Harness {
    /// Takes the next delivery, handles it and settles it.
    pub async fn step(&self) -> (Delivery, Disposition) {
        let delivery = self.broker.next_delivery(PRIMARY).await.unwrap();
        let disposition = self.consumer.handle(&delivery).await;
        self.broker.settle(&delivery, disposition).await.unwrap();
        (delivery, disposition)
    }

    pub async fn record(&self, id: TransactionId) -> Transaction {
        self.store.get(id).await.unwrap().unwrap()
    }
}
