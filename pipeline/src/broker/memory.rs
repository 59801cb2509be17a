use super::{Broker, BrokerError, Delivery, Disposition, PublishOptions, QueueTopology};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Instant;

const BUFFER_SIZE: usize = 8 * 1024;

struct Envelope {
    payload: Bytes,
    deliveries: u32,
}

struct ScheduledItem {
    due: Instant,
    target: String,
    envelope: Envelope,
}

impl PartialEq for ScheduledItem {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for ScheduledItem {}

impl PartialOrd for ScheduledItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.due.cmp(&self.due)
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    dead_letter_to: Option<String>,
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, (String, Envelope)>,
    next_tag: u64,
    closed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    ready: Notify,
    scheduled: AtomicUsize,
}

impl Shared {
    async fn push_ready(&self, queue: &str, envelope: Envelope) {
        let mut inner = self.inner.lock().await;
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(envelope);
        drop(inner);
        self.ready.notify_waiters();
    }
}

/// In-process broker. Ttl expiry and unacknowledged redelivery both go
/// through one timer heap that republishes due messages to their target
/// queue. Nothing survives a restart.
pub struct MemoryBroker {
    shared: Arc<Shared>,
    scheduler: mpsc::Sender<ScheduledItem>,
    redelivery_delay: Duration,
}

impl MemoryBroker {
    /// Must be called from within a Tokio runtime.
    pub fn new(redelivery_delay: Duration) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            ready: Notify::new(),
            scheduled: AtomicUsize::new(0),
        });
        let (scheduler, receiver) = mpsc::channel(BUFFER_SIZE);

        let shared_clone = shared.clone();
        tokio::spawn(async move {
            Self::requeue_loop(shared_clone, receiver).await;
        });

        Self {
            shared,
            scheduler,
            redelivery_delay,
        }
    }

    async fn requeue_loop(shared: Arc<Shared>, mut receiver: mpsc::Receiver<ScheduledItem>) {
        let mut heap: BinaryHeap<ScheduledItem> = BinaryHeap::with_capacity(1024);

        loop {
            let now = Instant::now();
            while heap.peek().is_some_and(|item| item.due <= now) {
                if let Some(item) = heap.pop() {
                    shared.scheduled.fetch_sub(1, Ordering::Relaxed);
                    tracing::debug!(queue = %item.target, "requeueing due message");
                    shared.push_ready(&item.target, item.envelope).await;
                }
            }

            let next_timer = heap.peek().map(|item| tokio::time::sleep_until(item.due));

            tokio::select! {
                item = receiver.recv() => {
                    match item {
                        Some(item) => heap.push(item),
                        None => {
                            tracing::debug!(dropped = heap.len(), "requeue loop stopped");
                            return;
                        }
                    }
                }
                _ = async {
                    match next_timer {
                        Some(timer) => timer.await,
                        None => std::future::pending().await,
                    }
                } => {}
            }
        }
    }

    async fn schedule(
        &self,
        target: String,
        envelope: Envelope,
        after: Duration,
    ) -> Result<(), BrokerError> {
        self.shared.scheduled.fetch_add(1, Ordering::Relaxed);
        let item = ScheduledItem {
            due: Instant::now() + after,
            target,
            envelope,
        };

        self.scheduler.send(item).await.map_err(|_| {
            self.shared.scheduled.fetch_sub(1, Ordering::Relaxed);
            BrokerError::Closed
        })
    }

    /// Messages ready for immediate delivery on `queue`.
    pub async fn ready_len(&self, queue: &str) -> usize {
        let inner = self.shared.inner.lock().await;
        inner.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub async fn unacked_len(&self) -> usize {
        self.shared.inner.lock().await.unacked.len()
    }

    /// Messages waiting for a ttl or a redelivery delay to pass.
    pub fn scheduled_len(&self) -> usize {
        self.shared.scheduled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, topology: &QueueTopology) -> Result<(), BrokerError> {
        let mut inner = self.shared.inner.lock().await;
        inner.queues.entry(topology.primary.clone()).or_default();
        inner.queues.entry(topology.delay.clone()).or_default().dead_letter_to =
            Some(topology.primary.clone());
        Ok(())
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        let dead_letter_to = {
            let inner = self.shared.inner.lock().await;
            if inner.closed {
                return Err(BrokerError::Closed);
            }
            let state = inner
                .queues
                .get(queue)
                .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
            state.dead_letter_to.clone()
        };

        let envelope = Envelope {
            payload,
            deliveries: 0,
        };

        match (options.ttl, dead_letter_to) {
            (Some(ttl), Some(target)) => self.schedule(target, envelope, ttl).await,
            (Some(_), None) => Err(BrokerError::TtlWithoutDeadLetter(queue.to_string())),
            (None, Some(_)) => Err(BrokerError::TtlRequired(queue.to_string())),
            (None, None) => {
                self.shared.push_ready(queue, envelope).await;
                Ok(())
            }
        }
    }

    async fn next_delivery(&self, queue: &str) -> Result<Delivery, BrokerError> {
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.shared.inner.lock().await;
                let inner = &mut *guard;
                if inner.closed {
                    return Err(BrokerError::Closed);
                }

                let state = inner
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
                if state.dead_letter_to.is_some() {
                    return Err(BrokerError::NotConsumable(queue.to_string()));
                }

                if let Some(mut envelope) = state.ready.pop_front() {
                    envelope.deliveries += 1;
                    inner.next_tag += 1;
                    let delivery = Delivery {
                        tag: inner.next_tag,
                        queue: queue.to_string(),
                        payload: envelope.payload.clone(),
                        redelivered: envelope.deliveries > 1,
                        delivery_count: envelope.deliveries,
                    };
                    inner
                        .unacked
                        .insert(delivery.tag, (queue.to_string(), envelope));
                    return Ok(delivery);
                }
            }

            notified.await;
        }
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        disposition: Disposition,
    ) -> Result<(), BrokerError> {
        let (queue, envelope) = self
            .shared
            .inner
            .lock()
            .await
            .unacked
            .remove(&delivery.tag)
            .ok_or(BrokerError::UnknownDelivery(delivery.tag))?;

        match disposition {
            Disposition::Ack => Ok(()),
            Disposition::Requeue => self.schedule(queue, envelope, self.redelivery_delay).await,
        }
    }

    async fn close(&self) {
        self.shared.inner.lock().await.closed = true;
        self.shared.ready.notify_waiters();
    }
}
