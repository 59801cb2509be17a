//! At-least-once message transport with a primary queue and a delay queue.
//!
//! The delay queue is never consumed. A message published to it with a
//! `ttl` waits out that ttl and is then moved by the broker itself into the
//! queue it dead-letters to (the primary queue). Any backend that can honour
//! "publish with ttl, later appears on primary" satisfies the contract:
//! [`PgBroker`] does it with leased rows and a requeue task,
//! [`MemoryBroker`] with a timer heap.

mod memory;
mod postgres;

pub use memory::MemoryBroker;
pub use postgres::{PgBroker, PgBrokerSettings};

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(#[from] deadpool_postgres::PoolError),
    #[error("broker query failed: {0}")]
    Query(#[from] tokio_postgres::Error),
    #[error("unknown queue {0}")]
    UnknownQueue(String),
    #[error("queue {0} has no dead-letter route, ttl would drop the message")]
    TtlWithoutDeadLetter(String),
    #[error("queue {0} is a delay queue, publishes to it need a ttl")]
    TtlRequired(String),
    #[error("queue {0} is a delay queue and cannot be consumed")]
    NotConsumable(String),
    #[error("delivery {0} is not outstanding")]
    UnknownDelivery(u64),
    #[error("broker closed")]
    Closed,
}

/// Names of the two durable queues the pipeline uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub primary: String,
    /// Dead-letters into `primary` on ttl expiry.
    pub delay: String,
}

impl QueueTopology {
    pub fn new(primary: impl Into<String>, delay: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            delay: delay.into(),
        }
    }
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self::new("processing_queue", "retry_queue")
    }
}

/// Every publish is persistent. `ttl` is required on a queue that
/// dead-letters somewhere and rejected everywhere else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub ttl: Option<Duration>,
}

impl PublishOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub payload: Bytes,
    /// Set when this message was handed out before and not acknowledged.
    pub redelivered: bool,
    /// Times the message has been handed out, this delivery included. A
    /// backend may use it to tell a stale settle from the current lease.
    pub delivery_count: u32,
}

/// What the handler decided about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fully handled; remove it.
    Ack,
    /// Not acknowledged; it will be delivered again.
    Requeue,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Creates the queues if missing and wires `delay` to dead-letter into
    /// `primary`.
    async fn declare(&self, topology: &QueueTopology) -> Result<(), BrokerError>;

    async fn enqueue(
        &self,
        queue: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Waits for the next message on `queue` and leases it to the caller
    /// until it is settled.
    async fn next_delivery(&self, queue: &str) -> Result<Delivery, BrokerError>;

    async fn settle(&self, delivery: &Delivery, disposition: Disposition)
        -> Result<(), BrokerError>;

    async fn close(&self) {}
}
