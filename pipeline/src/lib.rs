//! Retrying transaction pipeline.
//!
//! A [`Producer`] stores new transactions and publishes a reference to each
//! on the primary queue. A [`Consumer`] takes them off the queue, asks an
//! [`OutcomeDecider`] whether the attempt succeeded, records the transition
//! in the [`TransactionStore`], and on failure hands the message to the
//! broker's delay queue with a ttl taken from the [`BackoffPolicy`].

pub mod backoff;
pub mod broker;
pub mod config;
pub mod connect;
pub mod consumer;
pub mod message;
pub mod notify;
pub mod outcome;
pub mod pg;
pub mod producer;
pub mod store;
pub mod transaction;

pub use backoff::BackoffPolicy;
pub use broker::{Broker, BrokerError, Delivery, Disposition, PublishOptions, QueueTopology};
pub use config::PipelineConfig;
pub use consumer::{Consumer, ConsumerOptions, HandleError, Handled};
pub use message::TransactionMessage;
pub use notify::{LogNotifier, Notifier};
pub use outcome::{HttpVerifier, Outcome, OutcomeDecider, OutcomeError, RandomMatch};
pub use producer::{Producer, ProducerError, RandomWorkItems, WorkItemSource};
pub use store::{MarkOutcome, StatusSummary, StoreError, TransactionStore};
pub use transaction::{
    Amount, CorrelationId, NewTransaction, Transaction, TransactionId, TransactionStatus,
};
