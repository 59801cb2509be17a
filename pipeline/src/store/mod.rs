//! Durable record of every transaction's state.

mod memory;
mod postgres;

pub use memory::MemoryTransactionStore;
pub use postgres::PgTransactionStore;

use crate::transaction::{NewTransaction, Transaction, TransactionId};
use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] deadpool_postgres::PoolError),
    #[error("store query failed: {0}")]
    Query(#[from] tokio_postgres::Error),
    #[error("transaction {0} not found")]
    NotFound(TransactionId),
    #[error("corrupt transaction row: {0}")]
    Corrupt(String),
}

/// Result of a state transition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The transition happened; carries the updated record.
    Applied(Transaction),
    /// The record was already `Success`; nothing changed.
    AlreadySucceeded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub pending: i64,
    pub success: i64,
    pub rejected: i64,
    pub total_amount_succeeded: i64,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persists a new `Pending` record with a freshly assigned id.
    async fn create(&self, new: NewTransaction) -> Result<Transaction, StoreError>;

    /// `Ok(None)` when the id is unknown; stale and duplicate deliveries
    /// hit this regularly.
    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError>;

    /// Sets `Success` unless already there. Repeating it is a no-op.
    async fn mark_success(&self, id: TransactionId) -> Result<MarkOutcome, StoreError>;

    /// In one atomic step: sets `Rejected`, increments `attempt_count` by one
    /// and records `next_attempt_at`. Leaves a `Success` record untouched.
    async fn mark_rejected(
        &self,
        id: TransactionId,
        next_attempt_at: OffsetDateTime,
    ) -> Result<MarkOutcome, StoreError>;

    async fn summary(&self) -> Result<StatusSummary, StoreError>;

    async fn close(&self) {}
}
