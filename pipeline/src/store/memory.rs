use super::{MarkOutcome, StatusSummary, StoreError, TransactionStore};
use crate::transaction::{NewTransaction, Transaction, TransactionId, TransactionStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Process-local store for tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemoryTransactionStore {
    rows: RwLock<HashMap<TransactionId, Transaction>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn all(&self) -> Vec<Transaction> {
        let mut rows: Vec<_> = self.rows.read().await.values().cloned().collect();
        rows.sort_by_key(|tx| tx.created_at);
        rows
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, StoreError> {
        let mut rows = self.rows.write().await;
        let mut id = TransactionId::new_v4();
        while rows.contains_key(&id) {
            id = TransactionId::new_v4();
        }

        let tx = Transaction::pending(id, new, OffsetDateTime::now_utc());
        rows.insert(id, tx.clone());
        Ok(tx)
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn mark_success(&self, id: TransactionId) -> Result<MarkOutcome, StoreError> {
        let mut rows = self.rows.write().await;
        let tx = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if tx.status.is_terminal() {
            return Ok(MarkOutcome::AlreadySucceeded);
        }

        tx.status = TransactionStatus::Success;
        Ok(MarkOutcome::Applied(tx.clone()))
    }

    async fn mark_rejected(
        &self,
        id: TransactionId,
        next_attempt_at: OffsetDateTime,
    ) -> Result<MarkOutcome, StoreError> {
        let mut rows = self.rows.write().await;
        let tx = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if tx.status.is_terminal() {
            return Ok(MarkOutcome::AlreadySucceeded);
        }

        tx.status = TransactionStatus::Rejected;
        tx.attempt_count += 1;
        tx.next_attempt_at = next_attempt_at;
        Ok(MarkOutcome::Applied(tx.clone()))
    }

    async fn summary(&self) -> Result<StatusSummary, StoreError> {
        let rows = self.rows.read().await;
        let mut summary = StatusSummary::default();
        for tx in rows.values() {
            match tx.status {
                TransactionStatus::Pending => summary.pending += 1,
                TransactionStatus::Rejected => summary.rejected += 1,
                TransactionStatus::Success => {
                    summary.success += 1;
                    summary.total_amount_succeeded += tx.amount.minor_units();
                }
            }
        }
        Ok(summary)
    }
}
