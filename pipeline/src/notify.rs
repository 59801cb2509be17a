use crate::transaction::Transaction;
use async_trait::async_trait;

/// Side effect fired once per transaction, when it first reaches `Success`.
///
/// Failures are the implementor's to log; the pipeline does not retry them.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, tx: &Transaction);
}

/// Records the credit in the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, tx: &Transaction) {
        tracing::info!(
            transaction_id = %tx.id,
            correlation_id = %tx.correlation_id,
            amount = %tx.amount,
            "customer credited"
        );
    }
}
