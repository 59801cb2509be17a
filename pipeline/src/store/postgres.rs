use super::{MarkOutcome, StatusSummary, StoreError, TransactionStore};
use crate::transaction::{
    Amount, CorrelationId, NewTransaction, Transaction, TransactionId, TransactionStatus,
};
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_postgres::Row;
use uuid::Uuid;

const SCHEMA: &str = "
DO $$ BEGIN
    CREATE TYPE transaction_status AS ENUM ('pending', 'success', 'rejected');
EXCEPTION WHEN duplicate_object THEN NULL;
END $$;

CREATE TABLE IF NOT EXISTS transactions (
    id              UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    correlation_id  TEXT NOT NULL,
    amount          BIGINT NOT NULL CHECK (amount > 0),
    status          transaction_status NOT NULL DEFAULT 'pending',
    attempt_count   INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
    next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS transactions_correlation_id_idx ON transactions (correlation_id);
";

const COLUMNS: &str =
    "id, correlation_id, amount, status, attempt_count, next_attempt_at, created_at";

pub struct PgTransactionStore {
    dbpool: deadpool_postgres::Pool,
}

impl PgTransactionStore {
    pub fn new(dbpool: deadpool_postgres::Pool) -> Self {
        Self { dbpool }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let conn = self.dbpool.get().await?;
        conn.batch_execute(SCHEMA).await?;
        tracing::info!("transactions schema ready");
        Ok(())
    }

    fn from_row(row: &Row) -> Result<Transaction, StoreError> {
        let id: Uuid = row.try_get("id")?;
        let amount: i64 = row.try_get("amount")?;
        let attempt_count: i32 = row.try_get("attempt_count")?;

        Ok(Transaction {
            id: TransactionId::from_uuid(id),
            correlation_id: CorrelationId::new(row.try_get::<_, String>("correlation_id")?),
            amount: Amount::new(amount).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            status: row.try_get::<_, TransactionStatus>("status")?,
            attempt_count: u32::try_from(attempt_count)
                .map_err(|_| StoreError::Corrupt(format!("negative attempt_count {}", attempt_count)))?,
            next_attempt_at: row.try_get::<_, OffsetDateTime>("next_attempt_at")?,
            created_at: row.try_get::<_, OffsetDateTime>("created_at")?,
        })
    }

    // Zero rows from a guarded UPDATE means either missing or already terminal.
    async fn unchanged(&self, id: TransactionId) -> Result<MarkOutcome, StoreError> {
        let conn = self.dbpool.get().await?;
        let stmt = conn
            .prepare_cached("SELECT 1 FROM transactions WHERE id = $1")
            .await?;

        match conn.query_opt(&stmt, &[id.as_uuid()]).await? {
            Some(_) => Ok(MarkOutcome::AlreadySucceeded),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    async fn create(&self, new: NewTransaction) -> Result<Transaction, StoreError> {
        let conn = self.dbpool.get().await?;
        let stmt = conn
            .prepare_cached(&format!(
                "INSERT INTO transactions (correlation_id, amount) VALUES ($1, $2) RETURNING {}",
                COLUMNS
            ))
            .await?;

        let row = conn
            .query_one(
                &stmt,
                &[&new.correlation_id.as_str(), &new.amount.minor_units()],
            )
            .await?;

        Self::from_row(&row)
    }

    async fn get(&self, id: TransactionId) -> Result<Option<Transaction>, StoreError> {
        let conn = self.dbpool.get().await?;
        let stmt = conn
            .prepare_cached(&format!("SELECT {} FROM transactions WHERE id = $1", COLUMNS))
            .await?;

        conn.query_opt(&stmt, &[id.as_uuid()])
            .await?
            .as_ref()
            .map(Self::from_row)
            .transpose()
    }

    async fn mark_success(&self, id: TransactionId) -> Result<MarkOutcome, StoreError> {
        let row = {
            let conn = self.dbpool.get().await?;
            let stmt = conn
                .prepare_cached(&format!(
                    "UPDATE transactions SET status = $2 \
                     WHERE id = $1 AND status <> $2 RETURNING {}",
                    COLUMNS
                ))
                .await?;
            conn.query_opt(&stmt, &[id.as_uuid(), &TransactionStatus::Success])
                .await?
        };

        match row {
            Some(row) => Ok(MarkOutcome::Applied(Self::from_row(&row)?)),
            None => self.unchanged(id).await,
        }
    }

    async fn mark_rejected(
        &self,
        id: TransactionId,
        next_attempt_at: OffsetDateTime,
    ) -> Result<MarkOutcome, StoreError> {
        let row = {
            let conn = self.dbpool.get().await?;
            let stmt = conn
                .prepare_cached(&format!(
                    "UPDATE transactions \
                     SET status = $3, attempt_count = attempt_count + 1, next_attempt_at = $2 \
                     WHERE id = $1 AND status <> $4 RETURNING {}",
                    COLUMNS
                ))
                .await?;
            conn.query_opt(
                &stmt,
                &[
                    id.as_uuid(),
                    &next_attempt_at,
                    &TransactionStatus::Rejected,
                    &TransactionStatus::Success,
                ],
            )
            .await?
        };

        match row {
            Some(row) => Ok(MarkOutcome::Applied(Self::from_row(&row)?)),
            None => self.unchanged(id).await,
        }
    }

    async fn summary(&self) -> Result<StatusSummary, StoreError> {
        let conn = self.dbpool.get().await?;
        let stmt = conn
            .prepare_cached(
                "SELECT status, COUNT(*) AS total, COALESCE(SUM(amount), 0)::BIGINT AS amount \
                 FROM transactions GROUP BY status",
            )
            .await?;

        let mut summary = StatusSummary::default();
        for row in conn.query(&stmt, &[]).await? {
            let total: i64 = row.try_get("total")?;
            match row.try_get::<_, TransactionStatus>("status")? {
                TransactionStatus::Pending => summary.pending = total,
                TransactionStatus::Rejected => summary.rejected = total,
                TransactionStatus::Success => {
                    summary.success = total;
                    summary.total_amount_succeeded = row.try_get("amount")?;
                }
            }
        }

        Ok(summary)
    }

    async fn close(&self) {
        self.dbpool.close();
    }
}
