use super::{Broker, BrokerError, Delivery, Disposition, PublishOptions, QueueTopology};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS broker_queues (
    name           TEXT PRIMARY KEY,
    dead_letter_to TEXT REFERENCES broker_queues (name)
);

CREATE TABLE IF NOT EXISTS broker_messages (
    id           BIGSERIAL PRIMARY KEY,
    queue        TEXT NOT NULL REFERENCES broker_queues (name),
    payload      BYTEA NOT NULL,
    available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    deliveries   INTEGER NOT NULL DEFAULT 0,
    leased_until TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS broker_messages_ready_idx ON broker_messages (queue, available_at);
";

const LEASE_NEXT: &str = "
UPDATE broker_messages
SET leased_until = now() + ($2::BIGINT * interval '1 millisecond'),
    deliveries = deliveries + 1
WHERE id = (
    SELECT id FROM broker_messages
    WHERE queue = $1
      AND available_at <= now()
      AND (leased_until IS NULL OR leased_until <= now())
    ORDER BY id
    FOR UPDATE SKIP LOCKED
    LIMIT 1
)
RETURNING id, payload, deliveries
";

const MOVE_EXPIRED: &str = "
UPDATE broker_messages m
SET queue = q.dead_letter_to, available_at = now(), leased_until = NULL, deliveries = 0
FROM broker_queues q
WHERE m.queue = q.name
  AND q.dead_letter_to IS NOT NULL
  AND m.available_at <= now()
";

#[derive(Debug, Clone)]
pub struct PgBrokerSettings {
    /// How long a delivery stays invisible to other consumers before it is
    /// redelivered for lack of a settle.
    pub lease: Duration,
    /// Delay before a `Requeue`d delivery becomes visible again.
    pub redelivery_delay: Duration,
    /// Idle wait between polls of an empty queue.
    pub poll_interval: Duration,
    /// Period of the task moving expired delay-queue rows.
    pub requeue_interval: Duration,
}

impl Default for PgBrokerSettings {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            redelivery_delay: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            requeue_interval: Duration::from_secs(1),
        }
    }
}

/// Durable broker over two Postgres tables.
///
/// Messages are rows; a delivery is a time-limited lease on a row taken with
/// `FOR UPDATE SKIP LOCKED`, an ack deletes the row. A row whose lease runs
/// out is handed out again, which gives at-least-once delivery across
/// consumer crashes. Delay-queue rows carry their expiry in `available_at`
/// and a background task re-homes them into their dead-letter queue.
pub struct PgBroker {
    dbpool: deadpool_postgres::Pool,
    settings: PgBrokerSettings,
    routes: RwLock<HashMap<String, Option<String>>>,
    shutdown: CancellationToken,
    requeue_task: Mutex<Option<JoinHandle<()>>>,
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl PgBroker {
    /// Must be called from within a Tokio runtime.
    pub fn new(dbpool: deadpool_postgres::Pool, settings: PgBrokerSettings) -> Self {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Self::requeue_loop(
            dbpool.clone(),
            settings.requeue_interval,
            shutdown.clone(),
        ));

        Self {
            dbpool,
            settings,
            routes: RwLock::new(HashMap::new()),
            shutdown,
            requeue_task: Mutex::new(Some(task)),
        }
    }

    async fn requeue_loop(
        dbpool: deadpool_postgres::Pool,
        period: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = interval(period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("broker requeue loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match Self::move_expired(&dbpool).await {
                Ok(0) => {}
                Ok(moved) => tracing::debug!(moved, "moved expired delay-queue messages"),
                Err(e) => tracing::warn!(error = %e, "failed to move expired delay-queue messages"),
            }
        }
    }

    async fn move_expired(dbpool: &deadpool_postgres::Pool) -> Result<u64, BrokerError> {
        let conn = dbpool.get().await?;
        let stmt = conn.prepare_cached(MOVE_EXPIRED).await?;
        Ok(conn.execute(&stmt, &[]).await?)
    }

    /// Dead-letter target of `queue`, or `None` for a consumable queue.
    async fn route(&self, queue: &str) -> Result<Option<String>, BrokerError> {
        if let Some(route) = self.routes.read().await.get(queue) {
            return Ok(route.clone());
        }

        let conn = self.dbpool.get().await?;
        let stmt = conn
            .prepare_cached("SELECT dead_letter_to FROM broker_queues WHERE name = $1")
            .await?;
        let row = conn
            .query_opt(&stmt, &[&queue])
            .await?
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let route: Option<String> = row.try_get("dead_letter_to")?;

        self.routes
            .write()
            .await
            .insert(queue.to_string(), route.clone());
        Ok(route)
    }

    async fn try_lease(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let conn = self.dbpool.get().await?;
        let stmt = conn.prepare_cached(LEASE_NEXT).await?;
        let row = conn
            .query_opt(&stmt, &[&queue, &millis(self.settings.lease)])
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let payload: Vec<u8> = row.try_get("payload")?;
        let deliveries: i32 = row.try_get("deliveries")?;
        let delivery_count = u32::try_from(deliveries).unwrap_or(0);

        Ok(Some(Delivery {
            tag: id as u64,
            queue: queue.to_string(),
            payload: Bytes::from(payload),
            redelivered: delivery_count > 1,
            delivery_count,
        }))
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn declare(&self, topology: &QueueTopology) -> Result<(), BrokerError> {
        let conn = self.dbpool.get().await?;
        conn.batch_execute(SCHEMA).await?;

        conn.execute(
            "INSERT INTO broker_queues (name, dead_letter_to) VALUES ($1, NULL) \
             ON CONFLICT (name) DO NOTHING",
            &[&topology.primary],
        )
        .await?;
        conn.execute(
            "INSERT INTO broker_queues (name, dead_letter_to) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET dead_letter_to = EXCLUDED.dead_letter_to",
            &[&topology.delay, &topology.primary],
        )
        .await?;

        let mut routes = self.routes.write().await;
        routes.insert(topology.primary.clone(), None);
        routes.insert(topology.delay.clone(), Some(topology.primary.clone()));

        tracing::info!(
            primary = %topology.primary,
            delay = %topology.delay,
            "broker queues declared"
        );
        Ok(())
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let route = self.route(queue).await?;
        let delay_ms = match (options.ttl, route) {
            (Some(ttl), Some(_)) => millis(ttl),
            (Some(_), None) => return Err(BrokerError::TtlWithoutDeadLetter(queue.to_string())),
            (None, Some(_)) => return Err(BrokerError::TtlRequired(queue.to_string())),
            (None, None) => 0,
        };

        let conn = self.dbpool.get().await?;
        let stmt = conn
            .prepare_cached(
                "INSERT INTO broker_messages (queue, payload, available_at) \
                 VALUES ($1, $2, now() + ($3::BIGINT * interval '1 millisecond'))",
            )
            .await?;
        let body: &[u8] = &payload;
        conn.execute(&stmt, &[&queue, &body, &delay_ms]).await?;

        Ok(())
    }

    async fn next_delivery(&self, queue: &str) -> Result<Delivery, BrokerError> {
        if self.route(queue).await?.is_some() {
            return Err(BrokerError::NotConsumable(queue.to_string()));
        }

        loop {
            if self.shutdown.is_cancelled() {
                return Err(BrokerError::Closed);
            }

            if let Some(delivery) = self.try_lease(queue).await? {
                return Ok(delivery);
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(BrokerError::Closed),
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        disposition: Disposition,
    ) -> Result<(), BrokerError> {
        let conn = self.dbpool.get().await?;
        let tag = delivery.tag as i64;
        // A re-lease bumps `deliveries`, so a settle from an expired lease
        // matches nothing.
        let lease = i32::try_from(delivery.delivery_count).unwrap_or(i32::MAX);

        let affected = match disposition {
            Disposition::Ack => {
                let stmt = conn
                    .prepare_cached(
                        "DELETE FROM broker_messages \
                         WHERE id = $1 AND deliveries = $2 AND leased_until IS NOT NULL",
                    )
                    .await?;
                conn.execute(&stmt, &[&tag, &lease]).await?
            }
            Disposition::Requeue => {
                let stmt = conn
                    .prepare_cached(
                        "UPDATE broker_messages \
                         SET leased_until = now() + ($3::BIGINT * interval '1 millisecond') \
                         WHERE id = $1 AND deliveries = $2 AND leased_until IS NOT NULL",
                    )
                    .await?;
                conn.execute(
                    &stmt,
                    &[&tag, &lease, &millis(self.settings.redelivery_delay)],
                )
                .await?
            }
        };

        if affected == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.tag));
        }
        Ok(())
    }

    async fn close(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.requeue_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "broker requeue task ended abnormally");
            }
        }
        self.dbpool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_secs(120)), 120_000);
        assert_eq!(millis(Duration::MAX), i64::MAX);
    }

    #[test]
    fn default_settings_lease_longer_than_redelivery() {
        let settings = PgBrokerSettings::default();
        assert!(settings.lease > settings.redelivery_delay);
        assert!(settings.poll_interval < settings.requeue_interval);
    }
}
