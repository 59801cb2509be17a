use pipeline::broker::PgBroker;
use pipeline::config::ConfigError;
use pipeline::connect::connect_with_retry;
use pipeline::store::PgTransactionStore;
use pipeline::{Broker, PipelineConfig, Producer, RandomWorkItems, TransactionStore, pg};
use std::env;
use std::sync::Arc;

const DEFAULT_LISTEN_SOCKET: &str = "/tmp/pipeline-gateway.sock";

#[derive(Clone)]
pub struct GatewayConfig {
    pub listen_path: String,
    pub pipeline: PipelineConfig,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_path = env::var("GATEWAY_LISTEN_SOCKET")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN_SOCKET.to_string());

        Ok(Self {
            listen_path,
            pipeline: PipelineConfig::from_env()?,
        })
    }
}

pub struct Gateway {
    pub producer: Producer,
    pub store: Arc<dyn TransactionStore>,
    pub broker: Arc<dyn Broker>,
}

impl Gateway {
    pub async fn new(
        config: &PipelineConfig,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let pool_size = config.pool_size;

        let store_pool = connect_with_retry("store", &config.postgres_urls, &config.connect, |url| {
            async move { pg::connect(&url, pool_size).await }
        })
        .await?;
        let store = PgTransactionStore::new(store_pool);
        store.init().await?;
        let store: Arc<dyn TransactionStore> = Arc::new(store);

        let broker_pool = connect_with_retry("broker", &config.broker_urls, &config.connect, |url| {
            async move { pg::connect(&url, pool_size).await }
        })
        .await?;
        let broker: Arc<dyn Broker> = Arc::new(PgBroker::new(broker_pool, config.broker.clone()));
        broker.declare(&config.topology).await?;

        let producer = Producer::new(
            store.clone(),
            broker.clone(),
            config.topology.primary.clone(),
            Arc::new(RandomWorkItems::default()),
        );

        Ok(Self {
            producer,
            store,
            broker,
        })
    }

    pub async fn close(&self) {
        self.broker.close().await;
        self.store.close().await;
    }
}
