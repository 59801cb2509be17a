use pipeline::broker::PgBroker;
use pipeline::connect::connect_with_retry;
use pipeline::store::PgTransactionStore;
use pipeline::{
    Broker, Consumer, HttpVerifier, LogNotifier, OutcomeDecider, PipelineConfig, Producer,
    RandomMatch, RandomWorkItems, TransactionStore, pg,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Default level INFO, overridable via RUST_LOG
    {
        use tracing_subscriber::{EnvFilter, fmt};
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(env_filter).try_init();
    }

    let config = PipelineConfig::from_env()?;

    let store_pool = connect_with_retry("store", &config.postgres_urls, &config.connect, |url| {
        let pool_size = config.pool_size;
        async move { pg::connect(&url, pool_size).await }
    })
    .await?;
    let store = PgTransactionStore::new(store_pool);
    store.init().await?;
    let store: Arc<dyn TransactionStore> = Arc::new(store);

    let broker_pool = connect_with_retry("broker", &config.broker_urls, &config.connect, |url| {
        let pool_size = config.pool_size;
        async move { pg::connect(&url, pool_size).await }
    })
    .await?;
    let broker: Arc<dyn Broker> = Arc::new(PgBroker::new(broker_pool, config.broker.clone()));
    broker.declare(&config.topology).await?;

    if config.generate_count > 0 {
        let producer = Producer::new(
            store.clone(),
            broker.clone(),
            config.topology.primary.clone(),
            Arc::new(RandomWorkItems::default()),
        );
        producer.generate(config.generate_count).await?;
    }

    let outcome: Arc<dyn OutcomeDecider> = match &config.verifier_url {
        Some(url) => {
            tracing::info!(verifier = %url, "using remote verifier");
            Arc::new(HttpVerifier::new(url).with_timeout(config.consumer.decide_timeout))
        }
        None => Arc::new(RandomMatch::default()),
    };

    let consumer = Arc::new(Consumer::new(
        store.clone(),
        broker.clone(),
        outcome,
        Arc::new(LogNotifier),
        config.backoff.clone(),
        config.topology.clone(),
        config.consumer.clone(),
    ));

    let shutdown = CancellationToken::new();
    let running = tokio::spawn(consumer.run(shutdown.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "failed to listen for shutdown signal"),
    }
    shutdown.cancel();

    if let Err(e) = running.await {
        tracing::error!(error = %e, "consumer task failed");
    }

    broker.close().await;
    store.close().await;
    tracing::info!("worker stopped");

    Ok(())
}
