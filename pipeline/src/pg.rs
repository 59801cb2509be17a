//! Shared Postgres pool setup for the store and the broker.

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

#[derive(Debug, thiserror::Error)]
pub enum PgSetupError {
    #[error("invalid postgres url: {0}")]
    InvalidUrl(tokio_postgres::Error),
    #[error("failed to build pool: {0}")]
    Build(#[from] deadpool_postgres::BuildError),
    #[error("postgres unreachable: {0}")]
    Unreachable(#[from] deadpool_postgres::PoolError),
    #[error("postgres ping failed: {0}")]
    Ping(tokio_postgres::Error),
}

pub fn build_pool(url: &str, max_size: usize) -> Result<Pool, PgSetupError> {
    let pg_config = url
        .parse::<tokio_postgres::Config>()
        .map_err(PgSetupError::InvalidUrl)?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );

    Ok(Pool::builder(mgr)
        .max_size(max_size)
        .runtime(Runtime::Tokio1)
        .build()?)
}

/// Builds a pool and proves it can hand out a working connection.
pub async fn connect(url: &str, max_size: usize) -> Result<Pool, PgSetupError> {
    let pool = build_pool(url, max_size)?;
    let client = pool.get().await?;
    client
        .simple_query("SELECT 1")
        .await
        .map_err(PgSetupError::Ping)?;
    drop(client);
    Ok(pool)
}
