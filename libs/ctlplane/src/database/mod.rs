//! Persistence handle and the transaction runner derived from it.

mod transaction;

pub use transaction::{Transactor, TxError, TxPolicy};

use ctlplane_bootstrap::PoolCfg;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

/// Retry budget for serializable transactions on Postgres-compatible backends.
pub const SERIALIZABLE_MAX_RETRIES: u32 = 5;

const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("invalid DSN: missing driver scheme")]
    InvalidDsn,
    #[error("unsupported database driver: {0}")]
    UnsupportedDriver(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl TxError for DbError {
    fn is_serialization_failure(&self) -> bool {
        matches!(self, DbError::Sqlx(e) if is_serialization_failure(e))
    }
}

impl TxError for sqlx::Error {
    fn is_serialization_failure(&self) -> bool {
        is_serialization_failure(self)
    }
}

/// Whether the backend aborted the transaction with SQLSTATE 40001.
pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .is_some_and(|code| code == SQLSTATE_SERIALIZATION_FAILURE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Driver {
    Postgres,
    Sqlite,
    Other(String),
}

impl Driver {
    /// Driver named by the DSN scheme.
    pub fn from_dsn(dsn: &str) -> Result<Self, DbError> {
        let scheme = dsn
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .filter(|s| {
                !s.is_empty()
                    && s.chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
            })
            .ok_or(DbError::InvalidDsn)?;

        Ok(match scheme.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Driver::Postgres,
            "sqlite" => Driver::Sqlite,
            other => Driver::Other(other.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Driver::Postgres => "postgres",
            Driver::Sqlite => "sqlite",
            Driver::Other(name) => name,
        }
    }
}

/// Shared connection pool tagged with the driver it talks to.
///
/// Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: AnyPool,
    driver: Driver,
}

impl Database {
    pub async fn connect(dsn: &str, cfg: &PoolCfg) -> Result<Self, DbError> {
        let driver = Driver::from_dsn(dsn)?;
        sqlx::any::install_default_drivers();
        let pool = pool_options(cfg).connect(dsn).await?;
        tracing::info!(driver = driver.name(), "database pool connected");
        Ok(Self { pool, driver })
    }

    /// Pool that opens connections on first use. Must be called inside a
    /// tokio runtime.
    pub fn connect_lazy(dsn: &str, cfg: &PoolCfg) -> Result<Self, DbError> {
        let driver = Driver::from_dsn(dsn)?;
        sqlx::any::install_default_drivers();
        let pool = pool_options(cfg).connect_lazy(dsn)?;
        Ok(Self { pool, driver })
    }

    pub fn from_pool(pool: AnyPool, driver: Driver) -> Self {
        Self { pool, driver }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Transaction runner matching the backend's isolation semantics.
    pub fn transaction_fn(&self) -> Result<Transactor, DbError> {
        let policy = match &self.driver {
            Driver::Postgres => TxPolicy::RetrySerializable {
                max_retries: SERIALIZABLE_MAX_RETRIES,
            },
            Driver::Sqlite => TxPolicy::Plain,
            Driver::Other(name) => return Err(DbError::UnsupportedDriver(name.clone())),
        };
        Ok(Transactor::new(self.pool.clone(), policy))
    }
}

fn pool_options(cfg: &PoolCfg) -> AnyPoolOptions {
    let mut opts = AnyPoolOptions::new();
    if let Some(n) = cfg.max_conns {
        opts = opts.max_connections(n);
    }
    if let Some(t) = cfg.acquire_timeout {
        opts = opts.acquire_timeout(t);
    }
    opts
}
