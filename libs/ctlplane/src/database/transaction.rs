use std::time::Duration;

use futures::future::BoxFuture;
use sqlx::{AnyConnection, AnyPool};

const BASE_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPolicy {
    /// One attempt; the error is returned as is.
    Plain,
    /// Re-run the whole unit when the backend reports a serialization failure.
    RetrySerializable { max_retries: u32 },
}

/// Errors a transactional unit of work may return.
pub trait TxError: From<sqlx::Error> {
    fn is_serialization_failure(&self) -> bool;
}

/// Runs units of work inside a database transaction.
#[derive(Debug, Clone)]
pub struct Transactor {
    pool: AnyPool,
    policy: TxPolicy,
}

impl Transactor {
    pub fn new(pool: AnyPool, policy: TxPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> TxPolicy {
        self.policy
    }

    /// Commit when `work` succeeds, roll back when it fails.
    ///
    /// `work` may run more than once under [`TxPolicy::RetrySerializable`], so
    /// it must not have side effects outside the transaction.
    pub async fn execute<T, E, F>(&self, mut work: F) -> Result<T, E>
    where
        F: for<'c> FnMut(&'c mut AnyConnection) -> BoxFuture<'c, Result<T, E>>,
        E: TxError,
    {
        let max_retries = match self.policy {
            TxPolicy::Plain => 0,
            TxPolicy::RetrySerializable { max_retries } => max_retries,
        };

        let mut retries = 0;
        loop {
            match self.run_once(&mut work).await {
                Err(e) if retries < max_retries && e.is_serialization_failure() => {
                    retries += 1;
                    let delay = backoff(retries);
                    tracing::debug!(retries, ?delay, "serialization failure, retrying transaction");
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn run_once<T, E, F>(&self, work: &mut F) -> Result<T, E>
    where
        F: for<'c> FnMut(&'c mut AnyConnection) -> BoxFuture<'c, Result<T, E>>,
        E: TxError,
    {
        let mut tx = self.pool.begin().await?;
        match work(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    tracing::warn!(error = %rb, "transaction rollback failed");
                }
                Err(e)
            }
        }
    }
}

fn backoff(retry: u32) -> Duration {
    BASE_BACKOFF
        .saturating_mul(1u32 << retry.min(16))
        .min(MAX_BACKOFF)
}
