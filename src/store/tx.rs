//! Transaction manager
//!
//! [`Store::run_in_transaction`] is the only place a transaction boundary is
//! opened. Composite operations (transfer, create user, verify email) are
//! built by handing a [`TxRepository`] to an orchestration function.

use futures::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};
use tracing::{debug, error, warn};

use super::error::StoreError;
use super::repository::PgRepository;
use crate::config::StoreConfig;

/// Repository bound to an open transaction.
///
/// Borrows the transaction, so it cannot be kept past the
/// `run_in_transaction` call that created it.
pub type TxRepository<'c> = PgRepository<&'c mut PgConnection>;

/// Repository on a pooled connection. Every statement autocommits.
pub type PooledRepository = PgRepository<PoolConnection<Postgres>>;

/// Transaction manager over a PostgreSQL pool
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    config: StoreConfig,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, StoreConfig::default())
    }

    pub fn with_config(pool: PgPool, config: StoreConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Acquire a repository for single-statement CRUD outside any
    /// composite transaction.
    pub async fn repository(&self) -> Result<PooledRepository, StoreError> {
        let conn = self.pool.acquire().await?;
        Ok(PgRepository::new(conn))
    }

    /// Run `f` inside one database transaction.
    ///
    /// Commits if `f` succeeds. Otherwise rolls back and returns the error
    /// from `f`, or [`StoreError::Rollback`] carrying both errors if the
    /// rollback failed too. The body runs under the configured deadline;
    /// on expiry the transaction is rolled back and
    /// [`StoreError::Timeout`] is returned.
    ///
    /// Dropping the returned future drops the open transaction, which
    /// rolls back.
    pub async fn run_in_transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'t, 'c> FnOnce(&'t mut TxRepository<'c>) -> BoxFuture<'t, Result<T, StoreError>>
            + Send,
    {
        let mut tx = self.pool.begin().await?;
        let deadline = self.config.tx_timeout();

        let outcome = {
            let mut repo = PgRepository::new(&mut *tx);
            match tokio::time::timeout(deadline, f(&mut repo)).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(deadline)),
            }
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                debug!("Transaction committed");
                Ok(value)
            }
            Err(err) => {
                warn!(error = %err, code = err.code(), "Transaction failed, rolling back");
                if let Err(rollback) = tx.rollback().await {
                    error!(error = %err, rollback_error = %rollback, "Rollback failed");
                    return Err(StoreError::Rollback {
                        source: Box::new(err),
                        rollback,
                    });
                }
                Err(err)
            }
        }
    }
}

