/*!
 * Unit of work helpers
 *
 * Every mutating ledger operation runs inside `with_transaction`: one
 * database transaction, committed on success and rolled back on any error,
 * replayed on transient storage failures and bounded by the caller's
 * deadline.
 */

use metrics::{counter, histogram};
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, EntityTrait, QuerySelect,
    Select, TransactionTrait,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::ServiceError;

/// Type alias for boxed future used in transactions
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How often a unit of work is replayed after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Linear backoff step between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

/// Transactional executor shared by the services.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    db: Arc<DatabaseConnection>,
    policy: RetryPolicy,
}

impl UnitOfWork {
    pub fn new(db: Arc<DatabaseConnection>, policy: RetryPolicy) -> Self {
        Self { db, policy }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Runs `f` in one transaction under the configured retry policy.
    pub async fn run<F, T>(&self, deadline: Instant, f: F) -> Result<T, ServiceError>
    where
        F: for<'a> Fn(&'a DatabaseTransaction) -> BoxFuture<'a, Result<T, ServiceError>>
            + Send
            + Sync,
        T: Send,
    {
        with_transaction(&self.db, self.policy, deadline, f).await
    }
}

/// Execute a function within a database transaction
///
/// The closure may be invoked more than once, so it must rebuild its future
/// from owned or cloned inputs on every call. Dropping the transaction on
/// deadline expiry rolls it back.
///
/// # Example
///
/// ```rust,ignore
/// let movement = with_transaction(&db, RetryPolicy::default(), ctx.deadline, |txn| {
///     let receipt = receipt.clone();
///     Box::pin(async move { inventory::receive_in(txn, &receipt, "wms").await })
/// })
/// .await?;
/// ```
pub async fn with_transaction<F, T>(
    db: &DatabaseConnection,
    policy: RetryPolicy,
    deadline: Instant,
    f: F,
) -> Result<T, ServiceError>
where
    F: for<'a> Fn(&'a DatabaseTransaction) -> BoxFuture<'a, Result<T, ServiceError>> + Send + Sync,
    T: Send,
{
    let budget = deadline.saturating_duration_since(Instant::now());
    let attempts = async {
        let mut attempt: u32 = 1;
        loop {
            let start = std::time::Instant::now();
            counter!("fulfillment_db.transaction.started", 1);

            let result = run_once(db, &f).await;
            histogram!("fulfillment_db.transaction.duration", start.elapsed());

            match result {
                Ok(value) => {
                    counter!("fulfillment_db.transaction.committed", 1);
                    debug!(attempt, "Transaction committed in {:?}", start.elapsed());
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < policy.max_attempts.max(1) => {
                    counter!("fulfillment_db.transaction.retried", 1);
                    warn!(attempt, error = %err, "Transient storage failure, replaying unit of work");
                    tokio::time::sleep(policy.backoff * attempt).await;
                    attempt += 1;
                }
                Err(err) => {
                    counter!("fulfillment_db.transaction.rolled_back", 1);
                    debug!(attempt, error = %err, "Transaction rolled back");
                    return Err(err);
                }
            }
        }
    };

    match tokio::time::timeout_at(deadline, attempts).await {
        Ok(result) => result,
        Err(_) => {
            counter!("fulfillment_db.transaction.timed_out", 1);
            warn!("Unit of work exceeded its deadline of {:?}", budget);
            Err(ServiceError::Timeout(budget))
        }
    }
}

async fn run_once<F, T>(db: &DatabaseConnection, f: &F) -> Result<T, ServiceError>
where
    F: for<'a> Fn(&'a DatabaseTransaction) -> BoxFuture<'a, Result<T, ServiceError>> + Send + Sync,
    T: Send,
{
    let txn = db.begin().await?;
    match f(&txn).await {
        Ok(value) => {
            txn.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}

/// Bounds a read-only query by the caller's deadline.
pub async fn with_deadline<Fut, T>(deadline: Instant, fut: Fut) -> Result<T, ServiceError>
where
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let budget = deadline.saturating_duration_since(Instant::now());
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| ServiceError::Timeout(budget))?
}

/// Adds `FOR UPDATE` to a select on backends with row locks. SQLite
/// serializes writers on the database file instead.
pub fn lock_for_update<E, C>(select: Select<E>, conn: &C) -> Select<E>
where
    E: EntityTrait,
    C: ConnectionTrait,
{
    if conn.get_database_backend() == DbBackend::Sqlite {
        select
    } else {
        select.lock_exclusive()
    }
}
