//! Transaction controller.
//!
//! A transaction begun through [`Transactor::begin`] is installed into the caller's
//! [`Context`], so every downstream call that receives the context runs on the same
//! connection. The returned [`Tx`] is the only handle that can end it. Each transaction
//! holds a dedicated database connection until committed or rolled back.

use crate::context::Context;
use crate::db::pool::DbPool;
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use chrono::{DateTime, Utc};
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Database-specific transaction wrapper.
///
/// This enum wraps database-specific transaction types to provide
/// a unified interface for transaction management.
pub enum DbTransaction {
    /// MySQL transaction
    MySql(Transaction<'static, MySql>),
    /// PostgreSQL transaction
    Postgres(Transaction<'static, Postgres>),
    /// SQLite transaction
    SQLite(Transaction<'static, Sqlite>),
}

impl DbTransaction {
    /// Get the database type for this transaction.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbTransaction::MySql(_) => DatabaseType::MySQL,
            DbTransaction::Postgres(_) => DatabaseType::PostgreSQL,
            DbTransaction::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Commit the transaction.
    pub async fn commit(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.commit().await.map_err(DbError::from),
        }
    }

    /// Rollback the transaction.
    pub async fn rollback(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.rollback().await.map_err(DbError::from),
        }
    }
}

struct Shared {
    id: String,
    db_type: DatabaseType,
    started_at: DateTime<Utc>,
    /// `None` once the transaction has been committed or rolled back.
    slot: Mutex<Option<DbTransaction>>,
}

/// Reference to a live transaction, as carried by a [`Context`].
///
/// Cloning is cheap and every clone refers to the same transaction. Holding a
/// `TxRef` lets a caller run statements in the transaction, but not end it.
#[derive(Clone)]
pub struct TxRef {
    shared: Arc<Shared>,
}

impl TxRef {
    fn new(tx: DbTransaction) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: generate_transaction_id(),
                db_type: tx.db_type(),
                started_at: Utc::now(),
                slot: Mutex::new(Some(tx)),
            }),
        }
    }

    /// Unique transaction identifier (`tx_` followed by 32 hex characters).
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn db_type(&self) -> DatabaseType {
        self.shared.db_type
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    /// Whether the transaction has been committed or rolled back.
    ///
    /// Waits for any statement currently running in the transaction.
    pub async fn is_closed(&self) -> bool {
        self.shared.slot.lock().await.is_none()
    }

    /// Lock the transaction for one statement. Statements through the same
    /// transaction run one at a time, in the order they acquire the lock.
    pub(crate) async fn lock(&self) -> MutexGuard<'_, Option<DbTransaction>> {
        self.shared.slot.lock().await
    }

    /// Take the transaction out of its slot, closing it for every holder.
    async fn take(&self) -> DbResult<DbTransaction> {
        self.shared
            .slot
            .lock()
            .await
            .take()
            .ok_or_else(|| DbError::transaction_closed(self.id()))
    }
}

/// Handle that ends a transaction.
///
/// Exactly one of [`commit`](Tx::commit) or [`rollback`](Tx::rollback) takes effect;
/// any later call returns [`DbError::TransactionClosed`]. A `Tx` dropped while the
/// transaction is still open rolls it back and logs a warning.
pub struct Tx {
    tx: TxRef,
    domain: Arc<str>,
}

impl Tx {
    pub fn id(&self) -> &str {
        self.tx.id()
    }

    /// The reference carried by contexts bound to this transaction.
    pub fn tx_ref(&self) -> &TxRef {
        &self.tx
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.tx.started_at()
    }

    /// Commit the transaction.
    pub async fn commit(&self) -> DbResult<()> {
        let tx = self.tx.take().await?;
        tx.commit().await?;

        info!(
            transaction_id = %self.id(),
            domain = %self.domain,
            "Transaction committed"
        );
        Ok(())
    }

    /// Roll the transaction back.
    pub async fn rollback(&self) -> DbResult<()> {
        let tx = self.tx.take().await?;
        tx.rollback().await?;

        info!(
            transaction_id = %self.id(),
            domain = %self.domain,
            "Transaction rolled back"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("id", &self.id())
            .field("domain", &self.domain)
            .field("started_at", &self.started_at())
            .finish()
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        let open = match self.tx.shared.slot.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                // A statement still holds the lock; finish the rollback once it is done.
                let tx = self.tx.clone();
                let domain = Arc::clone(&self.domain);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let open = tx.shared.slot.lock().await.take();
                        if let Some(open) = open {
                            warn!(
                                transaction_id = %tx.id(),
                                domain = %domain,
                                "Transaction dropped while open; rolling back"
                            );
                            if let Err(e) = open.rollback().await {
                                warn!(
                                    transaction_id = %tx.id(),
                                    error = %e,
                                    "Rollback of dropped transaction failed"
                                );
                            }
                        }
                    });
                }
                return;
            }
        };

        if let Some(open) = open {
            warn!(
                transaction_id = %self.id(),
                domain = %self.domain,
                "Transaction dropped while open; rolling back"
            );
            // sqlx queues a ROLLBACK when an open transaction is dropped
            drop(open);
        }
    }
}

/// Opens transactions on the primary pool.
#[derive(Debug, Clone)]
pub struct Transactor {
    pool: DbPool,
    domain: Arc<str>,
}

impl Transactor {
    pub(crate) fn new(pool: DbPool, domain: impl Into<Arc<str>>) -> Self {
        Self {
            pool,
            domain: domain.into(),
        }
    }

    /// Begin a transaction and bind it into `ctx`.
    ///
    /// On success `ctx` is replaced with a context carrying the new transaction.
    /// On failure `ctx` is left untouched and the driver error is returned.
    pub async fn begin(&self, ctx: &mut Context) -> DbResult<Tx> {
        let tx = ctx.bound("begin", self.pool.begin()).await?;
        let tx = TxRef::new(tx);

        *ctx = ctx.with_transaction(tx.clone());

        info!(
            transaction_id = %tx.id(),
            domain = %self.domain,
            "Transaction started ({})",
            tx.db_type().display_name()
        );

        Ok(Tx {
            tx,
            domain: Arc::clone(&self.domain),
        })
    }

    /// Run `f` inside a transaction.
    ///
    /// `f` receives a context bound to the new transaction. The transaction is
    /// committed when `f` returns `Ok` and rolled back when it returns `Err`. The
    /// error from `f` wins over any rollback failure, which is only logged.
    pub async fn scope<F, Fut, T>(&self, ctx: &Context, f: F) -> DbResult<T>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let mut scoped = ctx.clone();
        let tx = self.begin(&mut scoped).await?;

        match f(scoped).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    debug!(
                        transaction_id = %tx.id(),
                        error = %rollback_err,
                        "Rollback after failed scope did not succeed"
                    );
                }
                Err(e)
            }
        }
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
