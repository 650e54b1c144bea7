//! The public client.
//!
//! A [`Client`] owns a [`ConnectionPool`] for the driver picked from the
//! configured preference list. Each call checks a connection out for its
//! own duration; use [`Client::transaction`] or [`Client::in_transaction`]
//! to run several statements on one connection.

use std::future::Future;

use crate::config::ClientConfig;
use crate::dialect::{Dialect, Select, Update};
use crate::driver::{select_driver, DriverHandle};
use crate::error::Result;
use crate::materialize::{self, Prefetch, Record};
use crate::pool::ConnectionPool;
use crate::transaction::{TransactionContext, TxState};
use crate::value::Value;

pub struct Client {
    pool: ConnectionPool,
    dialect: Dialect,
}

impl Client {
    /// Build a client. The pool is opened lazily on first use.
    ///
    /// Fails with `ConfigError` if the configuration is invalid or no
    /// preferred driver is compiled in.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let driver = select_driver(&config.drivers)?;
        Ok(Self {
            dialect: driver.dialect(),
            pool: ConnectionPool::new(config, driver)?,
        })
    }

    /// Build a client and open its pool now.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let client = Self::new(config)?;
        client.pool.open(true).await?;
        Ok(client)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn driver(&self) -> DriverHandle {
        self.pool.driver()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Execute an INSERT and return the generated id, if any.
    ///
    /// SQLite reports the rowid itself; on PostgreSQL add a `RETURNING`
    /// clause and the first returned column is used.
    pub async fn execute_insert(&self, sql: &str, params: &[Value]) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        Ok(conn.execute(sql, params).await?.last_insert_id)
    }

    /// Execute `sql` once per parameter row.
    ///
    /// The rows run in one transaction; if any row fails everything is
    /// rolled back and the error is returned.
    pub async fn execute_many(&self, sql: &str, rows: &[Vec<Value>]) -> Result<()> {
        let tx = TransactionContext::new(self.pool.acquire().await?);
        tx.start().await?;
        match tx.execute_many(sql, rows).await {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback after execute_many failure failed");
                }
                Err(e)
            }
        }
    }

    /// Execute a query; returns the row count and one record per row.
    pub async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<(u64, Vec<Record>)> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.execute(sql, params).await?;
        Ok((
            result.rows_affected,
            materialize::flat_records(&result.columns, result.rows),
        ))
    }

    /// Execute one or more statements with no result expected.
    pub async fn execute_script(&self, sql: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        conn.execute_script(sql).await
    }

    /// Run a SELECT and materialize records, joins and prefetches included.
    pub async fn fetch(&self, select: &Select, prefetches: &[Prefetch]) -> Result<Vec<Record>> {
        let mut conn = self.pool.acquire().await?;
        materialize::fetch(&mut conn, self.dialect, select, prefetches).await
    }

    /// Run an UPDATE; returns the number of rows changed.
    pub async fn update(&self, update: &Update) -> Result<u64> {
        let query = update.build(self.dialect)?;
        let mut conn = self.pool.acquire().await?;
        Ok(conn.execute(&query.sql, &query.params).await?.rows_affected)
    }

    /// Check out a connection and begin a transaction on it.
    pub async fn transaction(&self) -> Result<TransactionContext> {
        let tx = TransactionContext::new(self.pool.acquire().await?);
        tx.start().await?;
        Ok(tx)
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok` and rolls back when it returns `Err`,
    /// unless `f` already finalized the transaction itself.
    pub async fn in_transaction<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tx = self.transaction().await?;
        match f(tx.clone()).await {
            Ok(value) => {
                if tx.state() == TxState::Active {
                    tx.commit().await?;
                }
                Ok(value)
            }
            Err(e) => {
                if tx.state() == TxState::Active {
                    if let Err(rollback_err) = tx.rollback().await {
                        tracing::warn!(error = %rollback_err, "rollback after failed transaction body failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Create the configured database.
    pub async fn create_database(&self) -> Result<()> {
        self.pool.create_database().await
    }

    /// Drop the configured database; a missing database is not an error.
    pub async fn drop_database(&self) -> Result<()> {
        self.pool.drop_database().await
    }

    /// Close the pool. Safe to call more than once.
    pub async fn close(&self) {
        self.pool.close().await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("driver", &self.pool.driver().kind())
            .field("database", &self.pool.config().database)
            .field("open", &self.pool.is_open())
            .finish()
    }
}
