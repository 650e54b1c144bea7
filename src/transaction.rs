//! Transaction Context.
//!
//! A context owns one checked-out connection behind an async mutex, so every
//! statement issued through it (or through any clone or nested context) is
//! serialized. The connection goes back to the pool as soon as the outermost
//! transaction is finalized.
//!
//! ```ignore
//! let tx = client.transaction().await?;
//! tx.execute("INSERT INTO t (x) VALUES (?1)", &[1.into()]).await?;
//! let inner = tx.nested()?;
//! inner.start().await?;
//! inner.commit().await?; // no COMMIT sent, the outer transaction decides
//! tx.commit().await?;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;

use crate::dialect::{Dialect, Select};
use crate::driver::{DriverKind, DriverResult};
use crate::error::{DbError, Result};
use crate::materialize::{self, Prefetch, Record};
use crate::pool::PooledConnection;
use crate::value::Value;

/// Lifecycle of a transaction context. `Finalized` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    NotStarted,
    Active,
    Finalized,
}

struct Shared {
    /// None once the outer transaction is finalized
    conn: tokio::sync::Mutex<Option<PooledConnection>>,
    root_state: Arc<Mutex<TxState>>,
    dialect: Dialect,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if *self.root_state.lock() == TxState::Active {
            if let Some(conn) = self.conn.get_mut().as_mut() {
                // the server rolls back when the connection closes
                tracing::warn!("active transaction dropped without commit or rollback");
                conn.mark_faulted();
            }
        }
    }
}

/// A transaction bound to one pooled connection.
///
/// Clones share the same state. [`TransactionContext::nested`] creates a
/// context that reuses the connection but finalizes independently.
#[derive(Clone)]
pub struct TransactionContext {
    shared: Arc<Shared>,
    state: Arc<Mutex<TxState>>,
    nested: bool,
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("state", &self.state())
            .field("nested", &self.nested)
            .finish()
    }
}

fn released() -> DbError {
    DbError::transaction("transaction connection already released")
}

impl TransactionContext {
    /// Wrap a checked-out connection. Nothing is sent until [`start`].
    ///
    /// [`start`]: TransactionContext::start
    pub fn new(conn: PooledConnection) -> Self {
        let dialect = conn.kind().map(DriverKind::dialect).unwrap_or_default();
        let state = Arc::new(Mutex::new(TxState::NotStarted));
        Self {
            shared: Arc::new(Shared {
                conn: tokio::sync::Mutex::new(Some(conn)),
                root_state: Arc::clone(&state),
                dialect,
            }),
            state,
            nested: false,
        }
    }

    pub fn state(&self) -> TxState {
        *self.state.lock()
    }

    pub fn is_nested(&self) -> bool {
        self.nested
    }

    pub fn dialect(&self) -> Dialect {
        self.shared.dialect
    }

    fn root_state(&self) -> TxState {
        *self.shared.root_state.lock()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            TxState::NotStarted => Err(DbError::transaction("transaction has not been started")),
            TxState::Finalized => Err(DbError::transaction("transaction already finalized")),
            TxState::Active if self.root_state() != TxState::Active => {
                Err(DbError::transaction("outer transaction is no longer active"))
            }
            TxState::Active => Ok(()),
        }
    }

    /// Move to `Active`. Only the outermost context sends BEGIN.
    pub async fn start(&self) -> Result<()> {
        if self.state() != TxState::NotStarted {
            return Err(DbError::transaction("transaction already started"));
        }

        if self.nested {
            if self.root_state() != TxState::Active {
                return Err(DbError::transaction("outer transaction is not active"));
            }
            *self.state.lock() = TxState::Active;
            tracing::debug!("nested transaction started");
            return Ok(());
        }

        let mut guard = self.shared.conn.lock().await;
        if self.state() != TxState::NotStarted {
            return Err(DbError::transaction("transaction already started"));
        }
        guard.as_mut().ok_or_else(released)?.begin().await?;
        *self.state.lock() = TxState::Active;
        tracing::debug!("transaction started");
        Ok(())
    }

    /// A context sharing this one's connection.
    ///
    /// It must still be started; it sends no BEGIN, and its commit leaves
    /// the decision to the outer transaction.
    pub fn nested(&self) -> Result<Self> {
        self.ensure_active()?;
        Ok(Self {
            shared: Arc::clone(&self.shared),
            state: Arc::new(Mutex::new(TxState::NotStarted)),
            nested: true,
        })
    }

    /// Lock the connection for one statement.
    async fn lock_active(&self) -> Result<tokio::sync::MutexGuard<'_, Option<PooledConnection>>> {
        self.ensure_active()?;
        let guard = self.shared.conn.lock().await;
        // state may have moved while waiting for the lock
        self.ensure_active()?;
        if guard.is_none() {
            return Err(released());
        }
        Ok(guard)
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<DriverResult> {
        let mut guard = self.lock_active().await?;
        guard.as_mut().ok_or_else(released)?.execute(sql, params).await
    }

    /// Execute a query; returns the row count and flat records.
    pub async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<(u64, Vec<Record>)> {
        let result = self.execute(sql, params).await?;
        Ok((
            result.rows_affected,
            materialize::flat_records(&result.columns, result.rows),
        ))
    }

    /// Execute an INSERT; returns the generated id when the driver reports one.
    pub async fn execute_insert(&self, sql: &str, params: &[Value]) -> Result<Option<i64>> {
        Ok(self.execute(sql, params).await?.last_insert_id)
    }

    /// Execute one statement per parameter row.
    pub async fn execute_many(&self, sql: &str, rows: &[Vec<Value>]) -> Result<()> {
        let mut guard = self.lock_active().await?;
        let conn = guard.as_mut().ok_or_else(released)?;
        for params in rows {
            conn.execute(sql, params).await?;
        }
        Ok(())
    }

    pub async fn execute_script(&self, sql: &str) -> Result<()> {
        let mut guard = self.lock_active().await?;
        guard.as_mut().ok_or_else(released)?.execute_script(sql).await
    }

    pub async fn fetch(&self, select: &Select, prefetches: &[Prefetch]) -> Result<Vec<Record>> {
        let mut guard = self.lock_active().await?;
        let conn = guard.as_mut().ok_or_else(released)?;
        materialize::fetch(conn, self.shared.dialect, select, prefetches).await
    }

    fn ensure_finalizable(&self) -> Result<()> {
        match self.state() {
            TxState::Finalized => Err(DbError::transaction("transaction already finalized")),
            TxState::NotStarted => Err(DbError::transaction("transaction has not been started")),
            TxState::Active => Ok(()),
        }
    }

    /// Commit. A failed COMMIT leaves the transaction active so it can
    /// still be rolled back.
    pub async fn commit(&self) -> Result<()> {
        self.ensure_finalizable()?;

        if self.nested {
            if self.root_state() != TxState::Active {
                return Err(DbError::transaction("outer transaction is no longer active"));
            }
            *self.state.lock() = TxState::Finalized;
            tracing::debug!("nested transaction committed");
            return Ok(());
        }

        let mut guard = self.shared.conn.lock().await;
        self.ensure_finalizable()?;
        guard.as_mut().ok_or_else(released)?.commit().await?;
        *self.state.lock() = TxState::Finalized;
        // back to the pool
        guard.take();
        tracing::debug!("transaction committed");
        Ok(())
    }

    /// Roll back. Always finalizes, even when ROLLBACK itself fails.
    ///
    /// Rolling back a nested context rolls back the whole outer transaction.
    pub async fn rollback(&self) -> Result<()> {
        self.ensure_finalizable()?;
        if self.nested && self.root_state() != TxState::Active {
            return Err(DbError::transaction("outer transaction is no longer active"));
        }

        let mut guard = self.shared.conn.lock().await;
        self.ensure_finalizable()?;
        let result = match guard.as_mut() {
            Some(conn) => {
                let result = conn.rollback().await;
                if result.is_err() {
                    // unknown transaction state on the server
                    conn.mark_faulted();
                }
                result
            }
            None => Err(released()),
        };
        *self.shared.root_state.lock() = TxState::Finalized;
        *self.state.lock() = TxState::Finalized;
        guard.take();
        tracing::debug!(nested = self.nested, "transaction rolled back");
        result
    }
}
