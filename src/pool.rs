//! Connection Pool Manager.
//!
//! A semaphore bounds checkouts to `max_size`; connections are only opened
//! while holding a permit and no idle connection is usable, so the number
//! of live connections never exceeds the bound either. A checkout goes back
//! to the idle list when its [`PooledConnection`] is dropped, unless it is
//! faulted, was dropped mid-statement, or the pool has been closed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ClientConfig;
use crate::driver::{DriverConnection, DriverHandle, DriverKind, DriverResult};
use crate::error::{DbError, Result};
use crate::value::Value;

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to the pool.
pub struct PooledConnection {
    /// The actual connection (None once returned)
    conn: Option<DriverConnection>,
    pool: Arc<PoolInner>,
    faulted: bool,
    /// Set while a statement is awaiting the driver; still set on drop means
    /// the caller was cancelled mid-statement.
    in_flight: bool,
    /// Semaphore permit (controls pool size)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(conn: DriverConnection, pool: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            pool,
            faulted: false,
            in_flight: false,
            _permit: permit,
        }
    }

    /// Borrow the driver connection for one statement.
    ///
    /// A statement still in flight here was cancelled before its response
    /// was read; the connection is faulted rather than reused.
    fn conn_mut(&mut self) -> Result<&mut DriverConnection> {
        if self.in_flight {
            self.faulted = true;
            tracing::warn!("connection interrupted mid-statement");
            return Err(DbError::ConnectionError(
                "connection interrupted mid-statement".to_string(),
            ));
        }
        self.in_flight = true;
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::ConnectionError("connection already released".to_string()))
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        self.in_flight = false;
        if let Err(e) = &result {
            if e.is_connection_fault() {
                tracing::warn!(error = %e, "connection faulted");
                self.faulted = true;
            }
        }
        result
    }

    pub fn kind(&self) -> Option<DriverKind> {
        self.conn.as_ref().map(DriverConnection::kind)
    }

    /// Execute one parameterized statement.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<DriverResult> {
        let result = self.conn_mut()?.execute(sql, params).await;
        self.settle(result)
    }

    /// Execute a script; no result is expected.
    pub async fn execute_script(&mut self, sql: &str) -> Result<()> {
        let result = self.conn_mut()?.execute_script(sql).await;
        self.settle(result)
    }

    pub async fn begin(&mut self) -> Result<()> {
        let result = self.conn_mut()?.begin().await;
        self.settle(result)
    }

    pub async fn commit(&mut self) -> Result<()> {
        let result = self.conn_mut()?.commit().await;
        self.settle(result)
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let result = self.conn_mut()?.rollback().await;
        self.settle(result)
    }

    pub async fn create_database(&mut self, name: &str) -> Result<()> {
        let result = self.conn_mut()?.create_database(name).await;
        self.settle(result)
    }

    pub async fn drop_database(&mut self, name: &str) -> Result<()> {
        let result = self.conn_mut()?.drop_database(name).await;
        self.settle(result)
    }

    /// Discard this connection on release instead of returning it idle.
    pub fn mark_faulted(&mut self) {
        self.faulted = true;
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if self.in_flight {
            tracing::warn!("connection released mid-statement, discarding");
        } else if !self.faulted && !conn.is_closed() {
            // checked under the idle lock so close() cannot miss it
            let mut idle = self.pool.idle.lock();
            if !self.pool.closed.load(Ordering::Acquire) {
                idle.push(IdleConnection {
                    conn,
                    faulted: false,
                });
                return;
            }
        }
        self.pool.retire(conn);
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct IdleConnection {
    conn: DriverConnection,
    /// Set by expire_idle; the connection is closed instead of handed out.
    faulted: bool,
}

/// Internal pool state.
struct PoolInner {
    config: Arc<ClientConfig>,
    driver: DriverHandle,
    /// Whether connections select the configured database
    with_database: bool,
    /// Idle connections waiting to be used
    idle: Mutex<Vec<IdleConnection>>,
    /// Semaphore to limit checkouts
    semaphore: Arc<Semaphore>,
    /// Live physical connections, idle or checked out
    open: Arc<AtomicUsize>,
    closed: AtomicBool,
}

/// Counts a connection as open until disarmed; undone if the connect fails
/// or the acquiring task is cancelled.
struct OpenReservation {
    open: Arc<AtomicUsize>,
    armed: bool,
}

impl OpenReservation {
    fn new(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::AcqRel);
        Self {
            open: Arc::clone(open),
            armed: true,
        }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for OpenReservation {
    fn drop(&mut self) {
        if self.armed {
            self.open.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl PoolInner {
    /// Build the pool and open `warm` connections eagerly.
    ///
    /// Any failure here is reported as a connection error.
    async fn open(
        config: Arc<ClientConfig>,
        driver: DriverHandle,
        with_database: bool,
        open: Arc<AtomicUsize>,
        warm: u32,
    ) -> Result<Arc<Self>> {
        let inner = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_size as usize)),
            config,
            driver,
            with_database,
            idle: Mutex::new(Vec::new()),
            open,
            closed: AtomicBool::new(false),
        });

        for _ in 0..warm {
            let reservation = OpenReservation::new(&inner.open);
            match inner.driver.connect(&inner.config, with_database).await {
                Ok(conn) => {
                    reservation.keep();
                    inner.idle.lock().push(IdleConnection {
                        conn,
                        faulted: false,
                    });
                }
                Err(e) => {
                    drop(reservation);
                    inner.close().await;
                    return Err(e.into_connection_error());
                }
            }
        }

        tracing::debug!(
            driver = driver.kind().name(),
            with_database,
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            "pool opened"
        );
        Ok(inner)
    }

    async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        // Acquire a permit (suspends while the pool is exhausted)
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| DbError::ConnectionError("pool is closed".to_string()))?;

        loop {
            let entry = self.idle.lock().pop();
            match entry {
                Some(IdleConnection { conn, faulted }) if faulted || conn.is_closed() => {
                    tracing::debug!("discarding expired idle connection");
                    self.retire(conn);
                }
                Some(IdleConnection { conn, .. }) => {
                    return Ok(PooledConnection::new(conn, Arc::clone(self), permit));
                }
                None => break,
            }
        }

        let reservation = OpenReservation::new(&self.open);
        let conn = self.driver.connect(&self.config, self.with_database).await?;
        reservation.keep();
        tracing::debug!(
            open = self.open.load(Ordering::Acquire),
            "opened new pooled connection"
        );
        Ok(PooledConnection::new(conn, Arc::clone(self), permit))
    }

    /// Close a connection that will not return to the pool.
    fn retire(&self, conn: DriverConnection) {
        self.open.fetch_sub(1, Ordering::AcqRel);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.close().await {
                        tracing::debug!(error = %e, "error closing retired connection");
                    }
                });
            }
            // no runtime to close on; dropping the transport closes it
            Err(_) => drop(conn),
        }
    }

    fn expire_idle(&self) -> usize {
        let mut idle = self.idle.lock();
        for entry in idle.iter_mut() {
            entry.faulted = true;
        }
        idle.len()
    }

    async fn close(&self) {
        self.semaphore.close();
        let drained = {
            let mut idle = self.idle.lock();
            self.closed.store(true, Ordering::Release);
            std::mem::take(&mut *idle)
        };
        let count = drained.len();
        for entry in drained {
            self.open.fetch_sub(1, Ordering::AcqRel);
            if let Err(e) = entry.conn.close().await {
                tracing::warn!(error = %e, "error closing pooled connection");
            }
        }
        tracing::debug!(closed = count, "pool closed");
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

#[derive(Clone, Copy)]
enum AdminOp {
    Create,
    Drop,
}

/// A bounded pool of connections for one client.
///
/// The physical pool is built lazily on the first checkout, or eagerly with
/// [`ConnectionPool::open`]. Closing it drops the physical pool; a later
/// checkout builds a fresh one.
pub struct ConnectionPool {
    config: Arc<ClientConfig>,
    driver: DriverHandle,
    state: Mutex<Option<Arc<PoolInner>>>,
    /// Serializes building the physical pool.
    opening: tokio::sync::Mutex<()>,
    /// Shared across rebuilds so connections still checked out from a
    /// closed pool are counted until they are released.
    open: Arc<AtomicUsize>,
}

impl ConnectionPool {
    /// Fails with `ConfigError` when the size bounds are unusable.
    pub fn new(config: ClientConfig, driver: DriverHandle) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            driver,
            state: Mutex::new(None),
            opening: tokio::sync::Mutex::new(()),
            open: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn driver(&self) -> DriverHandle {
        self.driver
    }

    /// Build the physical pool, opening `min_size` connections.
    ///
    /// With `with_database == false` connections do not select the
    /// configured database. A no-op when the pool is already open.
    pub async fn open(&self, with_database: bool) -> Result<()> {
        self.inner(with_database).await.map(drop)
    }

    async fn inner(&self, with_database: bool) -> Result<Arc<PoolInner>> {
        if let Some(inner) = self.state.lock().as_ref() {
            return Ok(Arc::clone(inner));
        }

        let _opening = self.opening.lock().await;
        if let Some(inner) = self.state.lock().as_ref() {
            return Ok(Arc::clone(inner));
        }
        let inner = PoolInner::open(
            Arc::clone(&self.config),
            self.driver,
            with_database,
            Arc::clone(&self.open),
            self.config.min_size,
        )
        .await?;
        *self.state.lock() = Some(Arc::clone(&inner));
        Ok(inner)
    }

    /// Check out a connection, suspending until one is available.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let inner = self.inner(true).await?;
        inner.acquire().await
    }

    /// Mark every idle connection faulted so the next checkout reconnects.
    ///
    /// Returns the number of connections expired.
    pub fn expire_idle(&self) -> usize {
        let inner = self.state.lock().clone();
        let count = inner.map(|inner| inner.expire_idle()).unwrap_or(0);
        tracing::debug!(expired = count, "expired idle connections");
        count
    }

    /// Close every idle connection and drop the physical pool.
    ///
    /// Connections still checked out are closed when released. Closing a
    /// closed pool is a no-op.
    pub async fn close(&self) {
        let _opening = self.opening.lock().await;
        let inner = self.state.lock().take();
        if let Some(inner) = inner {
            inner.close().await;
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn idle_count(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map(|inner| inner.idle.lock().len())
            .unwrap_or(0)
    }

    /// Live physical connections, idle or checked out.
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    /// Run an administrative statement on a short-lived connection that
    /// does not select the configured database.
    async fn run_admin(&self, op: AdminOp) -> Result<()> {
        let admin = PoolInner::open(
            Arc::clone(&self.config),
            self.driver,
            false,
            Arc::new(AtomicUsize::new(0)),
            0,
        )
        .await?;
        let result = match admin.acquire().await {
            Ok(mut conn) => match op {
                AdminOp::Create => conn.create_database(&self.config.database).await,
                AdminOp::Drop => conn.drop_database(&self.config.database).await,
            },
            Err(e) => Err(e.into_connection_error()),
        };
        admin.close().await;
        result
    }

    /// Create the configured database.
    pub async fn create_database(&self) -> Result<()> {
        self.run_admin(AdminOp::Create).await?;
        tracing::debug!(database = %self.config.database, "database created");
        Ok(())
    }

    /// Drop the configured database, ignoring "does not exist".
    pub async fn drop_database(&self) -> Result<()> {
        match self.run_admin(AdminOp::Drop).await {
            Err(e) if e.is_missing_object() => {
                tracing::warn!(database = %self.config.database, error = %e, "drop_database ignored missing database");
                Ok(())
            }
            other => other,
        }
    }
}
