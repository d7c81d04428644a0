//! A bounded pool of reusable connections.
//!
//! Connections are partitioned into *available* and *in use*, and the sum of
//! both never exceeds the pool capacity. Connections are created on demand,
//! health and staleness are checked on both checkout and checkin, and callers
//! that find the pool exhausted wait, up to a deadline, for a checkin.

use crate::connection::Connection;
use crate::{Error, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Opens a new connection for the pool.
pub type ConnectionFactory<C> = Box<dyn Fn() -> BoxFuture<'static, Result<C>> + Send + Sync>;

/// Pool statistics for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum connections the pool will hold
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
    pub total_created: usize,
    pub total_checkouts: usize,
    /// Checkouts that gave up waiting for a connection
    pub total_timeouts: usize,
}

struct PoolState<C> {
    available: VecDeque<C>,
    in_use: usize,
    closed: bool,
    total_created: usize,
    total_checkouts: usize,
    total_timeouts: usize,
}

struct PoolInner<C> {
    capacity: usize,
    factory: ConnectionFactory<C>,
    state: Mutex<PoolState<C>>,
    /// Signalled on every checkin and every destroyed connection.
    released: Notify,
}

impl<C: Connection> PoolInner<C> {
    fn release(&self, mut conn: C) {
        let doomed = {
            let mut state = self.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
            if state.closed || !conn.is_healthy() || conn.is_stale() {
                Some(conn)
            } else {
                conn.touch();
                state.available.push_back(conn);
                None
            }
        };

        if let Some(conn) = doomed {
            destroy(conn);
        }
        self.released.notify_one();
    }

    fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.released.notify_one();
    }
}

fn destroy<C: Connection>(mut conn: C) {
    if let Err(e) = conn.disconnect() {
        tracing::warn!(error = %e, "Failed to disconnect pooled connection");
    } else {
        tracing::debug!("Destroyed pooled connection");
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dereferences to the connection. Dropping the guard checks the connection
/// back in, including during unwinding.
pub struct PooledConnection<C: Connection> {
    conn: Option<C>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken in drop"),
        }
    }
}

impl<C: Connection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken in drop"),
        }
    }
}

impl<C: Connection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// A capacity slot claimed while a new connection is being opened.
///
/// If the open fails or the checkout future is dropped mid-open, the slot
/// is handed back.
struct Reservation<'a, C: Connection> {
    pool: &'a Arc<PoolInner<C>>,
    armed: bool,
}

impl<C: Connection> Reservation<'_, C> {
    fn fulfil(mut self, conn: C) -> PooledConnection<C> {
        self.armed = false;
        {
            let mut state = self.pool.state.lock();
            state.total_created += 1;
            state.total_checkouts += 1;
        }
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self.pool),
        }
    }
}

impl<C: Connection> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

enum Acquire<C> {
    Reuse(C),
    Create,
    Wait,
}

/// A thread-safe, bounded connection pool.
///
/// Cloning the pool yields another handle to the same connections.
///
/// # Examples
///
/// ```no_run
/// use clickhttp::connection::{ConnectionConfig, HttpConnection};
/// use clickhttp::pool::ConnectionPool;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), clickhttp::Error> {
/// let config = Arc::new(ConnectionConfig::default());
/// let pool = ConnectionPool::new(4, move || {
///     let config = Arc::clone(&config);
///     Box::pin(async move { HttpConnection::open(config) })
/// })?;
///
/// let mut conn = pool.checkout(Duration::from_secs(5)).await?;
/// let alive = conn.ping().await;
/// pool.checkin(Some(conn));
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<C: Connection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connection> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connection> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: Connection> ConnectionPool<C> {
    /// Creates an empty pool holding at most `capacity` connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigurationError`] if `capacity` is zero.
    pub fn new<F>(capacity: usize, factory: F) -> Result<Self>
    where
        F: Fn() -> BoxFuture<'static, Result<C>> + Send + Sync + 'static,
    {
        if capacity == 0 {
            return Err(Error::ConfigurationError(
                "pool capacity must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                capacity,
                factory: Box::new(factory),
                state: Mutex::new(PoolState {
                    available: VecDeque::with_capacity(capacity),
                    in_use: 0,
                    closed: false,
                    total_created: 0,
                    total_checkouts: 0,
                    total_timeouts: 0,
                }),
                released: Notify::new(),
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Borrows a connection, waiting at most `timeout` for one to free up.
    ///
    /// Available connections are reused most-recently-returned first. Any that
    /// fail the health or staleness check are destroyed and replaced.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolTimeout`] if the pool stayed exhausted for `timeout`
    /// - [`Error::PoolClosed`] after [`shutdown`](Self::shutdown)
    /// - whatever the factory returns when opening a connection fails
    pub async fn checkout(&self, timeout: Duration) -> Result<PooledConnection<C>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            // Register interest before inspecting state so a checkin between
            // the inspection and the wait is not lost.
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let mut discarded = Vec::new();
            let acquire = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(Error::PoolClosed);
                }

                let mut reusable = None;
                while let Some(conn) = state.available.pop_back() {
                    if conn.is_healthy() && !conn.is_stale() {
                        reusable = Some(conn);
                        break;
                    }
                    discarded.push(conn);
                }

                match reusable {
                    Some(conn) => {
                        state.in_use += 1;
                        state.total_checkouts += 1;
                        Acquire::Reuse(conn)
                    }
                    None if state.available.len() + state.in_use < self.inner.capacity => {
                        state.in_use += 1;
                        Acquire::Create
                    }
                    None => Acquire::Wait,
                }
            };

            if !discarded.is_empty() {
                tracing::debug!(
                    count = discarded.len(),
                    "Discarding unhealthy or stale connections"
                );
                discarded.into_iter().for_each(destroy);
            }

            match acquire {
                Acquire::Reuse(conn) => {
                    tracing::debug!("Reusing pooled connection");
                    return Ok(PooledConnection {
                        conn: Some(conn),
                        pool: Arc::clone(&self.inner),
                    });
                }
                Acquire::Create => {
                    let reservation = Reservation {
                        pool: &self.inner,
                        armed: true,
                    };
                    let conn = (self.inner.factory)().await?;
                    tracing::debug!(capacity = self.inner.capacity, "Created pooled connection");
                    return Ok(reservation.fulfil(conn));
                }
                Acquire::Wait => {
                    tracing::debug!(capacity = self.inner.capacity, "Pool exhausted, waiting");
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        self.inner.state.lock().total_timeouts += 1;
                        tracing::warn!(
                            timeout_ms = timeout.as_millis(),
                            capacity = self.inner.capacity,
                            "Timed out waiting for a pooled connection"
                        );
                        return Err(Error::PoolTimeout {
                            timeout,
                            capacity: self.inner.capacity,
                        });
                    }
                }
            }
        }
    }

    /// Returns a connection to the pool. `None` is a no-op.
    ///
    /// Healthy connections become available again and wake one waiter;
    /// anything else is destroyed.
    pub fn checkin(&self, conn: Option<PooledConnection<C>>) {
        drop(conn);
    }

    /// Runs `body` with a checked-out connection, checking it back in
    /// afterwards whether `body` succeeds or fails.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use clickhttp::connection::HttpConnection;
    /// # use clickhttp::pool::ConnectionPool;
    /// # use std::time::Duration;
    /// # async fn example(pool: ConnectionPool<HttpConnection>) -> Result<(), clickhttp::Error> {
    /// let alive = pool
    ///     .with_connection(Duration::from_secs(5), |conn| {
    ///         Box::pin(async move { Ok(conn.ping().await) })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_connection<T, F>(&self, timeout: Duration, body: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.checkout(timeout).await?;
        let result = body(&mut conn).await;
        self.checkin(Some(conn));
        result
    }

    /// Destroys available connections idle for longer than `max_idle`.
    ///
    /// Connections in use are not touched. Returns how many were removed.
    pub fn cleanup(&self, max_idle: Duration) -> usize {
        let expired: Vec<C> = {
            let mut state = self.inner.state.lock();
            let (keep, expired): (VecDeque<C>, VecDeque<C>) =
                std::mem::take(&mut state.available)
                    .into_iter()
                    .partition(|conn| conn.last_used().elapsed() <= max_idle);
            state.available = keep;
            expired.into()
        };

        let removed = expired.len();
        if removed > 0 {
            expired.into_iter().for_each(destroy);
            tracing::debug!(removed = removed, "Cleaned up idle connections");
            self.inner.released.notify_waiters();
        }
        removed
    }

    /// Closes the pool.
    ///
    /// Available connections are destroyed now, connections in use are
    /// destroyed when they are checked in, and waiting or future checkouts
    /// fail with [`Error::PoolClosed`].
    pub fn shutdown(&self) {
        let drained: Vec<C> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.available.drain(..).collect()
        };

        tracing::debug!(destroyed = drained.len(), "Shutting down connection pool");
        drained.into_iter().for_each(destroy);
        self.inner.released.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Returns a snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            capacity: self.inner.capacity,
            available: state.available.len(),
            in_use: state.in_use,
            total_created: state.total_created,
            total_checkouts: state.total_checkouts,
            total_timeouts: state.total_timeouts,
        }
    }
}
