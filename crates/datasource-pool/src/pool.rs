//! Connection pool implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::{PoolError, ReleaseError};
use crate::lifecycle::{ConnectionFactory, ConnectionId, ConnectionMetadata};
use crate::reaper::{self, SweepSummary};
use crate::registry::ConnectionRegistry;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A pool of database connections.
///
/// The pool keeps between `min_connections` and `max_connections` open
/// connections, hands them out to callers one at a time, and checks idle
/// connections in the background. Cloning a `Pool` is cheap and yields
/// another handle to the same pool.
///
/// Connections obtained from [`acquire`](Self::acquire) must be handed back
/// with [`release`](Self::release). A loan that is dropped instead is
/// reported in the log and its slot stays occupied.
///
/// Call [`shutdown`](Self::shutdown) when done. If the last handle is dropped
/// without it, the idle connections are closed on a background task when a
/// tokio runtime is available, and only logged otherwise.
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    pub(crate) id: u64,
    pub(crate) config: PoolConfig,
    pub(crate) factory: Arc<F>,
    pub(crate) state: Mutex<PoolState<F::Connection>>,
    /// Signalled whenever an idle connection or a free slot may have appeared.
    pub(crate) available: Notify,
    /// Tells the health check task to stop.
    pub(crate) reaper_stop: Arc<Notify>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Everything guarded by the pool mutex.
pub(crate) struct PoolState<C> {
    pub(crate) registry: ConnectionRegistry<C>,
    /// Connections being opened right now, counted against `max`.
    pub(crate) pending: u32,
    /// Whether an `acquire` caller is currently growing the pool.
    pub(crate) growing: bool,
    pub(crate) closed: bool,
}

impl<C> PoolState<C> {
    pub(crate) fn has_capacity(&self) -> bool {
        self.registry.size() + self.pending < self.registry.max()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool and open its minimum number of connections.
    ///
    /// Fails with [`PoolError::ConfigInvalid`] for bad bounds, or with
    /// [`PoolError::ConnectFailed`] if any of the initial connections cannot
    /// be opened. In the latter case the connections that did open are
    /// closed again before returning.
    pub async fn new(config: PoolConfig, factory: F) -> Result<Self, PoolError> {
        config.validate()?;

        let mut registry = ConnectionRegistry::new(config.max_connections);
        for opened in 0..config.min_connections {
            match factory.open(&config).await {
                Ok(conn) => {
                    if let Err(conn) = registry.add_new(conn) {
                        factory.close(conn).await;
                    }
                }
                Err(e) => {
                    for conn in registry.drain_idle() {
                        factory.close(conn).await;
                    }
                    return Err(PoolError::ConnectFailed(format!(
                        "opened {opened} of {} initial connections: {e}",
                        config.min_connections
                    )));
                }
            }
        }

        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            factory: Arc::new(factory),
            state: Mutex::new(PoolState {
                registry,
                pending: 0,
                growing: false,
                closed: false,
            }),
            available: Notify::new(),
            reaper_stop: Arc::new(Notify::new()),
            reaper: Mutex::new(None),
        });
        *inner.reaper.lock() = Some(reaper::spawn(&inner));

        tracing::info!(
            pool = inner.id,
            min = inner.config.min_connections,
            max = inner.config.max_connections,
            "connection pool created"
        );

        Ok(Self { inner })
    }

    /// Get a connection, waiting at most the configured `connection_timeout`.
    pub async fn get(&self) -> Result<PooledConnection<F::Connection>, PoolError> {
        self.acquire(self.inner.config.connection_timeout).await
    }

    /// Get a connection from the pool.
    ///
    /// Returns an idle connection if there is one. Otherwise, if the pool is
    /// below its maximum size, opens a new connection; only one caller grows
    /// the pool at a time and the others wait. If the pool is full, waits up
    /// to `timeout` for a connection to be released.
    ///
    /// Fails with [`PoolError::AcquireTimeout`] when the wait runs out, with
    /// the factory's error when growing fails, and with
    /// [`PoolError::PoolClosed`] if the pool is or gets shut down.
    pub async fn acquire(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<F::Connection>, PoolError> {
        let deadline = Instant::now().checked_add(timeout);
        tracing::trace!(pool = self.inner.id, "acquiring connection from pool");

        loop {
            // Register for wakeups before looking at the state so a release
            // between the check and the wait is not missed.
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let reservation = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolError::PoolClosed);
                }
                if let Some((meta, conn)) = state.registry.take_idle() {
                    return Ok(self.inner.loan(meta, conn));
                }
                if !state.growing && state.has_capacity() {
                    Some(Reservation::reserve(&self.inner, &mut *state, true))
                } else {
                    None
                }
            };

            if let Some(reservation) = reservation {
                return self.inner.grow(reservation).await;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        tracing::debug!(
                            pool = self.inner.id,
                            timeout = ?timeout,
                            "timed out waiting for a connection"
                        );
                        return Err(PoolError::AcquireTimeout(timeout));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Get a connection without waiting.
    ///
    /// Takes an idle connection or grows the pool by one; fails with
    /// [`PoolError::PoolExhausted`] if neither is possible right now.
    pub async fn try_acquire(&self) -> Result<PooledConnection<F::Connection>, PoolError> {
        let reservation = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(PoolError::PoolClosed);
            }
            if let Some((meta, conn)) = state.registry.take_idle() {
                return Ok(self.inner.loan(meta, conn));
            }
            if state.growing || !state.has_capacity() {
                return Err(PoolError::PoolExhausted {
                    max: state.registry.max(),
                });
            }
            Reservation::reserve(&self.inner, &mut *state, true)
        };

        self.inner.grow(reservation).await
    }

    /// Return a connection to the pool.
    ///
    /// The connection is probed first (unless `test_on_checkin` is off); a
    /// dead connection is closed and its slot freed instead of being put back
    /// in the idle queue. Handing back a connection that belongs to another
    /// pool fails with [`PoolError::ProtocolViolation`], leaves this pool
    /// untouched and returns the loan in [`ReleaseError::conn`] so it can be
    /// released to its own pool.
    pub async fn release(
        &self,
        conn: PooledConnection<F::Connection>,
    ) -> Result<(), ReleaseError<F::Connection>> {
        if conn.pool_id != self.inner.id {
            let message = format!(
                "{} belongs to pool {}, not pool {}",
                conn.id(),
                conn.pool_id,
                self.inner.id
            );
            tracing::error!(pool = self.inner.id, "{message}");
            return Err(ReleaseError::rejected(
                PoolError::ProtocolViolation(message),
                conn,
            ));
        }

        let (meta, mut raw) = conn.into_parts();
        let id = meta.id;
        tracing::trace!(pool = self.inner.id, connection = %id, "returning connection to pool");

        let (tracked, closed) = {
            let state = self.inner.state.lock();
            (state.registry.is_active(id), state.closed)
        };
        if !tracked {
            self.inner.factory.close(raw).await;
            return Err(ReleaseError::consumed(self.inner.violation(id)));
        }
        if closed {
            self.inner.retire(id, raw).await;
            return Ok(());
        }

        if self.inner.config.test_on_checkin && !self.inner.is_alive(&mut raw).await {
            tracing::debug!(
                pool = self.inner.id,
                connection = %id,
                "discarding dead connection on release"
            );
            self.inner.retire(id, raw).await;
            return Ok(());
        }

        let rejected = {
            let mut state = self.inner.state.lock();
            if state.closed {
                Some((raw, true))
            } else {
                state.registry.put_idle(meta, raw).err().map(|raw| (raw, false))
            }
        };

        match rejected {
            None => {
                self.inner.available.notify_one();
                Ok(())
            }
            Some((raw, true)) => {
                self.inner.retire(id, raw).await;
                Ok(())
            }
            Some((raw, false)) => {
                self.inner.factory.close(raw).await;
                Err(ReleaseError::consumed(self.inner.violation(id)))
            }
        }
    }

    /// Take a connection out of the pool for good.
    ///
    /// The connection's slot is freed and the caller becomes responsible for
    /// closing it. A loan from another pool is handed back in the error.
    pub fn detach(
        &self,
        conn: PooledConnection<F::Connection>,
    ) -> Result<F::Connection, ReleaseError<F::Connection>> {
        if conn.pool_id != self.inner.id {
            let message = format!(
                "cannot detach {} from pool {}: it belongs to pool {}",
                conn.id(),
                self.inner.id,
                conn.pool_id
            );
            tracing::error!(pool = self.inner.id, "{message}");
            return Err(ReleaseError::rejected(
                PoolError::ProtocolViolation(message),
                conn,
            ));
        }

        let id = conn.id();
        if !self.inner.state.lock().registry.discard_active(id) {
            return Err(ReleaseError::rejected(self.inner.violation(id), conn));
        }
        let (meta, raw) = conn.into_parts();
        self.inner.available.notify_one();
        tracing::debug!(pool = self.inner.id, connection = %meta.id, "connection detached from pool");
        Ok(raw)
    }

    /// Shut the pool down.
    ///
    /// Closes every idle connection, stops the health check task and wakes
    /// all waiting callers with [`PoolError::PoolClosed`]. Calling this more
    /// than once has no further effect.
    ///
    /// Connections on loan are owned by their callers, so they are not closed
    /// here. Each one is closed and deregistered when it is released, and
    /// that release succeeds.
    pub async fn shutdown(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.registry.drain_idle()
        };

        self.inner.available.notify_waiters();
        self.inner.reaper_stop.notify_one();
        let reaper = self.inner.reaper.lock().take();
        if let Some(handle) = reaper {
            if let Err(e) = handle.await {
                tracing::warn!(pool = self.inner.id, error = %e, "health check task failed");
            }
        }

        let count = idle.len();
        for conn in idle {
            self.inner.factory.close(conn).await;
        }

        tracing::info!(pool = self.inner.id, closed = count, "connection pool shut down");
    }

    /// Run one health check sweep over the idle connections now.
    ///
    /// The same sweep runs every `health_check_interval` in the background.
    pub async fn run_health_check(&self) -> SweepSummary {
        reaper::sweep(&self.inner).await
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.state.lock().registry.snapshot()
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the connection factory.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn loan(&self, meta: ConnectionMetadata, conn: F::Connection) -> PooledConnection<F::Connection> {
        tracing::trace!(pool = self.id, connection = %meta.id, "connection checked out");
        PooledConnection {
            conn,
            guard: LeakGuard {
                id: meta.id,
                pool_id: self.id,
                armed: true,
            },
            meta,
            pool_id: self.id,
        }
    }

    /// Open one connection for an `acquire` caller holding a growth reservation.
    async fn grow(
        &self,
        reservation: Reservation<'_, F::Connection>,
    ) -> Result<PooledConnection<F::Connection>, PoolError> {
        tracing::debug!(pool = self.id, "growing pool by one connection");

        let conn = match self.factory.open(&self.config).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(pool = self.id, error = %e, "failed to grow pool");
                return Err(e);
            }
        };

        let max = self.config.max_connections;
        let outcome = {
            let mut state = self.state.lock();
            reservation.settle(&mut *state);
            if state.closed {
                Err((conn, PoolError::PoolClosed))
            } else {
                match state.registry.add_new(conn) {
                    Ok(_) => Ok(state.registry.take_idle()),
                    Err(conn) => Err((conn, PoolError::PoolExhausted { max })),
                }
            }
        };

        // Let a waiter reconsider growing now that this growth is done.
        self.available.notify_one();

        match outcome {
            Ok(Some((meta, conn))) => Ok(self.loan(meta, conn)),
            Ok(None) => Err(PoolError::PoolExhausted { max }),
            Err((conn, e)) => {
                self.factory.close(conn).await;
                Err(e)
            }
        }
    }

    /// Probe a connection, bounded by `validation_timeout`.
    pub(crate) async fn is_alive(&self, conn: &mut F::Connection) -> bool {
        let timeout = self.config.validation_timeout;
        match tokio::time::timeout(timeout, self.factory.is_valid(conn, timeout)).await {
            Ok(valid) => valid,
            Err(_) => {
                tracing::warn!(pool = self.id, timeout = ?timeout, "liveness probe timed out");
                false
            }
        }
    }

    /// Drop an active connection from the books and close it.
    async fn retire(&self, id: ConnectionId, conn: F::Connection) {
        self.state.lock().registry.discard_active(id);
        self.available.notify_one();
        self.factory.close(conn).await;
    }

    fn violation(&self, id: ConnectionId) -> PoolError {
        let message = format!("{id} is not checked out from pool {}", self.id);
        tracing::error!(pool = self.id, "{message}");
        PoolError::ProtocolViolation(message)
    }
}

impl<F: ConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        self.reaper_stop.notify_one();

        let state = self.state.get_mut();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle = state.registry.drain_idle();
        if idle.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(
                    pool = self.id,
                    count = idle.len(),
                    "pool dropped without shutdown; closing idle connections"
                );
                let factory = Arc::clone(&self.factory);
                runtime.spawn(async move {
                    for conn in idle {
                        factory.close(conn).await;
                    }
                });
            }
            Err(_) => tracing::warn!(
                pool = self.id,
                count = idle.len(),
                "pool dropped outside a tokio runtime without shutdown; idle connections were not closed"
            ),
        }
    }
}

/// A slot reserved for a connection that is being opened.
///
/// Counts against `max_connections` until settled. Dropping an unsettled
/// reservation (failed open, cancelled caller) gives the slot back.
pub(crate) struct Reservation<'a, C> {
    state: &'a Mutex<PoolState<C>>,
    available: &'a Notify,
    grower: bool,
    settled: bool,
}

impl<'a, C> Reservation<'a, C> {
    pub(crate) fn reserve<F>(
        inner: &'a PoolInner<F>,
        state: &mut PoolState<C>,
        grower: bool,
    ) -> Self
    where
        F: ConnectionFactory<Connection = C>,
    {
        state.pending += 1;
        if grower {
            state.growing = true;
        }
        Self {
            state: &inner.state,
            available: &inner.available,
            grower,
            settled: false,
        }
    }

    /// Release the slot while already holding the pool lock.
    pub(crate) fn settle(mut self, state: &mut PoolState<C>) {
        Self::release_slot(state, self.grower);
        self.settled = true;
    }

    fn release_slot(state: &mut PoolState<C>, grower: bool) {
        state.pending = state.pending.saturating_sub(1);
        if grower {
            state.growing = false;
        }
    }
}

impl<C> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if !self.settled {
            Self::release_slot(&mut *self.state.lock(), self.grower);
            self.available.notify_one();
        }
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections.
    pub idle: u32,
    /// Number of connections currently on loan.
    pub active: u32,
    /// Total number of connections (`idle + active`).
    pub size: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

/// A connection on loan from the pool.
///
/// Dereferences to the underlying connection. Hand it back with
/// [`Pool::release`] when done.
pub struct PooledConnection<C> {
    conn: C,
    meta: ConnectionMetadata,
    pool_id: u64,
    guard: LeakGuard,
}

impl<C> PooledConnection<C> {
    /// The pool-unique id of this connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.meta.id
    }

    /// Bookkeeping the pool keeps about this connection.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.meta
    }

    fn into_parts(self) -> (ConnectionMetadata, C) {
        let Self {
            conn,
            meta,
            mut guard,
            ..
        } = self;
        guard.armed = false;
        (meta, conn)
    }
}

impl<C> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("id", &self.meta.id)
            .field("pool", &self.pool_id)
            .finish()
    }
}

/// Reports loans that are dropped instead of released.
struct LeakGuard {
    id: ConnectionId,
    pool_id: u64,
    armed: bool,
}

impl Drop for LeakGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(
                pool = self.pool_id,
                connection = %self.id,
                "pooled connection dropped without release; its slot stays occupied"
            );
        }
    }
}

/// Builder for [`Pool`].
#[derive(Debug, Clone, Default)]
pub struct PoolBuilder {
    config: PoolConfig,
}

impl PoolBuilder {
    /// Create a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the connection URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config = self.config.url(url);
        self
    }

    /// Set the username and password.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config = self.config.credentials(username, password);
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.config = self.config.min_connections(count);
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.config = self.config.max_connections(count);
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.connection_timeout(timeout);
        self
    }

    /// Set the health check interval.
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.health_check_interval(interval);
        self
    }

    /// Build the pool.
    pub async fn build<F: ConnectionFactory>(self, factory: F) -> Result<Pool<F>, PoolError> {
        Pool::new(self.config, factory).await
    }
}
