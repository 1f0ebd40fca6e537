//! Scriptable in-memory connection factory.
//!
//! [`MockFactory`] hands out [`MockConnection`]s without touching a network.
//! Tests can make upcoming opens fail, kill individual connections so their
//! liveness probe fails, slow down opens and probes, and observe how many
//! connections were opened and closed.
//!
//! ## Example
//!
//! ```rust,ignore
//! use datasource_pool::{Pool, PoolConfig};
//! use datasource_testing::MockFactory;
//!
//! #[tokio::test]
//! async fn test_pool() {
//!     let factory = MockFactory::new();
//!     let pool = Pool::new(PoolConfig::new().min_connections(2), factory.clone())
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(factory.opened(), 2);
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use datasource_pool::{ConnectionFactory, PoolConfig, PoolError};
use parking_lot::Mutex;

/// Shared view of one mock connection.
///
/// Stays usable after the connection itself has been moved into a pool, so
/// tests can check whether the pool closed it.
#[derive(Debug, Clone)]
pub struct MockConnectionHandle {
    id: u64,
    valid: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockConnectionHandle {
    /// Factory-assigned serial number of the connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the connection would pass a liveness probe.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire) && !self.is_closed()
    }

    /// Make every further liveness probe on this connection fail.
    pub fn kill(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

/// A fake database session.
#[derive(Debug)]
pub struct MockConnection {
    handle: MockConnectionHandle,
    url: String,
}

impl MockConnection {
    /// Factory-assigned serial number of the connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.handle.id
    }

    /// The URL the connection was opened with.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get a handle that outlives the connection.
    #[must_use]
    pub fn handle(&self) -> MockConnectionHandle {
        self.handle.clone()
    }

    /// Make every further liveness probe on this connection fail.
    pub fn kill(&self) {
        self.handle.kill();
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    next_id: AtomicU64,
    opened: AtomicU32,
    closed: AtomicU32,
    failures_left: AtomicU32,
    connections: Mutex<Vec<MockConnectionHandle>>,
}

/// In-memory [`ConnectionFactory`] for tests.
///
/// Cloning yields another handle to the same factory, so a test can keep one
/// clone for inspection after moving the other into a pool.
#[derive(Debug, Clone, Default)]
pub struct MockFactory {
    state: Arc<FactoryState>,
    open_delay: Option<Duration>,
    probe_delay: Option<Duration>,
    credentials: Option<(String, String)>,
    server_limit: Option<u32>,
}

impl MockFactory {
    /// Create a factory whose opens succeed immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `open`.
    #[must_use]
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Sleep this long inside every liveness probe, ignoring the probe
    /// timeout the way a misbehaving driver would.
    #[must_use]
    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    /// Only accept opens with these credentials.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Refuse opens while `limit` connections are live, like a server at
    /// its connection limit.
    #[must_use]
    pub fn with_server_limit(mut self, limit: u32) -> Self {
        self.server_limit = Some(limit);
        self
    }

    /// Make the next `count` opens fail with [`PoolError::ConnectFailed`].
    pub fn fail_next_opens(&self, count: u32) {
        self.state.failures_left.store(count, Ordering::Release);
    }

    /// Number of connections successfully opened so far.
    #[must_use]
    pub fn opened(&self) -> u32 {
        self.state.opened.load(Ordering::Acquire)
    }

    /// Number of connections closed so far.
    #[must_use]
    pub fn closed(&self) -> u32 {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Number of connections opened and not yet closed.
    #[must_use]
    pub fn live(&self) -> u32 {
        self.opened().saturating_sub(self.closed())
    }

    /// Handles to every connection this factory has opened, oldest first.
    #[must_use]
    pub fn connections(&self) -> Vec<MockConnectionHandle> {
        self.state.connections.lock().clone()
    }

    /// Kill the connection with the given serial number.
    ///
    /// Returns `false` if no such connection was opened.
    pub fn kill(&self, id: u64) -> bool {
        let connections = self.state.connections.lock();
        match connections.iter().find(|handle| handle.id == id) {
            Some(handle) => {
                handle.kill();
                true
            }
            None => false,
        }
    }

    fn take_failure(&self) -> bool {
        self.state
            .failures_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn open(&self, config: &PoolConfig) -> Result<MockConnection, PoolError> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_failure() {
            return Err(PoolError::ConnectFailed(format!(
                "can't connect to {}",
                config.url
            )));
        }
        if self.server_limit.is_some_and(|limit| self.live() >= limit) {
            return Err(PoolError::ConnectFailed("too many connections".into()));
        }
        if let Some((username, password)) = &self.credentials {
            if &config.username != username || &config.password != password {
                return Err(PoolError::ConnectFailed(format!(
                    "access denied for user '{}'",
                    config.username
                )));
            }
        }

        let handle = MockConnectionHandle {
            id: self.state.next_id.fetch_add(1, Ordering::AcqRel) + 1,
            valid: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicBool::new(false)),
        };
        self.state.connections.lock().push(handle.clone());
        self.state.opened.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(connection = handle.id, url = %config.url, "mock connection opened");

        Ok(MockConnection {
            handle,
            url: config.url.clone(),
        })
    }

    async fn is_valid(&self, conn: &mut MockConnection, _timeout: Duration) -> bool {
        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }
        conn.handle.is_valid()
    }

    async fn close(&self, conn: MockConnection) {
        if !conn.handle.closed.swap(true, Ordering::AcqRel) {
            self.state.closed.fetch_add(1, Ordering::AcqRel);
            tracing::trace!(connection = conn.id(), "mock connection closed");
        }
    }
}
