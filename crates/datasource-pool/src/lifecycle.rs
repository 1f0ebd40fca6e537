//! Connection lifecycle management.
//!
//! This module defines the contract the pool uses to open, probe and close
//! physical connections, together with the bookkeeping the pool keeps for
//! every connection it manages.

use std::time::{Duration, Instant};

use crate::config::PoolConfig;
use crate::error::PoolError;

/// Factory for physical database connections.
///
/// The pool never looks inside a connection; everything it needs to know
/// about one goes through this trait. Implementations wrap a concrete
/// database client.
///
/// `#[async_trait]` keeps the returned futures `Send`, which the background
/// sweep needs to run on a spawned task.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The connection type produced by this factory.
    type Connection: Send + 'static;

    /// Open a new connection using the url and credentials in `config`.
    ///
    /// Network and authentication failures are reported as
    /// [`PoolError::ConnectFailed`].
    async fn open(&self, config: &PoolConfig) -> Result<Self::Connection, PoolError>;

    /// Check whether the connection is still usable.
    ///
    /// Must not block for longer than `timeout`.
    async fn is_valid(&self, conn: &mut Self::Connection, timeout: Duration) -> bool;

    /// Close the connection.
    ///
    /// Best effort: failures are logged by the implementation, never returned.
    async fn close(&self, conn: Self::Connection);
}

/// Identifier of a connection, unique within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    /// The raw numeric id.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Metadata about a pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique identifier for this connection.
    pub id: ConnectionId,
    /// When the connection was created.
    pub created_at: Instant,
    /// When the connection was last checked out or returned.
    pub last_used_at: Instant,
    /// When the connection was last health-checked.
    pub last_checked_at: Option<Instant>,
    /// Number of times the connection has been checked out.
    pub checkout_count: u64,
}

impl ConnectionMetadata {
    /// Create metadata for a new connection.
    pub fn new(id: ConnectionId) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            last_checked_at: None,
            checkout_count: 0,
        }
    }

    /// Check if the connection has exceeded its maximum lifetime.
    #[must_use]
    pub fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() > max_lifetime
    }

    /// Check if the connection has been idle too long.
    #[must_use]
    pub fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used_at.elapsed() > idle_timeout
    }

    /// Mark the connection as checked out.
    pub fn mark_checkout(&mut self) {
        self.last_used_at = Instant::now();
        self.checkout_count += 1;
    }

    /// Mark the connection as returned to idle.
    pub fn mark_checkin(&mut self) {
        self.last_used_at = Instant::now();
    }

    /// Mark the connection as health-checked.
    pub fn mark_health_check(&mut self) {
        self.last_checked_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_metadata_new() {
        let meta = ConnectionMetadata::new(ConnectionId(1));
        assert_eq!(meta.id.get(), 1);
        assert_eq!(meta.checkout_count, 0);
        assert!(meta.last_checked_at.is_none());
    }

    #[test]
    fn test_connection_metadata_checkout() {
        let mut meta = ConnectionMetadata::new(ConnectionId(1));
        meta.mark_checkout();
        meta.mark_checkout();

        assert_eq!(meta.checkout_count, 2);
    }

    #[test]
    fn test_connection_metadata_health_check() {
        let mut meta = ConnectionMetadata::new(ConnectionId(1));
        meta.mark_health_check();

        assert!(meta.last_checked_at.is_some());
    }

    #[test]
    fn test_connection_metadata_expiry() {
        let meta = ConnectionMetadata::new(ConnectionId(1));

        assert!(!meta.is_expired(Duration::from_secs(60)));
        assert!(!meta.is_idle_expired(Duration::from_secs(60)));

        std::thread::sleep(Duration::from_millis(5));
        assert!(meta.is_expired(Duration::from_millis(1)));
        assert!(meta.is_idle_expired(Duration::from_millis(1)));
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }
}
