//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::pool::PooledConnection;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Pool configuration is invalid.
    #[error("pool configuration error: {0}")]
    ConfigInvalid(String),

    /// The factory could not open a new connection.
    #[error("failed to open connection: {0}")]
    ConnectFailed(String),

    /// Failed to acquire a connection within the timeout.
    #[error("connection acquisition timeout after {0:?}")]
    AcquireTimeout(Duration),

    /// Maximum connections reached and the caller asked not to wait.
    #[error("maximum connections ({max}) reached")]
    PoolExhausted {
        /// Maximum allowed connections.
        max: u32,
    },

    /// A connection was handed back that the pool does not hold on loan.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Pool is closed.
    #[error("pool is closed")]
    PoolClosed,
}

impl PoolError {
    /// Check if this error is transient and the operation may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout(_) | Self::PoolExhausted { .. } | Self::ConnectFailed(_)
        )
    }
}

/// Error returned by [`Pool::release`] and [`Pool::detach`].
///
/// A loan that belongs to another pool is handed back in `conn` so it can
/// still be returned to the pool it came from.
///
/// [`Pool::release`]: crate::Pool::release
/// [`Pool::detach`]: crate::Pool::detach
#[derive(Error)]
#[error("{error}")]
pub struct ReleaseError<C> {
    /// What went wrong.
    pub error: PoolError,
    /// The loan, if the pool did not consume it.
    pub conn: Option<PooledConnection<C>>,
}

impl<C> ReleaseError<C> {
    pub(crate) fn consumed(error: PoolError) -> Self {
        Self { error, conn: None }
    }

    pub(crate) fn rejected(error: PoolError, conn: PooledConnection<C>) -> Self {
        Self {
            error,
            conn: Some(conn),
        }
    }
}

impl<C> std::fmt::Debug for ReleaseError<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseError")
            .field("error", &self.error)
            .field("conn", &self.conn.as_ref().map(PooledConnection::id))
            .finish()
    }
}

impl<C> From<ReleaseError<C>> for PoolError {
    fn from(err: ReleaseError<C>) -> Self {
        err.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(PoolError::AcquireTimeout(Duration::from_millis(10)).is_transient());
        assert!(PoolError::PoolExhausted { max: 2 }.is_transient());
        assert!(PoolError::ConnectFailed("refused".into()).is_transient());
    }

    #[test]
    fn test_non_transient_errors() {
        assert!(!PoolError::PoolClosed.is_transient());
        assert!(!PoolError::ConfigInvalid("bad".into()).is_transient());
        assert!(!PoolError::ProtocolViolation("double release".into()).is_transient());
    }

    #[test]
    fn test_release_error_converts_to_pool_error() {
        let err = ReleaseError::<()>::consumed(PoolError::PoolClosed);
        assert_eq!(err.to_string(), "pool is closed");
        assert!(err.conn.is_none());

        assert!(matches!(PoolError::from(err), PoolError::PoolClosed));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            PoolError::PoolExhausted { max: 3 }.to_string(),
            "maximum connections (3) reached"
        );
        assert_eq!(PoolError::PoolClosed.to_string(), "pool is closed");
        assert_eq!(
            PoolError::AcquireTimeout(Duration::from_millis(50)).to_string(),
            "connection acquisition timeout after 50ms"
        );
    }
}
