//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Default minimum number of connections kept open.
pub const DEFAULT_MIN_CONNECTIONS: u32 = 10;

/// Default maximum number of connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 50;

/// Default time a caller waits for a connection.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(3000);

/// Configuration for the connection pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Connection URL handed to the factory.
    pub url: String,

    /// Username handed to the factory.
    pub username: String,

    /// Password handed to the factory. Never printed by `Debug`.
    pub password: String,

    /// Minimum number of connections to maintain.
    pub min_connections: u32,

    /// Maximum number of connections allowed.
    pub max_connections: u32,

    /// Time to wait for a connection before timing out.
    pub connection_timeout: Duration,

    /// Upper bound on a single liveness probe.
    pub validation_timeout: Duration,

    /// Interval between background sweeps of idle connections.
    pub health_check_interval: Duration,

    /// Time a connection can be idle before being closed, while the pool
    /// is above its minimum size.
    pub idle_timeout: Option<Duration>,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Option<Duration>,

    /// Whether to probe connections when they are released.
    pub test_on_checkin: bool,

    /// Whether the background sweep reopens connections to get back to
    /// `min_connections`.
    pub refill: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            validation_timeout: Duration::from_secs(3),
            health_check_interval: Duration::from_secs(10),
            idle_timeout: None,
            max_lifetime: None,
            test_on_checkin: true,
            refill: true,
        }
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("connection_timeout", &self.connection_timeout)
            .field("validation_timeout", &self.validation_timeout)
            .field("health_check_interval", &self.health_check_interval)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_lifetime", &self.max_lifetime)
            .field("test_on_checkin", &self.test_on_checkin)
            .field("refill", &self.refill)
            .finish()
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the username and password used to open connections.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the liveness probe timeout.
    #[must_use]
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Set the health check interval.
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.idle_timeout = timeout.into();
        self
    }

    /// Set the maximum connection lifetime.
    #[must_use]
    pub fn max_lifetime(mut self, lifetime: impl Into<Option<Duration>>) -> Self {
        self.max_lifetime = lifetime.into();
        self
    }

    /// Enable or disable probing connections on release.
    #[must_use]
    pub fn test_on_checkin(mut self, enabled: bool) -> Self {
        self.test_on_checkin = enabled;
        self
    }

    /// Enable or disable refilling to the minimum size after evictions.
    #[must_use]
    pub fn refill(mut self, enabled: bool) -> Self {
        self.refill = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::ConfigInvalid(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::ConfigInvalid(
                "min_connections cannot be greater than max_connections".into(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::ConfigInvalid(
                "health_check_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.min_connections, 10);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.connection_timeout, Duration::from_millis(3000));
        assert!(config.test_on_checkin);
        assert!(config.refill);
        assert!(config.idle_timeout.is_none());
        assert!(config.max_lifetime.is_none());
    }

    #[test]
    fn test_config_builder_methods() {
        let config = PoolConfig::new()
            .url("mysql://localhost:3306/test")
            .credentials("root", "secret")
            .min_connections(5)
            .max_connections(20)
            .connection_timeout(Duration::from_secs(60))
            .validation_timeout(Duration::from_millis(250))
            .health_check_interval(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(120))
            .max_lifetime(Duration::from_secs(3600))
            .test_on_checkin(false)
            .refill(false);

        assert_eq!(config.url, "mysql://localhost:3306/test");
        assert_eq!(config.username, "root");
        assert_eq!(config.password, "secret");
        assert_eq!(config.min_connections, 5);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.connection_timeout, Duration::from_secs(60));
        assert_eq!(config.validation_timeout, Duration::from_millis(250));
        assert_eq!(config.health_check_interval, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.max_lifetime, Some(Duration::from_secs(3600)));
        assert!(!config.test_on_checkin);
        assert!(!config.refill);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = PoolConfig::new().credentials("root", "hunter2");
        let debug = format!("{config:?}");

        assert!(debug.contains("root"));
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_config_validation_success() {
        let config = PoolConfig::new().min_connections(1).max_connections(10);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_min_greater_than_max() {
        let config = PoolConfig::new().min_connections(20).max_connections(10);

        let result = config.validate();
        assert!(matches!(result, Err(PoolError::ConfigInvalid(_))));
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("min_connections cannot be greater than max_connections")
        );
    }

    #[test]
    fn test_config_validation_zero_max() {
        let config = PoolConfig::new().min_connections(0).max_connections(0);

        let result = config.validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("max_connections must be greater than 0")
        );
    }

    #[test]
    fn test_config_validation_zero_interval() {
        let config = PoolConfig::new().health_check_interval(Duration::ZERO);

        assert!(matches!(
            config.validate(),
            Err(PoolError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_config_equal_min_max() {
        let config = PoolConfig::new().min_connections(5).max_connections(5);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_zero_min() {
        let config = PoolConfig::new().min_connections(0).max_connections(1);

        assert!(config.validate().is_ok());
    }
}
