//! Test fixture utilities.

use std::time::Duration;

use datasource_pool::PoolConfig;

/// URL used by fixture configurations.
pub const TEST_URL: &str = "mock://localhost:3306/test";

/// A pool configuration sized for tests.
///
/// Short acquire and probe timeouts keep failing tests fast, and the
/// background sweep is pushed out far enough that it never interferes;
/// tests that want a sweep call `Pool::run_health_check` themselves.
#[must_use]
pub fn pool_config(min: u32, max: u32) -> PoolConfig {
    PoolConfig::new()
        .url(TEST_URL)
        .credentials("root", "root")
        .min_connections(min)
        .max_connections(max)
        .connection_timeout(Duration::from_millis(200))
        .validation_timeout(Duration::from_millis(100))
        .health_check_interval(Duration::from_secs(3600))
}
