//! # datasource-pool
//!
//! A bounded pool of reusable database connections shared by many
//! concurrent tasks.
//!
//! The pool does not know how to talk to any particular database. It is
//! driven by a [`ConnectionFactory`] that opens, probes and closes
//! connections, and it takes care of everything around them.
//!
//! ## Features
//!
//! - Eager creation of `min_connections` at startup, failing loudly if the
//!   database cannot be reached
//! - On-demand growth up to `max_connections`, one connection at a time
//! - Waiting for a released connection with a per-call timeout
//! - Liveness probe on release; dead connections are dropped, not reused
//! - Background sweep evicting dead, expired and long-idle connections and
//!   refilling to the minimum
//! - Shutdown that wakes every waiting caller
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use datasource_pool::{Pool, PoolConfig};
//!
//! let config = PoolConfig::new()
//!     .url("mysql://localhost:3306/test")
//!     .credentials("root", "root")
//!     .min_connections(5)
//!     .max_connections(20);
//!
//! let pool = Pool::new(config, MyFactory::default()).await?;
//! let conn = pool.acquire(Duration::from_secs(3)).await?;
//! // Use connection...
//! pool.release(conn).await?;
//! pool.shutdown().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod reaper;
mod registry;

pub use config::PoolConfig;
pub use error::{PoolError, ReleaseError};
pub use lifecycle::{ConnectionFactory, ConnectionId, ConnectionMetadata};
pub use pool::{Pool, PoolBuilder, PoolStatus, PooledConnection};
pub use reaper::SweepSummary;
