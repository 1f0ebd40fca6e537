//! # datasource-testing
//!
//! Test infrastructure for the connection pool.
//!
//! This crate provides an in-memory [`ConnectionFactory`] implementation so
//! pool behavior can be exercised without a database server.
//!
//! ## Features
//!
//! - Mock connections with observable open/closed/valid state
//! - Injected open failures and credential checks
//! - Artificial open and probe latency
//! - Ready-made pool configurations for tests
//!
//! [`ConnectionFactory`]: datasource_pool::ConnectionFactory

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_factory;

pub use fixtures::pool_config;
pub use mock_factory::{MockConnection, MockConnectionHandle, MockFactory};
