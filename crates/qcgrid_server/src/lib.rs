//! qcgrid REST server library.
//!
//! The binary in main.rs wires config, pool, schema, the internal job
//! runner, and the router together; everything is exported here so
//! integration tests can build the same app against a test database.

pub mod config;
pub mod error;
pub mod handlers;
pub mod payload;
pub mod router;
pub mod runner;
pub mod state;
