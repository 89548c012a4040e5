//! qcgrid domain core.
//!
//! Pure value types and logic for the record execution engine: status
//! lifecycles, canonical hashing, specifications, molecules, output
//! compression, result payloads, service state machines, and the port
//! traits implemented by `qcgrid_postgres`. No sqlx here.

pub mod compression;
pub mod error;
pub mod hashing;
pub mod molecule;
pub mod ports;
pub mod proto;
pub mod record;
pub mod results;
pub mod services;
pub mod specification;
pub mod types;

pub use error::QcGridError;
