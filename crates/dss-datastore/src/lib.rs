//! DSS datastore library.
//!
//! This crate owns everything the service and its administrative tools need
//! to reach and evolve the replicated SQL store: backend detection,
//! connection parameters, pooled stores, and the schema migration engine.

pub mod error;
pub mod params;
pub mod schema;
pub mod sql;
pub mod store;
pub mod version;

pub use error::{Error, Result};
pub use params::{ConnectArgs, ConnectParameters, PoolSizing, SslMode};
pub use schema::{enumerate_steps, migrate, MigrationOutcome, MigrationSession, MigrationStep, SqlRunner};
pub use sql::SchemaState;
pub use store::{PoolStats, Store};
pub use version::{BackendFamily, BackendVersion};
