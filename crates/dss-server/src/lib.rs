//! DSS server library.
//!
//! Brings up the datastore stores the service runs against, retries startup
//! while the datastore is still being provisioned, runs per-store background
//! jobs, and answers health probes until shutdown.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod health;
pub mod jobs;
pub mod schedule;
pub mod service;

pub use bootstrap::{connect_with_fallback, Service, StoreHandle, StoreKind};
pub use config::{Args, ServerConfig};
pub use error::Error;
pub use jobs::{CleanupJob, ExpiredRecordCleanup, JobCounters, JobScheduler, PoolStatsSource};
pub use schedule::{BackoffSchedule, Schedule};
pub use service::{run, run_with_backoff, serve};
