//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use dss_datastore::{ConnectArgs, ConnectParameters};

use crate::bootstrap::StoreKind;
use crate::error::Error;
use crate::schedule::{parse_duration, BackoffSchedule, Schedule, DEFAULT_STARTUP_BACKOFF};

/// Default health listener address.
pub const DEFAULT_ADDR: &str = "0.0.0.0:8082";

/// Default schedule for the expired-record cleanup job.
pub const DEFAULT_CLEANUP_SCHEDULE: &str = "@every 30m";

/// Default interval between pool statistics reports in seconds.
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 30;

/// Default time allowed for in-flight work on shutdown in seconds.
pub const DEFAULT_SHUTDOWN_DRAIN_SECS: u64 = 10;

/// DSS server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the health listener binds to.
    pub addr: String,

    /// Datastore connection parameters shared by every store.
    pub connect: ConnectParameters,

    /// Whether the conflict detection store is brought up.
    pub enable_scd: bool,

    /// Identity of this instance. When set, cleanup only touches records
    /// written by this instance.
    pub locality: Option<String>,

    /// File created once the service is listening.
    pub ready_file: Option<PathBuf>,

    /// Delays between failed startup attempts.
    pub startup_backoff: BackoffSchedule,

    /// When the expired-record cleanup runs.
    pub cleanup_schedule: Schedule,

    /// Interval between pool statistics reports.
    pub stats_interval: Duration,

    /// Upper bound on waiting for in-flight work at shutdown.
    pub shutdown_drain: Duration,
}

impl ServerConfig {
    /// Create a configuration dialing with `connect` and default settings.
    pub fn new(connect: ConnectParameters) -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            connect,
            enable_scd: false,
            locality: None,
            ready_file: None,
            startup_backoff: BackoffSchedule::default(),
            cleanup_schedule: Schedule::Every(Duration::from_secs(30 * 60)),
            stats_interval: Duration::from_secs(DEFAULT_STATS_INTERVAL_SECS),
            shutdown_drain: Duration::from_secs(DEFAULT_SHUTDOWN_DRAIN_SECS),
        }
    }

    /// Set the listener address.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Bring up the conflict detection store as well.
    pub fn with_scd(mut self, enabled: bool) -> Self {
        self.enable_scd = enabled;
        self
    }

    /// Set the instance locality.
    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = Some(locality.into());
        self
    }

    /// Set the ready file path.
    pub fn with_ready_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ready_file = Some(path.into());
        self
    }

    /// Set the startup backoff schedule.
    pub fn with_startup_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.startup_backoff = backoff;
        self
    }

    /// Set the cleanup schedule.
    pub fn with_cleanup_schedule(mut self, schedule: Schedule) -> Self {
        self.cleanup_schedule = schedule;
        self
    }

    /// Set the statistics report interval.
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Set the shutdown drain timeout.
    pub fn with_shutdown_drain(mut self, drain: Duration) -> Self {
        self.shutdown_drain = drain;
        self
    }

    /// Stores to bring up, in order.
    pub fn store_kinds(&self) -> Vec<StoreKind> {
        let mut kinds = vec![StoreKind::RemoteId];
        if self.enable_scd {
            kinds.push(StoreKind::ConflictDetection);
        }
        kinds
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(ConnectParameters::default())
    }
}

/// Command-line arguments for the DSS server.
#[derive(Debug, Parser)]
#[command(name = "dss-server")]
#[command(about = "DSS datastore bootstrap service")]
#[command(version)]
pub struct Args {
    /// Address for the health listener.
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub addr: String,

    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Also bring up the strategic conflict detection store.
    #[arg(long)]
    pub enable_scd: bool,

    /// Identity of this instance, recorded as the writer of its records.
    #[arg(long, env = "DSS_LOCALITY")]
    pub locality: Option<String>,

    /// File to create once the service is listening.
    #[arg(long)]
    pub ready_file: Option<PathBuf>,

    /// Comma-separated delays between failed startup attempts; the last one repeats.
    #[arg(long, default_value = DEFAULT_STARTUP_BACKOFF)]
    pub startup_backoff: String,

    /// Cleanup schedule: `@every <duration>` or a cron expression.
    #[arg(long, default_value = DEFAULT_CLEANUP_SCHEDULE)]
    pub garbage_collector_spec: String,

    /// Interval between connection pool statistics reports.
    #[arg(long, default_value = "30s")]
    pub stats_interval: String,

    /// Maximum time to wait for in-flight work on shutdown.
    #[arg(long, default_value = "10s")]
    pub shutdown_drain: String,
}

impl Args {
    /// Convert arguments into a validated server configuration.
    pub fn into_config(self) -> Result<ServerConfig, Error> {
        let connect = self.connect.into_parameters()?;

        let stats_interval = parse_duration(&self.stats_interval)?;
        if stats_interval.is_zero() {
            return Err(Error::Config("stats interval must be positive".to_string()));
        }

        let mut config = ServerConfig::new(connect)
            .with_addr(self.addr)
            .with_scd(self.enable_scd)
            .with_startup_backoff(self.startup_backoff.parse()?)
            .with_cleanup_schedule(self.garbage_collector_spec.parse()?)
            .with_stats_interval(stats_interval)
            .with_shutdown_drain(parse_duration(&self.shutdown_drain)?);

        if let Some(locality) = self.locality.filter(|l| !l.is_empty()) {
            config = config.with_locality(locality);
        }
        if let Some(path) = self.ready_file {
            config = config.with_ready_file(path);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("dss-server").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert!(!config.enable_scd);
        assert_eq!(config.startup_backoff, BackoffSchedule::default());
        assert_eq!(config.shutdown_drain, Duration::from_secs(10));
        assert_eq!(config.store_kinds(), vec![StoreKind::RemoteId]);
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::default()
            .with_addr("127.0.0.1:9090")
            .with_scd(true)
            .with_locality("us-east")
            .with_ready_file("/tmp/ready")
            .with_stats_interval(Duration::from_secs(5));

        assert_eq!(config.addr, "127.0.0.1:9090");
        assert_eq!(config.locality.as_deref(), Some("us-east"));
        assert_eq!(config.ready_file, Some(PathBuf::from("/tmp/ready")));
        assert_eq!(config.stats_interval, Duration::from_secs(5));
        assert_eq!(
            config.store_kinds(),
            vec![StoreKind::RemoteId, StoreKind::ConflictDetection]
        );
    }

    #[test]
    fn test_args_defaults() {
        let config = parse(&[]).into_config().unwrap();
        assert_eq!(config.addr, DEFAULT_ADDR);
        assert_eq!(config.connect.port, 26257);
        assert!(matches!(
            config.cleanup_schedule,
            Schedule::Every(period) if period == Duration::from_secs(1800)
        ));
        assert_eq!(config.stats_interval, Duration::from_secs(30));
        assert!(config.locality.is_none());
    }

    #[test]
    fn test_args_overrides() {
        let config = parse(&[
            "--enable-scd",
            "--locality",
            "eu-west",
            "--startup-backoff",
            "1s,2s",
            "--garbage-collector-spec",
            "0 0 * * * *",
            "--shutdown-drain",
            "500ms",
            "--ready-file",
            "/run/dss/ready",
        ])
        .into_config()
        .unwrap();

        assert!(config.enable_scd);
        assert_eq!(config.locality.as_deref(), Some("eu-west"));
        assert_eq!(
            config.startup_backoff.delays(),
            &[Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert!(matches!(config.cleanup_schedule, Schedule::Cron(_)));
        assert_eq!(config.shutdown_drain, Duration::from_millis(500));
        assert_eq!(config.ready_file, Some(PathBuf::from("/run/dss/ready")));
    }

    #[test]
    fn test_args_rejects_bad_values() {
        assert!(parse(&["--startup-backoff", "soon"]).into_config().is_err());
        assert!(parse(&["--garbage-collector-spec", "whenever"]).into_config().is_err());
        assert!(parse(&["--stats-interval", "0s"]).into_config().is_err());
        assert!(matches!(
            parse(&["--max-open-conns", "0"]).into_config(),
            Err(Error::Datastore(dss_datastore::Error::InvalidParameters(_)))
        ));
    }
}
