//! Connection parameters.
//!
//! Parameters are built once at process start (usually from [`ConnectArgs`])
//! and handed by reference to everything that dials the datastore.

use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};

use crate::error::{Error, Result};

/// Default datastore host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default datastore port (CockroachDB SQL port).
pub const DEFAULT_PORT: u16 = 26257;

/// Default database used for administrative sessions.
pub const DEFAULT_ADMIN_DATABASE: &str = "postgres";

/// Default application name reported to the server.
pub const DEFAULT_APPLICATION_NAME: &str = "dss";

/// TLS mode for datastore connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SslMode {
    /// Plaintext only.
    Disable,
    /// TLS if the server offers it.
    Prefer,
    /// TLS without certificate verification.
    Require,
    /// TLS, server certificate signed by the configured CA.
    VerifyCa,
    /// TLS, CA and hostname verified.
    VerifyFull,
}

impl SslMode {
    fn to_pg(self) -> PgSslMode {
        match self {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }
}

/// Connection pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSizing {
    /// Upper bound on open connections.
    pub max_open_conns: u32,
    /// Connections kept open while idle.
    pub min_idle_conns: u32,
    /// Maximum lifetime of a connection.
    pub max_conn_lifetime: Option<Duration>,
    /// Idle time after which a connection is closed.
    pub max_conn_idle_time: Option<Duration>,
    /// How long to wait for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolSizing {
    fn default() -> Self {
        Self {
            max_open_conns: 4,
            min_idle_conns: 0,
            max_conn_lifetime: Some(Duration::from_secs(3600)),
            max_conn_idle_time: Some(Duration::from_secs(30)),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything needed to dial the datastore.
#[derive(Debug, Clone)]
pub struct ConnectParameters {
    /// Application name reported to the server.
    pub application_name: String,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Database to connect to.
    pub database: String,
    /// SQL user.
    pub user: String,
    /// Optional password (certificate auth otherwise).
    pub password: Option<String>,
    /// TLS mode.
    pub ssl_mode: SslMode,
    /// Directory holding `ca.crt`, `client.<user>.crt` and `client.<user>.key`.
    pub ssl_dir: Option<PathBuf>,
    /// Pool sizing.
    pub pool: PoolSizing,
    /// Retry budget for serialization failures.
    pub max_retries: u32,
}

impl ConnectParameters {
    /// Create parameters for `host` with defaults for everything else.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            host: host.into(),
            port: DEFAULT_PORT,
            database: DEFAULT_ADMIN_DATABASE.to_string(),
            user: "root".to_string(),
            password: None,
            ssl_mode: SslMode::Disable,
            ssl_dir: None,
            pool: PoolSizing::default(),
            max_retries: 100,
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the application name.
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the user.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set TLS mode and certificate directory.
    pub fn with_ssl(mut self, mode: SslMode, dir: Option<PathBuf>) -> Self {
        self.ssl_mode = mode;
        self.ssl_dir = dir;
        self
    }

    /// Set pool sizing.
    pub fn with_pool(mut self, pool: PoolSizing) -> Self {
        self.pool = pool;
        self
    }

    /// host:port, for logs and error messages.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject parameters that can never produce a working connection.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::InvalidParameters("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(Error::InvalidParameters("port must not be 0".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(Error::InvalidParameters("user must not be empty".to_string()));
        }
        if self.application_name.trim().is_empty() {
            return Err(Error::InvalidParameters(
                "application name must not be empty".to_string(),
            ));
        }
        if self.pool.max_open_conns == 0 {
            return Err(Error::InvalidParameters(
                "max open connections must be at least 1".to_string(),
            ));
        }
        if self.pool.min_idle_conns > self.pool.max_open_conns {
            return Err(Error::InvalidParameters(format!(
                "min idle connections ({}) exceed max open connections ({})",
                self.pool.min_idle_conns, self.pool.max_open_conns
            )));
        }
        if matches!(self.ssl_mode, SslMode::VerifyCa | SslMode::VerifyFull) && self.ssl_dir.is_none() {
            return Err(Error::InvalidParameters(
                "certificate verification requires a certificate directory".to_string(),
            ));
        }
        Ok(())
    }

    /// Driver options for connecting to `database`.
    pub fn connect_options(&self, database: &str) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(database)
            .application_name(&self.application_name)
            .ssl_mode(self.ssl_mode.to_pg());

        if let Some(password) = &self.password {
            options = options.password(password);
        }

        if let Some(dir) = &self.ssl_dir {
            options = options
                .ssl_root_cert(dir.join("ca.crt"))
                .ssl_client_cert(dir.join(format!("client.{}.crt", self.user)))
                .ssl_client_key(dir.join(format!("client.{}.key", self.user)));
        }

        options
    }

    /// Pool options derived from the sizing parameters.
    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.pool.max_open_conns)
            .min_connections(self.pool.min_idle_conns)
            .max_lifetime(self.pool.max_conn_lifetime)
            .idle_timeout(self.pool.max_conn_idle_time)
            .acquire_timeout(self.pool.acquire_timeout)
    }
}

impl Default for ConnectParameters {
    fn default() -> Self {
        Self::new(DEFAULT_HOST)
    }
}

/// Command-line flags describing the datastore connection.
#[derive(clap::Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Datastore host.
    #[arg(long = "datastore-host", env = "DSS_DATASTORE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Datastore port.
    #[arg(long = "datastore-port", env = "DSS_DATASTORE_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Database for administrative sessions.
    #[arg(long = "datastore-db", default_value = DEFAULT_ADMIN_DATABASE)]
    pub database: String,

    /// SQL user.
    #[arg(long = "datastore-user", env = "DSS_DATASTORE_USER", default_value = "root")]
    pub user: String,

    /// SQL password (certificate authentication when unset).
    #[arg(long = "datastore-password", env = "DSS_DATASTORE_PASSWORD")]
    pub password: Option<String>,

    /// Application name reported to the server.
    #[arg(long = "datastore-application-name", default_value = DEFAULT_APPLICATION_NAME)]
    pub application_name: String,

    /// TLS mode.
    #[arg(long = "datastore-ssl-mode", value_enum, default_value = "disable")]
    pub ssl_mode: SslMode,

    /// Directory with ca.crt and client.<user>.{crt,key}.
    #[arg(long = "datastore-ssl-dir")]
    pub ssl_dir: Option<PathBuf>,

    /// Maximum open connections per pool.
    #[arg(long = "max-open-conns", default_value_t = 4)]
    pub max_open_conns: u32,

    /// Idle connections kept per pool.
    #[arg(long = "min-idle-conns", default_value_t = 0)]
    pub min_idle_conns: u32,

    /// Maximum connection lifetime in seconds (0 = unlimited).
    #[arg(long = "max-conn-lifetime-secs", default_value_t = 3600)]
    pub max_conn_lifetime_secs: u64,

    /// Maximum connection idle time in seconds (0 = unlimited).
    #[arg(long = "max-conn-idle-secs", default_value_t = 30)]
    pub max_conn_idle_secs: u64,

    /// Transaction retry budget for serialization failures.
    #[arg(long = "max-retries", default_value_t = 100)]
    pub max_retries: u32,
}

impl ConnectArgs {
    /// Convert flags into validated connection parameters.
    pub fn into_parameters(self) -> Result<ConnectParameters> {
        let nonzero = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

        let params = ConnectParameters {
            application_name: self.application_name,
            host: self.host,
            port: self.port,
            database: self.database,
            user: self.user,
            password: self.password,
            ssl_mode: self.ssl_mode,
            ssl_dir: self.ssl_dir,
            pool: PoolSizing {
                max_open_conns: self.max_open_conns,
                min_idle_conns: self.min_idle_conns,
                max_conn_lifetime: nonzero(self.max_conn_lifetime_secs),
                max_conn_idle_time: nonzero(self.max_conn_idle_secs),
                ..PoolSizing::default()
            },
            max_retries: self.max_retries,
        };
        params.validate()?;
        Ok(params)
    }
}
