//! Datastore error types.
//!
//! Driver errors are classified once, where they are first observed, into
//! variants that carry their own retry semantics. Callers decide between
//! backing off and aborting with [`Error::is_retryable`] instead of
//! inspecting message text.

use std::io;
use std::path::PathBuf;

use semver::Version;
use thiserror::Error;

use crate::schema::Direction;

/// SQLSTATE raised when the requested database does not exist.
const SQLSTATE_INVALID_CATALOG_NAME: &str = "3D000";

/// SQLSTATE raised when a relation (table) does not exist.
const SQLSTATE_UNDEFINED_TABLE: &str = "42P01";

/// SQLSTATE raised for a serialization failure that the client should retry.
pub(crate) const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// Result alias for datastore operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Datastore errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The server could not be reached at all.
    #[error("datastore unreachable ({target}): {source}")]
    Unreachable {
        /// What was being reached: `host:port` when dialing, the database
        /// when a statement lost its connection.
        target: String,
        /// Underlying driver error.
        #[source]
        source: sqlx::Error,
    },

    /// The logical database has not been created yet.
    #[error("database {database} does not exist")]
    DatabaseMissing {
        /// Name of the missing database.
        database: String,
    },

    /// The database exists but has no schema version table.
    #[error("database {database} is not bootstrapped (no schema_versions table)")]
    NotBootstrapped {
        /// Name of the database.
        database: String,
    },

    /// The stored schema is older than this build requires.
    #[error("database {database} is at schema {current}, at least {required} is required")]
    SchemaOutdated {
        /// Name of the database.
        database: String,
        /// Version found in the database.
        current: Version,
        /// Minimum version this build works with.
        required: Version,
    },

    /// The server version string matched neither backend family.
    #[error("unrecognized backend version string: {0:?}")]
    UnrecognizedBackend(String),

    /// Connect parameters failed validation.
    #[error("invalid connect parameters: {0}")]
    InvalidParameters(String),

    /// A stored schema version could not be parsed.
    #[error("database {database} stores an invalid schema version {value:?}")]
    InvalidStoredVersion {
        /// Name of the database.
        database: String,
        /// Raw stored value.
        value: String,
    },

    /// Listing the migration directory failed.
    #[error("cannot read migration directory {path}: {source}")]
    DirectoryUnreadable {
        /// Directory that was listed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Two files claim the same version and direction.
    #[error("{direction} migration for version {version} is defined twice: {first} and {second}")]
    DuplicateStepFile {
        /// Version both files name.
        version: Version,
        /// Direction both files name.
        direction: Direction,
        /// File seen first.
        first: String,
        /// File seen second.
        second: String,
    },

    /// A migration file name carried a prefix other than `upto`/`downfrom`.
    #[error("migration file {file} has unrecognized prefix {prefix:?}")]
    MalformedStepPrefix {
        /// Offending file name.
        file: String,
        /// Captured prefix.
        prefix: String,
    },

    /// The migration directory contained no migration files.
    #[error("no migrations found in {}", path.display())]
    NoMigrationsFound {
        /// Directory that was scanned.
        path: PathBuf,
    },

    /// The database reports a version that no migration step produces.
    #[error("current schema version {0} is not part of the migration sequence")]
    UnknownCurrentVersion(Version),

    /// The requested version is not part of the migration sequence.
    #[error("target schema version {0} is not part of the migration sequence")]
    UnknownTargetVersion(Version),

    /// A step has no file for the direction the migration must travel.
    #[error("no {direction} migration file registered for version {version}")]
    MissingMigrationFile {
        /// Step version whose file is missing.
        version: Version,
        /// Direction of travel.
        direction: Direction,
    },

    /// A migration file could not be read.
    #[error("cannot read migration file {}: {source}", path.display())]
    ReadMigrationFile {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Executing a migration file failed.
    #[error("migration {file} failed in database {database}: {source}")]
    MigrationFailed {
        /// File that was executed.
        file: String,
        /// Database it ran against.
        database: String,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },

    /// The version read back after a step is not the one the step targets.
    #[error("after running {file}, database {database} reports version {actual}, expected {expected}")]
    VersionMismatch {
        /// File that was executed.
        file: String,
        /// Database that was checked.
        database: String,
        /// Version the step should have produced.
        expected: Version,
        /// Version actually stored.
        actual: Version,
    },

    /// Any other driver error.
    #[error("{context}: {source}")]
    Query {
        /// What was being attempted.
        context: String,
        /// Underlying driver error.
        #[source]
        source: sqlx::Error,
    },
}

impl Error {
    /// Whether the failure is transient and the caller should back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unreachable { .. }
                | Error::DatabaseMissing { .. }
                | Error::NotBootstrapped { .. }
                | Error::SchemaOutdated { .. }
        )
    }

    /// Classify an error raised while dialing `address` for `database`.
    pub fn from_dial(err: sqlx::Error, address: &str, database: &str) -> Self {
        if is_unreachable(&err) {
            return Error::Unreachable {
                target: address.to_string(),
                source: err,
            };
        }
        match sqlstate(&err).as_deref() {
            Some(SQLSTATE_INVALID_CATALOG_NAME) => Error::DatabaseMissing {
                database: database.to_string(),
            },
            _ => Error::Query {
                context: format!("connecting to database {database} at {address}"),
                source: err,
            },
        }
    }

    /// Classify an error raised by a statement run against `database`.
    pub fn from_query(err: sqlx::Error, database: &str, context: impl Into<String>) -> Self {
        if is_unreachable(&err) {
            return Error::Unreachable {
                target: format!("database {database}"),
                source: err,
            };
        }
        match sqlstate(&err).as_deref() {
            Some(SQLSTATE_INVALID_CATALOG_NAME) => Error::DatabaseMissing {
                database: database.to_string(),
            },
            Some(SQLSTATE_UNDEFINED_TABLE) => Error::NotBootstrapped {
                database: database.to_string(),
            },
            _ => Error::Query {
                context: context.into(),
                source: err,
            },
        }
    }
}

/// Extract the SQLSTATE code from a driver error, if it carries one.
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn is_unreachable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(io) => matches!(
            io.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::AddrNotAvailable
                | io::ErrorKind::TimedOut
        ),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}
