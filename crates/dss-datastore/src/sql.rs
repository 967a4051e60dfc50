//! Statements shared by pooled stores and migration sessions.

use semver::Version;
use sqlx::PgConnection;

use crate::error::{Error, Result};
use crate::version::BackendFamily;

/// Name of the single-row table that records the schema version.
pub const SCHEMA_VERSION_TABLE: &str = "schema_versions";

/// Observed schema state of one logical database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaState {
    /// The database itself does not exist.
    Missing,
    /// The database exists but has never been migrated.
    Unbootstrapped,
    /// The database records this schema version.
    Bootstrapped(Version),
}

impl SchemaState {
    /// Version recorded in the database, if any.
    pub fn version(&self) -> Option<&Version> {
        match self {
            SchemaState::Bootstrapped(version) => Some(version),
            _ => None,
        }
    }
}

impl std::fmt::Display for SchemaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaState::Missing => write!(f, "database missing"),
            SchemaState::Unbootstrapped => write!(f, "unbootstrapped"),
            SchemaState::Bootstrapped(version) => write!(f, "v{version}"),
        }
    }
}

/// Quote an identifier for interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Parse a stored schema version such as `v3.1.0` or `3.1.0`.
pub fn parse_stored_version(database: &str, raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    Version::parse(trimmed.strip_prefix('v').unwrap_or(trimmed)).map_err(|_| {
        Error::InvalidStoredVersion {
            database: database.to_string(),
            value: raw.to_string(),
        }
    })
}

/// Whether `database` exists on the cluster.
pub async fn database_exists(conn: &mut PgConnection, database: &str) -> Result<bool> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(database)
        .fetch_one(conn)
        .await
        .map_err(|e| Error::from_query(e, database, "checking database existence"))
}

/// Create `database`. Callers check [`database_exists`] first since
/// YugabyteDB has no `IF NOT EXISTS` form.
pub async fn create_database(conn: &mut PgConnection, database: &str) -> Result<()> {
    let statement = format!("CREATE DATABASE {}", quote_ident(database));
    sqlx::raw_sql(&statement)
        .execute(conn)
        .await
        .map_err(|e| Error::from_query(e, database, format!("creating database {database}")))?;
    Ok(())
}

/// Read the schema state of `database`.
///
/// On CockroachDB any session can inspect any database through qualified
/// names. YugabyteDB cannot query across databases, so `conn` must already
/// be connected to `database`.
pub async fn read_schema_state(
    conn: &mut PgConnection,
    family: BackendFamily,
    database: &str,
) -> Result<SchemaState> {
    if !database_exists(&mut *conn, database).await? {
        return Ok(SchemaState::Missing);
    }

    let (exists_query, version_query) = match family {
        BackendFamily::Cockroach => {
            let db = quote_ident(database);
            (
                format!(
                    "SELECT EXISTS (SELECT 1 FROM {db}.information_schema.tables WHERE table_name = '{SCHEMA_VERSION_TABLE}')"
                ),
                format!(
                    "SELECT schema_version FROM {db}.{SCHEMA_VERSION_TABLE} WHERE onerow_enforcer = TRUE"
                ),
            )
        }
        BackendFamily::Yugabyte => (
            format!(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_schema = 'public' AND table_name = '{SCHEMA_VERSION_TABLE}')"
            ),
            format!("SELECT schema_version FROM {SCHEMA_VERSION_TABLE} WHERE onerow_enforcer = TRUE"),
        ),
    };

    let has_table = sqlx::query_scalar::<_, bool>(&exists_query)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| Error::from_query(e, database, "checking schema version table"))?;
    if !has_table {
        return Ok(SchemaState::Unbootstrapped);
    }

    let raw = sqlx::query_scalar::<_, String>(&version_query)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| Error::from_query(e, database, "reading schema version"))?;

    match raw {
        Some(raw) => Ok(SchemaState::Bootstrapped(parse_stored_version(database, &raw)?)),
        None => Ok(SchemaState::Unbootstrapped),
    }
}
