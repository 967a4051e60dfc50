//! Pooled connection to one logical database.

use semver::Version;
use sqlx::postgres::{PgArguments, PgPool};
use sqlx::query::Query;
use sqlx::Postgres;
use tracing::{debug, info};

use crate::error::{sqlstate, Error, Result, SQLSTATE_SERIALIZATION_FAILURE};
use crate::params::ConnectParameters;
use crate::sql::{self, SchemaState};
use crate::version::BackendVersion;

/// Snapshot of connection pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Connections currently open.
    pub total: u32,
    /// Open connections not checked out.
    pub idle: u32,
    /// Connections checked out.
    pub active: u32,
}

impl PoolStats {
    /// Build a snapshot from total and idle counts.
    pub fn new(total: u32, idle: u32) -> Self {
        Self {
            total,
            idle,
            active: total.saturating_sub(idle),
        }
    }
}

/// A connection pool bound to one database, with its detected backend.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    database: String,
    backend: BackendVersion,
    max_retries: u32,
}

impl Store {
    /// Dial `database` and classify the server behind it.
    pub async fn dial(params: &ConnectParameters, database: &str) -> Result<Self> {
        params.validate()?;
        let address = params.address();

        let pool = params
            .pool_options()
            .connect_with(params.connect_options(database))
            .await
            .map_err(|e| Error::from_dial(e, &address, database))?;

        let raw = match sqlx::query_scalar::<_, String>("SELECT version()")
            .fetch_one(&pool)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                pool.close().await;
                return Err(Error::from_query(e, database, "reading server version"));
            }
        };

        let backend = match BackendVersion::detect(&raw) {
            Ok(backend) => backend,
            Err(e) => {
                pool.close().await;
                return Err(e);
            }
        };

        info!(
            address = %address,
            database,
            backend = %backend,
            "datastore connection established"
        );

        Ok(Self {
            pool,
            database: database.to_string(),
            backend,
            max_retries: params.max_retries,
        })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Database this store is bound to.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Backend detected at dial time.
    pub fn backend(&self) -> &BackendVersion {
        &self.backend
    }

    /// Current pool usage.
    pub fn pool_stats(&self) -> PoolStats {
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX);
        PoolStats::new(self.pool.size(), idle)
    }

    /// Read the schema state of this store's database.
    pub async fn schema_state(&self) -> Result<SchemaState> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| Error::from_query(e, &self.database, "acquiring connection"))?;
        sql::read_schema_state(&mut conn, self.backend.family, &self.database).await
    }

    /// Fail unless the database is bootstrapped at `minimum` or later.
    pub async fn require_schema(&self, minimum: &Version) -> Result<Version> {
        match self.schema_state().await? {
            SchemaState::Missing => Err(Error::DatabaseMissing {
                database: self.database.clone(),
            }),
            SchemaState::Unbootstrapped => Err(Error::NotBootstrapped {
                database: self.database.clone(),
            }),
            SchemaState::Bootstrapped(current) if current < *minimum => Err(Error::SchemaOutdated {
                database: self.database.clone(),
                current,
                required: minimum.clone(),
            }),
            SchemaState::Bootstrapped(current) => Ok(current),
        }
    }

    /// Execute a statement, retrying serialization failures within the
    /// retry budget. `build` is called once per attempt.
    pub async fn execute_with_retry<'q, F>(&self, context: &str, build: F) -> Result<u64>
    where
        F: Fn() -> Query<'q, Postgres, PgArguments>,
    {
        let mut attempt = 0;
        loop {
            match build().execute(&self.pool).await {
                Ok(done) => return Ok(done.rows_affected()),
                Err(e)
                    if attempt < self.max_retries
                        && sqlstate(&e).as_deref() == Some(SQLSTATE_SERIALIZATION_FAILURE) =>
                {
                    attempt += 1;
                    debug!(database = %self.database, context, attempt, "retrying after serialization failure");
                }
                Err(e) => return Err(Error::from_query(e, &self.database, context)),
            }
        }
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
        info!(database = %self.database, "datastore connection closed");
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("database", &self.database)
            .field("backend", &self.backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::new(5, 2);
        assert_eq!(stats.active, 3);

        let empty = PoolStats::new(0, 0);
        assert_eq!(empty, PoolStats::default());
    }
}
