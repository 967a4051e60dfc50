//! Live migration session over a single connection.
//!
//! A dedicated connection is used rather than a pool because `USE` and the
//! batch-transaction setting are session state.

use async_trait::async_trait;
use semver::Version;
use sqlx::{Connection, Executor, PgConnection};
use tracing::{debug, info};

use super::executor::SqlRunner;
use crate::error::{Error, Result};
use crate::params::ConnectParameters;
use crate::sql::{self, SchemaState};
use crate::version::BackendVersion;

/// An administrative session used to inspect and migrate schemas.
pub struct MigrationSession {
    params: ConnectParameters,
    conn: PgConnection,
    connected_to: String,
    backend: BackendVersion,
}

impl MigrationSession {
    /// Connect to the administrative database named in `params`.
    pub async fn open(params: &ConnectParameters) -> Result<Self> {
        params.validate()?;
        let mut conn = connect(params, &params.database).await?;

        let raw = sqlx::query_scalar::<_, String>("SELECT version()")
            .fetch_one(&mut conn)
            .await
            .map_err(|e| Error::from_query(e, &params.database, "reading server version"))?;
        let backend = BackendVersion::detect(&raw)?;

        info!(
            address = %params.address(),
            backend = %backend,
            "migration session opened"
        );

        Ok(Self {
            params: params.clone(),
            conn,
            connected_to: params.database.clone(),
            backend,
        })
    }

    /// Backend detected when the session opened.
    pub fn backend(&self) -> &BackendVersion {
        &self.backend
    }

    /// Whether `database` exists.
    pub async fn database_exists(&mut self, database: &str) -> Result<bool> {
        sql::database_exists(&mut self.conn, database).await
    }

    /// Create `database` unless it already exists. Returns whether it was created.
    pub async fn ensure_database(&mut self, database: &str) -> Result<bool> {
        if self.database_exists(database).await? {
            return Ok(false);
        }
        sql::create_database(&mut self.conn, database).await?;
        info!(database, "database created");
        Ok(true)
    }

    /// Schema state of `database`.
    pub async fn schema_state(&mut self, database: &str) -> Result<SchemaState> {
        if !self.database_exists(database).await? {
            return Ok(SchemaState::Missing);
        }
        self.scope_to(database).await?;
        sql::read_schema_state(&mut self.conn, self.backend.family, database).await
    }

    /// Close the session.
    pub async fn close(self) -> Result<()> {
        let database = self.connected_to;
        self.conn
            .close()
            .await
            .map_err(|e| Error::from_query(e, &database, "closing migration session"))
    }

    /// YugabyteDB cannot address other databases from a session, so the
    /// session reconnects when the target database changes.
    async fn scope_to(&mut self, database: &str) -> Result<()> {
        if self.backend.is_cockroach() || self.connected_to == database {
            return Ok(());
        }
        debug!(from = %self.connected_to, to = database, "reconnecting migration session");
        let conn = connect(&self.params, database).await?;
        let previous = std::mem::replace(&mut self.conn, conn);
        if let Err(e) = previous.close().await {
            debug!(error = %e, "closing previous migration connection failed");
        }
        self.connected_to = database.to_string();
        Ok(())
    }
}

#[async_trait]
impl SqlRunner for MigrationSession {
    fn backend(&self) -> &BackendVersion {
        &self.backend
    }

    async fn execute_script(&mut self, database: &str, script: &str) -> Result<()> {
        self.scope_to(database).await?;
        (&mut self.conn)
            .execute(sqlx::raw_sql(script))
            .await
            .map_err(|e| Error::from_query(e, database, "executing migration script"))?;
        Ok(())
    }

    async fn schema_version(&mut self, database: &str) -> Result<Option<Version>> {
        match self.schema_state(database).await? {
            SchemaState::Missing => Err(Error::DatabaseMissing {
                database: database.to_string(),
            }),
            SchemaState::Unbootstrapped => Ok(None),
            SchemaState::Bootstrapped(version) => Ok(Some(version)),
        }
    }
}

async fn connect(params: &ConnectParameters, database: &str) -> Result<PgConnection> {
    PgConnection::connect_with(&params.connect_options(database))
        .await
        .map_err(|e| Error::from_dial(e, &params.address(), database))
}
