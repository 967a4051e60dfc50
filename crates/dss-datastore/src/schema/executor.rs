//! Migration executor.
//!
//! Walks a database one step at a time from its current schema version to a
//! target version, verifying the stored version after every step. Nothing
//! is retried: a failed or unverifiable step stops the walk and leaves the
//! database at the last verified version for an operator to inspect.
//!
//! Concurrent runs against the same database are not guarded against here;
//! operators must serialize migration invocations.

use std::path::Path;

use async_trait::async_trait;
use semver::Version;
use tracing::{info, warn};

use super::index::{MigrationStep, ORIGIN_VERSION};
use super::Direction;
use crate::error::{Error, Result};
use crate::sql::quote_ident;
use crate::version::BackendVersion;

/// Name the remote ID database had before schema 4.0.0.
pub const LEGACY_RID_DATABASE: &str = "defaultdb";

/// Name of the remote ID database from schema 4.0.0 onward.
pub const RID_DATABASE: &str = "rid";

/// Schema version whose `upto` file moves remote ID data from
/// `defaultdb` into `rid`.
pub const RID_RENAME_VERSION: Version = Version::new(4, 0, 0);

/// SQL access needed to migrate a database.
#[async_trait]
pub trait SqlRunner: Send {
    /// Backend the runner is connected to.
    fn backend(&self) -> &BackendVersion;

    /// Execute a multi-statement script in the context of `database`.
    async fn execute_script(&mut self, database: &str, script: &str) -> Result<()>;

    /// Stored schema version of `database`, or `None` when it has no
    /// schema version table.
    async fn schema_version(&mut self, database: &str) -> Result<Option<Version>>;
}

/// Where a migration run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Final verified schema version.
    pub version: Version,
    /// Database the schema now lives in.
    pub database: String,
    /// Number of files executed.
    pub steps_applied: usize,
}

/// Migrate `database` from `current` to `target` through `steps`.
///
/// `steps` must come from [`enumerate_steps`](super::enumerate_steps):
/// ascending and starting at the origin. Migrating to the current version
/// runs nothing.
pub async fn migrate<R>(
    current: &Version,
    target: &Version,
    steps: &[MigrationStep],
    database: &str,
    runner: &mut R,
) -> Result<MigrationOutcome>
where
    R: SqlRunner + ?Sized,
{
    let mut position = position_of(steps, current)
        .ok_or_else(|| Error::UnknownCurrentVersion(current.clone()))?;
    let destination = position_of(steps, target)
        .ok_or_else(|| Error::UnknownTargetVersion(target.clone()))?;

    let mut database = database.to_string();
    let mut steps_applied = 0;

    while position != destination {
        let (direction, from, to) = if destination > position {
            (Direction::Up, &steps[position], &steps[position + 1])
        } else {
            (Direction::Down, &steps[position], &steps[position - 1])
        };

        let file = match direction {
            Direction::Up => to.up_file.as_deref(),
            Direction::Down => from.down_file.as_deref(),
        };
        let Some(file) = file else {
            let version = match direction {
                Direction::Up => to.version.clone(),
                Direction::Down => from.version.clone(),
            };
            return Err(Error::MissingMigrationFile { version, direction });
        };
        let file_name = display_name(file);

        info!(
            file = %file_name,
            database = %database,
            from = %from.version,
            to = %to.version,
            %direction,
            "running migration"
        );

        let body = tokio::fs::read_to_string(file)
            .await
            .map_err(|source| Error::ReadMigrationFile {
                path: file.to_path_buf(),
                source,
            })?;
        let script = compose_script(runner.backend(), &database, &body);

        runner
            .execute_script(&database, &script)
            .await
            .map_err(|source| Error::MigrationFailed {
                file: file_name.clone(),
                database: database.clone(),
                source: Box::new(source),
            })?;

        if let Some(renamed) = renamed_database(direction, &from.version, &to.version, &database) {
            info!(from = %database, to = renamed, "remote ID database renamed by migration");
            database = renamed.to_string();
        }

        // Origin has no version table; the first `downfrom` file drops it.
        let actual = runner
            .schema_version(&database)
            .await?
            .unwrap_or(ORIGIN_VERSION);
        if actual != to.version {
            warn!(
                file = %file_name,
                database = %database,
                expected = %to.version,
                actual = %actual,
                "schema version mismatch after migration"
            );
            return Err(Error::VersionMismatch {
                file: file_name,
                database,
                expected: to.version.clone(),
                actual,
            });
        }

        position = match direction {
            Direction::Up => position + 1,
            Direction::Down => position - 1,
        };
        steps_applied += 1;
    }

    Ok(MigrationOutcome {
        version: steps[position].version.clone(),
        database,
        steps_applied,
    })
}

fn position_of(steps: &[MigrationStep], version: &Version) -> Option<usize> {
    steps.iter().position(|step| step.version == *version)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Prefix a migration body with the session statements it relies on.
///
/// CockroachDB sessions are pointed at `database` with `USE`; YugabyteDB
/// has no `USE`, so its runner connects to `database` directly.
pub fn compose_script(backend: &BackendVersion, database: &str, body: &str) -> String {
    let mut script = String::with_capacity(body.len() + 128);
    for directive in backend.migration_session_directives() {
        script.push_str(directive);
        script.push('\n');
    }
    if backend.is_cockroach() {
        script.push_str(&format!("USE {};\n", quote_ident(database)));
    }
    script.push_str(body);
    script
}

/// The database name that holds the schema after crossing `from -> to`,
/// when that transition is the historical remote ID rename.
///
/// Only the single 4.0.0 `defaultdb`/`rid` boundary is recognized.
pub fn renamed_database(
    direction: Direction,
    from: &Version,
    to: &Version,
    database: &str,
) -> Option<&'static str> {
    match direction {
        Direction::Up if *to == RID_RENAME_VERSION && database == LEGACY_RID_DATABASE => {
            Some(RID_DATABASE)
        }
        Direction::Down if *from == RID_RENAME_VERSION && database == RID_DATABASE => {
            Some(LEGACY_RID_DATABASE)
        }
        _ => None,
    }
}
