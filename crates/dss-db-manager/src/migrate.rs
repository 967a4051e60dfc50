//! `migrate` subcommand.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::Args;
use semver::Version;
use tracing::info;

use dss_datastore::schema::executor::{LEGACY_RID_DATABASE, RID_DATABASE};
use dss_datastore::schema::index::ORIGIN_VERSION;
use dss_datastore::{
    enumerate_steps, migrate, BackendFamily, ConnectArgs, MigrationSession, MigrationStep,
    SchemaState,
};

/// Target value that resolves to the newest discovered version.
const LATEST: &str = "latest";

/// Arguments for `db-manager migrate`.
#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Directory holding the migration files of one database. Its name is
    /// the database name.
    #[arg(long)]
    pub schemas_dir: PathBuf,

    /// Target schema version, or `latest`. When omitted the current version
    /// is printed and nothing is changed.
    #[arg(long)]
    pub db_version: Option<String>,

    #[command(flatten)]
    pub connect: ConnectArgs,
}

/// Run the subcommand.
pub async fn run(args: MigrateArgs) -> anyhow::Result<()> {
    let database = database_name(&args.schemas_dir)?;
    let params = args.connect.into_parameters()?;

    let mut session = MigrationSession::open(&params)
        .await
        .context("failed to open migration session")?;
    let family = session.backend().family;

    let result = match args.db_version.as_deref() {
        None => report(&mut session, family, &database).await,
        Some(requested) => {
            let schema_dir = resolve_schema_dir(&args.schemas_dir, family, &database);
            converge(&mut session, family, &database, &schema_dir, requested).await
        }
    };

    session.close().await.context("failed to close migration session")?;
    result
}

/// Print the current schema state without changing anything.
async fn report(
    session: &mut MigrationSession,
    family: BackendFamily,
    database: &str,
) -> anyhow::Result<()> {
    let mut located = database.to_string();
    let mut state = session.schema_state(database).await?;

    if uses_legacy_name(family, database) && matches!(state, SchemaState::Missing) {
        located = LEGACY_RID_DATABASE.to_string();
        state = session.schema_state(LEGACY_RID_DATABASE).await?;
    }

    println!("Database {located}: {state}");
    Ok(())
}

/// Migrate `database` to the requested version.
async fn converge(
    session: &mut MigrationSession,
    family: BackendFamily,
    database: &str,
    schema_dir: &Path,
    requested: &str,
) -> anyhow::Result<()> {
    let steps = enumerate_steps(schema_dir)?;
    let target = resolve_target(requested, &steps)?;

    let active = if uses_legacy_name(family, database) {
        let rid_exists = session.database_exists(RID_DATABASE).await?;
        select_rid_database(rid_exists)
    } else {
        session.ensure_database(database).await?;
        database
    };

    let current = match session.schema_state(active).await? {
        SchemaState::Missing => bail!("database {active} does not exist"),
        SchemaState::Unbootstrapped => ORIGIN_VERSION,
        SchemaState::Bootstrapped(version) => version,
    };

    info!(
        database = active,
        current = %current,
        target = %target,
        schema_dir = %schema_dir.display(),
        "migrating"
    );

    let outcome = migrate(&current, &target, &steps, active, session)
        .await
        .with_context(|| format!("migration of {active} from {current} to {target} failed"))?;

    println!(
        "Database {} is at version {} ({} step{} applied)",
        outcome.database,
        outcome.version,
        outcome.steps_applied,
        if outcome.steps_applied == 1 { "" } else { "s" }
    );
    Ok(())
}

/// Database name for a schema directory: its final path component.
fn database_name(schemas_dir: &Path) -> anyhow::Result<String> {
    schemas_dir
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("cannot derive a database name from {}", schemas_dir.display()))
}

/// YugabyteDB schemas live in a sibling `yugabyte/<database>` directory.
fn resolve_schema_dir(schemas_dir: &Path, family: BackendFamily, database: &str) -> PathBuf {
    match family {
        BackendFamily::Cockroach => schemas_dir.to_path_buf(),
        BackendFamily::Yugabyte => schemas_dir
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join("yugabyte")
            .join(database),
    }
}

/// Resolve `latest` or an explicit version against the discovered steps.
fn resolve_target(requested: &str, steps: &[MigrationStep]) -> anyhow::Result<Version> {
    let requested = requested.trim();
    if requested.eq_ignore_ascii_case(LATEST) {
        return steps
            .last()
            .map(|step| step.version.clone())
            .ok_or_else(|| anyhow!("no migration steps found"));
    }

    let bare = requested.strip_prefix('v').unwrap_or(requested);
    Version::parse(bare).with_context(|| format!("invalid target version {requested:?}"))
}

/// The remote ID database may still carry its pre-4.0.0 name on CockroachDB.
fn uses_legacy_name(family: BackendFamily, database: &str) -> bool {
    family == BackendFamily::Cockroach && database == RID_DATABASE
}

fn select_rid_database(rid_exists: bool) -> &'static str {
    if rid_exists {
        RID_DATABASE
    } else {
        LEGACY_RID_DATABASE
    }
}
