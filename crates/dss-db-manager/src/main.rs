//! DSS database manager.
//!
//! Administrative commands for the datastore behind a DSS deployment.

mod migrate;

use clap::{Parser, Subcommand};

use migrate::MigrateArgs;

/// DSS database manager
#[derive(Parser, Debug)]
#[command(name = "db-manager")]
#[command(version, about = "Manage DSS datastore schemas")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate a database schema, or print its version when no target is given.
    Migrate(MigrateArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "db_manager=info,dss_datastore=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Migrate(args) => migrate::run(args).await,
    }
}
