use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use convoscope::{logging, PgStore, Settings};

#[derive(Parser, Debug)]
#[command(
    name = "convoscope-db",
    about = "Create or verify the Postgres schema used by convoscope"
)]
struct DbCli {
    #[command(subcommand)]
    command: DbCommand,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    /// Install pgvector (if available) and create the tables and indexes
    Init,
    /// Report the schema state without changing anything
    Verify,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = DbCli::parse();
    logging::init(cli.settings.verbose);
    let config = cli.settings.build_config()?;
    let store = PgStore::connect(&config).await?;
    let tables = store.tables();

    match cli.command {
        DbCommand::Init => {
            store
                .prepare_schema()
                .await
                .context("failed to prepare schema")?;
            println!(
                "Schema ready: {} and {} (embedding dimension {}).",
                tables.conversations().qualified(),
                tables.messages().qualified(),
                config.embedding().dimensions()
            );
        }
        DbCommand::Verify => {
            let status = store
                .inspect_schema()
                .await
                .context("failed to inspect schema")?;
            println!(
                "pgvector available: {}",
                status.extension.available.as_deref().unwrap_or("no")
            );
            println!(
                "pgvector installed: {}",
                status.extension.installed.as_deref().unwrap_or("no")
            );
            println!(
                "{}: {}",
                tables.conversations().qualified(),
                present(status.conversations_table)
            );
            println!(
                "{}: {}",
                tables.messages().qualified(),
                present(status.messages_table)
            );
            match status.embedding_dimensions {
                Some(dims) => println!("embedding dimension: {dims}"),
                None => println!("embedding dimension: unknown"),
            }

            let expected = config.embedding().dimensions();
            if status.extension.available.is_none() {
                bail!("pgvector is not available on this server; install it and run `convoscope-db init`");
            }
            if !status.conversations_table || !status.messages_table {
                bail!("tables are missing; run `convoscope-db init`");
            }
            if let Some(found) = status.embedding_dimensions {
                if usize::try_from(found).ok() != Some(expected) {
                    bail!("embedding column has dimension {found}, expected {expected}");
                }
            }
            println!("Schema OK.");
        }
    }
    Ok(())
}

fn present(exists: bool) -> &'static str {
    if exists {
        "present"
    } else {
        "missing"
    }
}
