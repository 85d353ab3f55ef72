use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chat_archive::ArchiveReader;
use clap::Parser;
use convoscope::ingest::{import_stream, ImportReport};
use convoscope::{logging, ConversationStore, MemoryStore, PgStore, Settings};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(
    name = "convoscope-import",
    about = "Import a chat export (conversations.json or .zip) into Postgres"
)]
struct ImportCli {
    /// Path to conversations.json or the export .zip
    archive: PathBuf,

    /// Parse and normalize only; nothing is written to the database
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Do not create or verify the schema before importing
    #[arg(long, env = "CONVOSCOPE_SKIP_SCHEMA", default_value_t = false)]
    skip_schema: bool,

    #[command(flatten)]
    settings: Settings,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = ImportCli::parse();
    logging::init(cli.settings.verbose);
    let config = cli.settings.build_config()?;
    let stream = ArchiveReader::open(&cli.archive)
        .with_context(|| format!("failed to open archive {:?}", cli.archive))?;

    let report = if cli.dry_run {
        let mut store = MemoryStore::new();
        run_import(&mut store, stream).await?
    } else {
        let mut store = PgStore::connect(&config).await?;
        if !cli.skip_schema {
            store
                .prepare_schema()
                .await
                .context("failed to prepare schema")?;
        }
        run_import(&mut store, stream).await?
    };

    for skipped in &report.skipped {
        warn!(%skipped, "skipped archive item");
    }
    let imported = report.imported.len();
    println!(
        "{} {} conversation{} ({} messages), {} skipped, {} empty.",
        if cli.dry_run { "Parsed" } else { "Imported" },
        imported,
        if imported == 1 { "" } else { "s" },
        report.message_count(),
        report.skipped.len(),
        report.dropped_empty
    );
    Ok(())
}

async fn run_import<S: ConversationStore>(
    store: &mut S,
    stream: chat_archive::ConversationStream,
) -> Result<ImportReport> {
    let mut saved = 0usize;
    let mut progress_error = None;
    let report = import_stream(store, stream, |_| {
        saved += 1;
        if let Err(err) = render_progress(saved) {
            progress_error.get_or_insert(err);
        }
    })
    .await
    .context("import failed")?;
    if let Some(err) = progress_error {
        return Err(err).context("failed to write progress");
    }
    if saved > 0 {
        println!();
    }
    Ok(report)
}

fn render_progress(saved: usize) -> io::Result<()> {
    let plural = if saved == 1 { "" } else { "s" };
    print!("\rSaved {} conversation{}...", saved, plural);
    io::stdout().flush()
}
