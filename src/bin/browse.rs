use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use convoscope::export::{export_markdown, render_listing};
use convoscope::{logging, ConversationStore, ListFormat, PgStore, Settings, StatsSort};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "convoscope-browse",
    about = "List imported conversations or export them as Markdown"
)]
struct BrowseCli {
    #[command(subcommand)]
    command: BrowseCommand,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Subcommand, Debug)]
enum BrowseCommand {
    /// List conversations with message and word counts
    List {
        /// Sort order
        #[arg(long, value_enum, default_value_t = SortKey::Title)]
        sort: SortKey,

        /// Maximum number of conversations to show
        #[arg(long, default_value_t = 50)]
        limit: usize,

        /// Output format
        #[arg(long, value_enum, default_value_t = ListFormat::Table)]
        format: ListFormat,
    },
    /// Print messages or whole conversations as Markdown
    Export {
        /// Message or conversation ids
        #[arg(required = true)]
        ids: Vec<Uuid>,

        /// Include the model that produced each message
        #[arg(long, default_value_t = false)]
        show_model: bool,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SortKey {
    Title,
    Messages,
    Words,
}

impl From<SortKey> for StatsSort {
    fn from(key: SortKey) -> Self {
        match key {
            SortKey::Title => StatsSort::Title,
            SortKey::Messages => StatsSort::Messages,
            SortKey::Words => StatsSort::Words,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = BrowseCli::parse();
    logging::init(cli.settings.verbose);
    let config = cli.settings.build_config()?;
    let store = PgStore::connect(&config).await?;

    match cli.command {
        BrowseCommand::List {
            sort,
            limit,
            format,
        } => {
            let rows = store
                .conversation_stats(sort.into(), limit)
                .await
                .context("failed to list conversations")?;
            let rendered = render_listing(&rows, format)?;
            if rendered.ends_with('\n') {
                print!("{rendered}");
            } else {
                println!("{rendered}");
            }
        }
        BrowseCommand::Export { ids, show_model } => {
            let mut missing = 0usize;
            for id in ids {
                match export_markdown(&store, id, show_model)
                    .await
                    .with_context(|| format!("failed to export {id}"))?
                {
                    Some(markdown) => print!("{markdown}"),
                    None => {
                        eprintln!("UUID {id} not found as message or conversation.");
                        missing += 1;
                    }
                }
            }
            anyhow::ensure!(missing == 0, "{missing} id(s) not found");
        }
    }
    Ok(())
}
