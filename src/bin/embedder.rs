use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use convoscope::vector::l2_norm;
use convoscope::{
    logging, run_backfill, BackfillOptions, ConversationStore, EmbeddingGateway, OllamaEmbedder,
    PgStore, Settings,
};

#[derive(Parser, Debug)]
#[command(
    name = "convoscope-embed",
    about = "Embed stored messages with an Ollama model"
)]
struct EmbedCli {
    #[command(subcommand)]
    command: EmbedCommand,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Subcommand, Debug)]
enum EmbedCommand {
    /// Embed every message that does not have an embedding yet
    Update {
        /// Messages fetched and committed per round
        #[arg(long, env = "CONVOSCOPE_EMBED_BATCH", default_value_t = 50)]
        batch_size: usize,

        /// Clear all existing embeddings and start over
        #[arg(long, default_value_t = false)]
        force: bool,

        /// Override the configured embedding model for this run
        #[arg(long)]
        model: Option<String>,
    },
    /// Show how many messages have embeddings
    Status,
    /// Embed a sample text and print a summary of the vector
    Test {
        /// Text to embed
        #[arg(default_value = "This is a test of the embedding service.")]
        text: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = EmbedCli::parse();
    logging::init(cli.settings.verbose);
    let config = cli.settings.build_config()?;

    match cli.command {
        EmbedCommand::Update {
            batch_size,
            force,
            model,
        } => {
            let embedding = match model {
                Some(model) => config.embedding().with_model(model),
                None => config.embedding().clone(),
            };
            let gateway = EmbeddingGateway::new(
                OllamaEmbedder::from_config(&embedding)?,
                embedding.dimensions(),
                embedding.document_prefix(),
            );
            let mut store = PgStore::connect(&config).await?;
            let options = BackfillOptions { batch_size, force };

            let mut done = 0usize;
            let report = run_backfill(&mut store, &gateway, options, |outcome| {
                done += outcome.embedded;
                render_progress(outcome.batch, done);
            })
            .await
            .context("embedding backfill failed")?;
            if report.batches > 0 {
                println!();
            }
            if report.cleared > 0 {
                println!("Cleared {} existing embeddings.", report.cleared);
            }
            println!(
                "Embedded {} message{} with {} in {} batch{}; {} failed.",
                report.embedded,
                if report.embedded == 1 { "" } else { "s" },
                gateway.model(),
                report.batches,
                if report.batches == 1 { "" } else { "es" },
                report.failed.len()
            );
            for failed in &report.failed {
                eprintln!("  {}: {}", failed.message_id, failed.reason);
            }
        }
        EmbedCommand::Status => {
            let store = PgStore::connect(&config).await?;
            let stats = store
                .embedding_stats()
                .await
                .context("failed to read embedding stats")?;
            let coverage = if stats.total == 0 {
                0.0
            } else {
                stats.embedded as f64 * 100.0 / stats.total as f64
            };
            println!("Total messages:   {}", stats.total);
            println!("With embeddings:  {} ({coverage:.1}%)", stats.embedded);
            println!("Pending:          {}", stats.pending);
        }
        EmbedCommand::Test { text } => {
            let embedding = config.embedding();
            let provider = OllamaEmbedder::from_config(embedding)?;
            let endpoint = provider.endpoint().to_string();
            let gateway = EmbeddingGateway::new(
                provider,
                embedding.dimensions(),
                embedding.document_prefix(),
            );
            let vector = gateway
                .create_embedding(&text)
                .await
                .with_context(|| format!("embedding request to {endpoint} failed"))?;
            let preview: Vec<String> = vector.iter().take(5).map(|v| format!("{v:.4}")).collect();
            println!("Model:      {}", gateway.model());
            println!("Dimensions: {}", vector.len());
            println!("L2 norm:    {:.4}", l2_norm(&vector));
            println!("First 5:    [{}]", preview.join(", "));
        }
    }
    Ok(())
}

fn render_progress(batch: usize, embedded: usize) {
    let plural = if embedded == 1 { "" } else { "s" };
    print!("\rBatch {batch}: embedded {embedded} message{plural}...");
    let _ = io::stdout().flush();
}
