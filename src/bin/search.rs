use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use convoscope::engine::SearchHit;
use convoscope::export::format_timestamp;
use convoscope::{
    logging, EmbeddingGateway, MessageFilter, OllamaEmbedder, PgStore, SearchQuery, Settings,
    SimilarityEngine,
};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "convoscope-search",
    about = "Semantic, similar-conversation, and text search over imported chats"
)]
struct SearchCli {
    #[command(subcommand)]
    command: SearchCommand,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Subcommand, Debug)]
enum SearchCommand {
    /// Find messages semantically close to a query
    Semantic {
        /// Free-text query
        query: String,

        /// Maximum number of results
        #[arg(long, default_value_t = 5)]
        limit: usize,

        /// Drop results below this cosine similarity
        #[arg(long, default_value_t = 0.7)]
        min_similarity: f64,

        /// Only messages with this role (user, assistant, tool, ...)
        #[arg(long)]
        role: Option<String>,

        /// Only messages created at or after this unix time
        #[arg(long)]
        since: Option<f64>,

        /// Only messages created at or before this unix time
        #[arg(long)]
        until: Option<f64>,

        /// Restrict results to one conversation
        #[arg(long)]
        conversation: Option<Uuid>,

        /// Keep messages that carry tool-call payloads
        #[arg(long, default_value_t = false)]
        include_tool_payloads: bool,

        /// Output format
        #[arg(long, value_enum, default_value_t = HitFormat::Table)]
        format: HitFormat,
    },
    /// Rank other conversations by similarity to one conversation
    Similar {
        /// Conversation id
        conversation: Uuid,

        /// Maximum number of results
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Substring search over message content
    Text {
        /// Text to look for
        needle: String,

        /// Match case exactly
        #[arg(long, default_value_t = false)]
        case_sensitive: bool,

        /// Maximum number of results
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum HitFormat {
    Table,
    Json,
    Text,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = SearchCli::parse();
    logging::init(cli.settings.verbose);
    let config = cli.settings.build_config()?;
    let embedding = config.embedding();
    let gateway = EmbeddingGateway::new(
        OllamaEmbedder::from_config(embedding)?,
        embedding.dimensions(),
        embedding.document_prefix(),
    );
    let store = PgStore::connect(&config).await?;
    let engine = SimilarityEngine::new(&store, &gateway);

    match cli.command {
        SearchCommand::Semantic {
            query,
            limit,
            min_similarity,
            role,
            since,
            until,
            conversation,
            include_tool_payloads,
            format,
        } => {
            let query = SearchQuery {
                text: query,
                limit,
                min_similarity,
                filter: MessageFilter {
                    role,
                    since,
                    until,
                    conversation,
                    exclude_tool_payloads: !include_tool_payloads,
                },
            };
            let hits = engine.search(&query).await.context("semantic search failed")?;
            print_hits(&hits, format)?;
        }
        SearchCommand::Similar {
            conversation,
            limit,
        } => {
            engine.require_conversation(conversation).await?;
            let similar = engine
                .find_similar_conversations(conversation, limit)
                .await
                .context("similar conversation search failed")?;
            if similar.is_empty() {
                println!("No similar conversations found.");
            }
            for (rank, found) in similar.iter().enumerate() {
                println!(
                    "{:>2}. {:.3}  {}  {}",
                    rank + 1,
                    found.similarity,
                    found.id,
                    found.title
                );
            }
        }
        SearchCommand::Text {
            needle,
            case_sensitive,
            limit,
        } => {
            let matches = engine
                .text_search(&needle, case_sensitive, limit)
                .await
                .context("text search failed")?;
            if matches.is_empty() {
                println!("No messages contain {needle:?}.");
            }
            for found in &matches {
                println!("[{}] {} ({})", found.title, found.role, found.message_id);
                println!("  {}", snippet(&found.content, 200));
            }
        }
    }
    Ok(())
}

fn print_hits(hits: &[SearchHit], format: HitFormat) -> Result<()> {
    match format {
        HitFormat::Json => {
            println!("{}", serde_json::to_string_pretty(hits)?);
        }
        HitFormat::Text => {
            for hit in hits {
                println!("{}", hit.content);
                println!();
            }
        }
        HitFormat::Table => {
            if hits.is_empty() {
                println!("No results above the similarity threshold.");
            }
            for (rank, hit) in hits.iter().enumerate() {
                let created = format_timestamp(hit.create_time).unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>2}. {:.3}  {:<9}  {}  {}",
                    rank + 1,
                    hit.similarity,
                    hit.role,
                    created,
                    hit.message_id
                );
                println!("    {}", snippet(&hit.content, 160));
            }
        }
    }
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
