use anyhow::{Context, Result};
use clap::Parser;
use convoscope::{logging, EmbeddingGateway, OllamaEmbedder, PgStore, Settings, SimilarityEngine};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "convoscope-analyze",
    about = "Show the message that best represents a conversation"
)]
struct AnalyzeCli {
    /// Conversation id
    conversation: Uuid,

    /// Print the result as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(flatten)]
    settings: Settings,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = AnalyzeCli::parse();
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

    engine.require_conversation(cli.conversation).await?;
    let characteristic = engine
        .most_characteristic_message(cli.conversation)
        .await
        .with_context(|| format!("failed to analyze conversation {}", cli.conversation))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&characteristic)?);
    } else {
        println!("Most characteristic message ({}):", characteristic.role);
        println!("Score: {:.3}", characteristic.score);
        println!("Message id: {}", characteristic.message_id);
        println!();
        println!("{}", characteristic.content);
    }
    Ok(())
}
