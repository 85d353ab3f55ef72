#![warn(missing_docs)]
//! Semantic search over exported chat archives.
//!
//! Archives are parsed by the `chat_archive` crate, stored in Postgres with
//! pgvector, embedded through an Ollama-compatible provider, and queried by
//! cosine similarity.

pub mod backfill;
pub mod config;
pub mod embedder;
pub mod engine;
pub mod export;
pub mod ingest;
pub mod logging;
pub mod store;
pub mod vector;

pub use backfill::{run_backfill, BackfillOptions, BackfillReport, BatchOutcome, FailedMessage};
pub use config::{Config, EmbeddingConfig, Settings};
pub use embedder::{EmbeddingError, EmbeddingGateway, EmbeddingProvider, OllamaEmbedder};
pub use engine::{
    CharacteristicMessage, EngineError, SearchHit, SearchQuery, SimilarConversation,
    SimilarityEngine,
};
pub use export::ListFormat;
pub use ingest::{import_archive, import_stream, ImportError, ImportReport, ImportedConversation};
pub use store::{ConversationStore, MemoryStore, MessageFilter, PgStore, StatsSort, StoreError};
