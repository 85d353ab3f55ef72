//! Persistence for conversations, messages, and their embeddings.
//!
//! [`ConversationStore`] is implemented by [`PgStore`] (Postgres + pgvector)
//! and [`MemoryStore`] (exact linear scans, used by tests and dry runs).
//! Both rank by cosine distance, so results agree between them.

pub mod memory;
pub mod postgres;
pub mod schema;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use schema::{quote_ident, TableName, Tables};

/// Start of the tool-call payloads (`{"query": ...}`) that browsing turns leave in message content.
pub const TOOL_PAYLOAD_MARKER: &str = "{\"query\"";

/// Value written to `conversations.source` for imported exports.
pub const EXPORT_SOURCE: &str = "openai_export";

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Postgres returned an error.
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    /// The database is not set up the way this crate needs.
    #[error("schema setup: {0}")]
    Setup(String),
    /// A row could not be mapped into a record.
    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// Conversation ready to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConversation {
    /// Id from the export.
    pub original_id: String,
    /// Conversation title.
    pub title: String,
    /// Unix seconds.
    pub create_time: f64,
    /// Unix seconds.
    pub update_time: f64,
    /// Where the conversation came from.
    pub source: String,
}

/// Message ready to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    /// Id from the export.
    pub original_id: String,
    /// Author role.
    pub role: String,
    /// Author display name, if any.
    pub author_name: Option<String>,
    /// Model slug recorded by the export, if any.
    pub model: Option<String>,
    /// Sanitized text.
    pub content: String,
    /// Index in the conversation's sorted message list.
    pub position: i32,
    /// Unix seconds.
    pub create_time: f64,
}

/// A persisted conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredConversation {
    /// Primary key.
    pub id: Uuid,
    /// Id from the export.
    pub original_id: String,
    /// Conversation title.
    pub title: String,
    /// Unix seconds.
    pub create_time: f64,
    /// Unix seconds.
    pub update_time: f64,
    /// Where the conversation came from.
    pub source: String,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    /// Primary key.
    pub id: Uuid,
    /// Owning conversation.
    pub conversation_id: Uuid,
    /// Id from the export.
    pub original_id: String,
    /// Author role.
    pub role: String,
    /// Author display name.
    pub author_name: Option<String>,
    /// Model slug recorded by the export.
    pub model: Option<String>,
    /// Message text.
    pub content: String,
    /// Index within the conversation.
    pub position: i32,
    /// Unix seconds.
    pub create_time: f64,
    /// Unit-length embedding, once assigned.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// Model that produced `embedding`.
    pub embedding_model: Option<String>,
}

/// A message still waiting for an embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    /// Message id.
    pub id: Uuid,
    /// Text to embed.
    pub content: String,
}

/// Embedding assignment for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingUpdate {
    /// Message id.
    pub message_id: Uuid,
    /// Unit-length vector.
    pub embedding: Vec<f32>,
    /// Model that produced it.
    pub model: String,
}

/// Embedding coverage across all messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmbeddingStats {
    /// All messages.
    pub total: i64,
    /// Messages with an embedding.
    pub embedded: i64,
    /// Messages without one.
    pub pending: i64,
}

impl EmbeddingStats {
    /// Builds stats from totals.
    pub fn new(total: i64, embedded: i64) -> Self {
        Self {
            total,
            embedded,
            pending: total - embedded,
        }
    }
}

/// Predicates applied to vector search candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFilter {
    /// Only messages with this role.
    pub role: Option<String>,
    /// Only messages created at or after this unix time.
    pub since: Option<f64>,
    /// Only messages created at or before this unix time.
    pub until: Option<f64>,
    /// Only messages from this conversation.
    pub conversation: Option<Uuid>,
    /// Drop messages whose content carries a tool-call payload.
    pub exclude_tool_payloads: bool,
}

impl Default for MessageFilter {
    fn default() -> Self {
        Self {
            role: None,
            since: None,
            until: None,
            conversation: None,
            exclude_tool_payloads: true,
        }
    }
}

impl MessageFilter {
    /// Whether a message passes every predicate (content emptiness is checked separately).
    pub fn matches(&self, message: &StoredMessage) -> bool {
        self.role.as_deref().map_or(true, |role| message.role == role)
            && self.since.map_or(true, |since| message.create_time >= since)
            && self.until.map_or(true, |until| message.create_time <= until)
            && self
                .conversation
                .map_or(true, |id| message.conversation_id == id)
            && !(self.exclude_tool_payloads && message.content.contains(TOOL_PAYLOAD_MARKER))
    }
}

/// A message with its cosine distance to a query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMessage {
    /// The message.
    pub message: StoredMessage,
    /// Cosine distance, `0` for identical directions.
    pub distance: f64,
}

/// A conversation with the mean cosine distance of its messages to a target.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredConversation {
    /// The conversation.
    pub conversation: StoredConversation,
    /// Mean cosine distance.
    pub avg_distance: f64,
}

/// A lexical search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextMatch {
    /// Conversation id.
    pub conversation_id: Uuid,
    /// Conversation title.
    pub title: String,
    /// Message id.
    pub message_id: Uuid,
    /// Author role.
    pub role: String,
    /// Message text.
    pub content: String,
}

/// Per-conversation counts for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationStats {
    /// Conversation id.
    pub id: Uuid,
    /// Conversation title.
    pub title: String,
    /// Unix seconds.
    pub create_time: f64,
    /// Number of messages.
    pub messages: i64,
    /// Whitespace-separated words across all messages.
    pub words: i64,
}

/// Listing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsSort {
    /// Title, ascending.
    Title,
    /// Message count, descending.
    Messages,
    /// Word count, descending.
    Words,
}

/// Operations the ingest, backfill, and query paths need from storage.
///
/// Writers take `&mut self`; each call is atomic on its own.
#[allow(async_fn_in_trait)]
pub trait ConversationStore {
    /// Inserts a conversation and its messages in one transaction and returns the new id.
    async fn save_conversation(
        &mut self,
        conversation: &NewConversation,
        messages: &[NewMessage],
    ) -> Result<Uuid, StoreError>;

    /// Up to `limit` messages without an embedding whose content is not blank,
    /// skipping the ids in `exclude`.
    async fn pending_embeddings(
        &self,
        limit: usize,
        exclude: &[Uuid],
    ) -> Result<Vec<PendingMessage>, StoreError>;

    /// Assigns embeddings in one transaction. Vectors must already be unit length.
    async fn update_embeddings(&mut self, updates: &[EmbeddingUpdate]) -> Result<usize, StoreError>;

    /// Removes every stored embedding, returning how many were cleared.
    async fn clear_embeddings(&mut self) -> Result<u64, StoreError>;

    /// Embedding coverage.
    async fn embedding_stats(&self) -> Result<EmbeddingStats, StoreError>;

    /// Looks up a conversation.
    async fn conversation(&self, id: Uuid) -> Result<Option<StoredConversation>, StoreError>;

    /// All messages of a conversation in position order.
    async fn conversation_messages(&self, id: Uuid) -> Result<Vec<StoredMessage>, StoreError>;

    /// Looks up a message.
    async fn message(&self, id: Uuid) -> Result<Option<StoredMessage>, StoreError>;

    /// Messages of a conversation that have an embedding, in position order.
    async fn embedded_messages(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>, StoreError>;

    /// Embedded messages with non-empty content passing `filter`, within
    /// `max_distance` of `query`, nearest first, at most `limit`.
    async fn nearest_messages(
        &self,
        query: &[f32],
        filter: &MessageFilter,
        max_distance: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMessage>, StoreError>;

    /// Conversations other than `exclude` ranked by the mean cosine distance
    /// between `target` and each of their embedded messages, nearest first.
    async fn conversations_by_average_distance(
        &self,
        target: &[f32],
        exclude: Uuid,
        limit: usize,
    ) -> Result<Vec<ScoredConversation>, StoreError>;

    /// Messages whose content contains `needle`.
    async fn text_search(
        &self,
        needle: &str,
        case_sensitive: bool,
        limit: usize,
    ) -> Result<Vec<TextMatch>, StoreError>;

    /// Per-conversation counts in the requested order.
    async fn conversation_stats(
        &self,
        sort: StatsSort,
        limit: usize,
    ) -> Result<Vec<ConversationStats>, StoreError>;
}

/// Whitespace-separated word count, the same rule the SQL listing uses.
pub fn word_count(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}
