//! Similarity queries over stored message embeddings.

use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::embedder::{EmbeddingError, EmbeddingGateway, EmbeddingProvider};
use crate::store::{ConversationStore, MessageFilter, StoreError, StoredMessage, TextMatch};
use crate::vector::{dot, mean_embedding};

/// Query failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The query text was blank.
    #[error("query text must not be empty")]
    EmptyQuery,
    /// The conversation has no embedded messages to analyze.
    #[error("no embeddings found for conversation {0}")]
    NoEmbeddingsFound(Uuid),
    /// The conversation does not exist.
    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),
    /// Embedding the query failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Semantic search parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    /// Free text to embed.
    pub text: String,
    /// Maximum number of hits.
    pub limit: usize,
    /// Hits below this cosine similarity are dropped.
    pub min_similarity: f64,
    /// Candidate predicates.
    pub filter: MessageFilter,
}

impl SearchQuery {
    /// Query with the default limit (5), threshold (0.7), and filters.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            limit: 5,
            min_similarity: 0.7,
            filter: MessageFilter::default(),
        }
    }
}

/// One semantic search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Message id.
    pub message_id: Uuid,
    /// Owning conversation.
    pub conversation_id: Uuid,
    /// Author role.
    pub role: String,
    /// Message text.
    pub content: String,
    /// Unix seconds.
    pub create_time: f64,
    /// `1 - cosine distance`.
    pub similarity: f64,
}

/// A conversation close to another one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarConversation {
    /// Conversation id.
    pub id: Uuid,
    /// Conversation title.
    pub title: String,
    /// `1 - mean cosine distance`.
    pub similarity: f64,
}

/// The message that best represents its conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacteristicMessage {
    /// Message id.
    pub message_id: Uuid,
    /// Author role.
    pub role: String,
    /// Message text.
    pub content: String,
    /// Dot product with the conversation's aggregate embedding.
    pub score: f64,
}

/// Runs similarity queries against a store.
pub struct SimilarityEngine<'a, S, P> {
    store: &'a S,
    gateway: &'a EmbeddingGateway<P>,
}

impl<'a, S, P> SimilarityEngine<'a, S, P>
where
    S: ConversationStore,
    P: EmbeddingProvider,
{
    /// Builds an engine over `store`, embedding queries with `gateway`.
    pub fn new(store: &'a S, gateway: &'a EmbeddingGateway<P>) -> Self {
        Self { store, gateway }
    }

    /// Mean of the conversation's message embeddings, re-normalized. A zero
    /// vector when nothing is embedded.
    pub async fn conversation_embedding(&self, conversation_id: Uuid) -> Result<Vec<f32>, EngineError> {
        let messages = self.store.embedded_messages(conversation_id).await?;
        Ok(self.aggregate(&messages))
    }

    /// The embedded message with the highest dot product against the aggregate.
    /// Ties keep the earliest message.
    pub async fn most_characteristic_message(
        &self,
        conversation_id: Uuid,
    ) -> Result<CharacteristicMessage, EngineError> {
        let messages = self.store.embedded_messages(conversation_id).await?;
        let aggregate = self.aggregate(&messages);

        let mut best: Option<(&StoredMessage, f64)> = None;
        for message in &messages {
            let Some(embedding) = message.embedding.as_deref() else {
                continue;
            };
            let score = dot(embedding, &aggregate);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((message, score));
            }
        }

        let (message, score) = best.ok_or(EngineError::NoEmbeddingsFound(conversation_id))?;
        Ok(CharacteristicMessage {
            message_id: message.id,
            role: message.role.clone(),
            content: message.content.clone(),
            score,
        })
    }

    /// Embeds the query text and returns the nearest messages at or above
    /// `min_similarity`, best first.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, EngineError> {
        if query.text.trim().is_empty() {
            return Err(EngineError::EmptyQuery);
        }
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.gateway.create_embedding(&query.text).await?;
        let max_distance = 1.0 - query.min_similarity;
        let scored = self
            .store
            .nearest_messages(&embedding, &query.filter, max_distance, query.limit)
            .await?;
        debug!(candidates = scored.len(), "semantic search");

        Ok(scored
            .into_iter()
            .map(|scored| (1.0 - scored.distance, scored.message))
            .filter(|(similarity, _)| *similarity >= query.min_similarity)
            .map(|(similarity, message)| SearchHit {
                message_id: message.id,
                conversation_id: message.conversation_id,
                role: message.role,
                content: message.content,
                create_time: message.create_time,
                similarity,
            })
            .collect())
    }

    /// Other conversations ranked by the mean cosine distance between this
    /// conversation's aggregate and each of their embedded messages. Empty when
    /// the conversation has no embeddings.
    pub async fn find_similar_conversations(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> Result<Vec<SimilarConversation>, EngineError> {
        let messages = self.store.embedded_messages(conversation_id).await?;
        if messages.is_empty() {
            debug!(%conversation_id, "no embeddings; nothing to compare");
            return Ok(Vec::new());
        }
        let target = self.aggregate(&messages);
        let scored = self
            .store
            .conversations_by_average_distance(&target, conversation_id, limit)
            .await?;
        Ok(scored
            .into_iter()
            .map(|scored| SimilarConversation {
                id: scored.conversation.id,
                title: scored.conversation.title,
                similarity: 1.0 - scored.avg_distance,
            })
            .collect())
    }

    /// Lexical substring search over message content.
    pub async fn text_search(
        &self,
        needle: &str,
        case_sensitive: bool,
        limit: usize,
    ) -> Result<Vec<TextMatch>, EngineError> {
        if needle.trim().is_empty() {
            return Err(EngineError::EmptyQuery);
        }
        Ok(self.store.text_search(needle, case_sensitive, limit).await?)
    }

    /// Fails with [`EngineError::ConversationNotFound`] unless the conversation exists.
    pub async fn require_conversation(&self, conversation_id: Uuid) -> Result<(), EngineError> {
        match self.store.conversation(conversation_id).await? {
            Some(_) => Ok(()),
            None => Err(EngineError::ConversationNotFound(conversation_id)),
        }
    }

    fn aggregate(&self, messages: &[StoredMessage]) -> Vec<f32> {
        mean_embedding(
            messages.iter().filter_map(|message| message.embedding.as_deref()),
            self.gateway.dimensions(),
        )
    }
}
