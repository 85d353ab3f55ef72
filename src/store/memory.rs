//! In-process store with exact linear cosine ranking.

use std::collections::HashSet;

use uuid::Uuid;

use super::{
    word_count, ConversationStats, ConversationStore, EmbeddingStats, EmbeddingUpdate,
    MessageFilter, NewConversation, NewMessage, PendingMessage, ScoredConversation, ScoredMessage,
    StatsSort, StoreError, StoredConversation, StoredMessage, TextMatch,
};
use crate::vector::cosine_distance;

/// Keeps everything in insertion order; nothing is persisted.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    conversations: Vec<StoredConversation>,
    messages: Vec<StoredMessage>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored conversations.
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    fn title_of(&self, conversation_id: Uuid) -> Option<&str> {
        self.conversations
            .iter()
            .find(|conversation| conversation.id == conversation_id)
            .map(|conversation| conversation.title.as_str())
    }

    fn sorted_messages_of(&self, conversation_id: Uuid) -> Vec<&StoredMessage> {
        let mut messages: Vec<_> = self
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .collect();
        messages.sort_by_key(|message| message.position);
        messages
    }
}

impl ConversationStore for MemoryStore {
    async fn save_conversation(
        &mut self,
        conversation: &NewConversation,
        messages: &[NewMessage],
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.conversations.push(StoredConversation {
            id,
            original_id: conversation.original_id.clone(),
            title: conversation.title.clone(),
            create_time: conversation.create_time,
            update_time: conversation.update_time,
            source: conversation.source.clone(),
        });
        self.messages.extend(messages.iter().map(|message| StoredMessage {
            id: Uuid::new_v4(),
            conversation_id: id,
            original_id: message.original_id.clone(),
            role: message.role.clone(),
            author_name: message.author_name.clone(),
            model: message.model.clone(),
            content: message.content.clone(),
            position: message.position,
            create_time: message.create_time,
            embedding: None,
            embedding_model: None,
        }));
        Ok(id)
    }

    async fn pending_embeddings(
        &self,
        limit: usize,
        exclude: &[Uuid],
    ) -> Result<Vec<PendingMessage>, StoreError> {
        let excluded: HashSet<&Uuid> = exclude.iter().collect();
        Ok(self
            .messages
            .iter()
            .filter(|message| message.embedding.is_none())
            .filter(|message| !message.content.trim().is_empty())
            .filter(|message| !excluded.contains(&message.id))
            .take(limit)
            .map(|message| PendingMessage {
                id: message.id,
                content: message.content.clone(),
            })
            .collect())
    }

    async fn update_embeddings(&mut self, updates: &[EmbeddingUpdate]) -> Result<usize, StoreError> {
        let mut updated = 0usize;
        for update in updates {
            if let Some(message) = self
                .messages
                .iter_mut()
                .find(|message| message.id == update.message_id)
            {
                message.embedding = Some(update.embedding.clone());
                message.embedding_model = Some(update.model.clone());
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn clear_embeddings(&mut self) -> Result<u64, StoreError> {
        let mut cleared = 0u64;
        for message in &mut self.messages {
            if message.embedding.take().is_some() {
                message.embedding_model = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn embedding_stats(&self) -> Result<EmbeddingStats, StoreError> {
        let embedded = self
            .messages
            .iter()
            .filter(|message| message.embedding.is_some())
            .count();
        Ok(EmbeddingStats::new(self.messages.len() as i64, embedded as i64))
    }

    async fn conversation(&self, id: Uuid) -> Result<Option<StoredConversation>, StoreError> {
        Ok(self
            .conversations
            .iter()
            .find(|conversation| conversation.id == id)
            .cloned())
    }

    async fn conversation_messages(&self, id: Uuid) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self.sorted_messages_of(id).into_iter().cloned().collect())
    }

    async fn message(&self, id: Uuid) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self.messages.iter().find(|message| message.id == id).cloned())
    }

    async fn embedded_messages(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>, StoreError> {
        Ok(self
            .sorted_messages_of(conversation_id)
            .into_iter()
            .filter(|message| message.embedding.is_some())
            .cloned()
            .collect())
    }

    async fn nearest_messages(
        &self,
        query: &[f32],
        filter: &MessageFilter,
        max_distance: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMessage>, StoreError> {
        let mut scored: Vec<ScoredMessage> = self
            .messages
            .iter()
            .filter(|message| !message.content.is_empty() && filter.matches(message))
            .filter_map(|message| {
                let embedding = message.embedding.as_deref()?;
                let distance = cosine_distance(query, embedding);
                (distance <= max_distance).then(|| ScoredMessage {
                    message: message.clone(),
                    distance,
                })
            })
            .collect();
        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn conversations_by_average_distance(
        &self,
        target: &[f32],
        exclude: Uuid,
        limit: usize,
    ) -> Result<Vec<ScoredConversation>, StoreError> {
        let mut scored: Vec<ScoredConversation> = self
            .conversations
            .iter()
            .filter(|conversation| conversation.id != exclude)
            .filter_map(|conversation| {
                let distances: Vec<f64> = self
                    .messages
                    .iter()
                    .filter(|message| message.conversation_id == conversation.id)
                    .filter_map(|message| message.embedding.as_deref())
                    .map(|embedding| cosine_distance(target, embedding))
                    .collect();
                if distances.is_empty() {
                    return None;
                }
                Some(ScoredConversation {
                    conversation: conversation.clone(),
                    avg_distance: distances.iter().sum::<f64>() / distances.len() as f64,
                })
            })
            .collect();
        scored.sort_by(|a, b| a.avg_distance.total_cmp(&b.avg_distance));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn text_search(
        &self,
        needle: &str,
        case_sensitive: bool,
        limit: usize,
    ) -> Result<Vec<TextMatch>, StoreError> {
        let lowered = needle.to_lowercase();
        let mut matches: Vec<(TextMatch, i32)> = self
            .messages
            .iter()
            .filter(|message| {
                if case_sensitive {
                    message.content.contains(needle)
                } else {
                    message.content.to_lowercase().contains(&lowered)
                }
            })
            .map(|message| {
                let hit = TextMatch {
                    conversation_id: message.conversation_id,
                    title: self.title_of(message.conversation_id).unwrap_or_default().to_string(),
                    message_id: message.id,
                    role: message.role.clone(),
                    content: message.content.clone(),
                };
                (hit, message.position)
            })
            .collect();
        matches.sort_by(|(a, a_pos), (b, b_pos)| {
            a.title
                .cmp(&b.title)
                .then(a.conversation_id.cmp(&b.conversation_id))
                .then(a_pos.cmp(b_pos))
        });
        Ok(matches.into_iter().take(limit).map(|(hit, _)| hit).collect())
    }

    async fn conversation_stats(
        &self,
        sort: StatsSort,
        limit: usize,
    ) -> Result<Vec<ConversationStats>, StoreError> {
        let mut stats: Vec<ConversationStats> = self
            .conversations
            .iter()
            .map(|conversation| {
                let messages = self.sorted_messages_of(conversation.id);
                ConversationStats {
                    id: conversation.id,
                    title: conversation.title.clone(),
                    create_time: conversation.create_time,
                    messages: messages.len() as i64,
                    words: messages.iter().map(|message| word_count(&message.content)).sum(),
                }
            })
            .collect();
        stats.sort_by(|a, b| {
            let primary = match sort {
                StatsSort::Title => std::cmp::Ordering::Equal,
                StatsSort::Messages => b.messages.cmp(&a.messages),
                StatsSort::Words => b.words.cmp(&a.words),
            };
            primary.then_with(|| a.title.cmp(&b.title)).then(a.id.cmp(&b.id))
        });
        stats.truncate(limit);
        Ok(stats)
    }
}
