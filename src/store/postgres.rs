//! Postgres + pgvector implementation of [`ConversationStore`].

use anyhow::{Context, Result};
use pgvector::Vector;
use serde_json::json;
use tokio_postgres::types::Json;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error};
use uuid::Uuid;

use super::schema::{self, SchemaStatus, Tables};
use super::{
    ConversationStats, ConversationStore, EmbeddingStats, EmbeddingUpdate, MessageFilter,
    NewConversation, NewMessage, PendingMessage, ScoredConversation, ScoredMessage, StatsSort,
    StoreError, StoredConversation, StoredMessage, TextMatch, TOOL_PAYLOAD_MARKER,
};
use crate::config::{redact_database_url, Config};

const CONVERSATION_COLUMNS: &str =
    "c.id, c.original_id, c.title, c.create_time, c.update_time, c.source";

const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.original_id, m.role, m.author_name, \
     m.model, m.content, m.position, m.create_time, m.embedding, m.embedding_model";

/// Store backed by a single Postgres connection.
pub struct PgStore {
    client: Client,
    tables: Tables,
    dimensions: usize,
}

impl PgStore {
    /// Connects using `config` and spawns the connection driver on the current runtime.
    pub async fn connect(config: &Config) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(config.database_url(), NoTls)
            .await
            .with_context(|| {
                format!(
                    "failed to connect to Postgres at {}",
                    redact_database_url(config.database_url())
                )
            })?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(%err, "postgres connection error");
            }
        });
        Ok(Self {
            client,
            tables: Tables::new(config.schema())?,
            dimensions: config.embedding().dimensions(),
        })
    }

    /// Tables this store reads and writes.
    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Creates or validates the schema for the configured dimension.
    pub async fn prepare_schema(&self) -> Result<(), StoreError> {
        schema::prepare(&self.client, &self.tables, self.dimensions).await
    }

    /// Reports the schema state without modifying it.
    pub async fn inspect_schema(&self) -> Result<SchemaStatus, StoreError> {
        schema::inspect(&self.client, &self.tables).await
    }

    fn conversations(&self) -> String {
        self.tables.conversations().qualified()
    }

    fn messages(&self) -> String {
        self.tables.messages().qualified()
    }
}

impl ConversationStore for PgStore {
    async fn save_conversation(
        &mut self,
        conversation: &NewConversation,
        messages: &[NewMessage],
    ) -> Result<Uuid, StoreError> {
        let conversation_id = Uuid::new_v4();
        let insert_conversation = format!(
            "INSERT INTO {} (id, original_id, title, create_time, update_time, source, meta) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.conversations()
        );
        let insert_message = format!(
            "INSERT INTO {} \
             (id, conversation_id, original_id, role, author_name, model, content, position, create_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.messages()
        );
        let meta = Json(json!({
            "original_id": conversation.original_id,
            "source": conversation.source,
        }));

        let transaction = self.client.transaction().await?;
        transaction
            .execute(
                &insert_conversation,
                &[
                    &conversation_id,
                    &conversation.original_id,
                    &conversation.title,
                    &conversation.create_time,
                    &conversation.update_time,
                    &conversation.source,
                    &meta,
                ],
            )
            .await?;
        let statement = transaction.prepare(&insert_message).await?;
        for message in messages {
            transaction
                .execute(
                    &statement,
                    &[
                        &Uuid::new_v4(),
                        &conversation_id,
                        &message.original_id,
                        &message.role,
                        &message.author_name,
                        &message.model,
                        &message.content,
                        &message.position,
                        &message.create_time,
                    ],
                )
                .await?;
        }
        transaction.commit().await?;
        debug!(%conversation_id, messages = messages.len(), "saved conversation");
        Ok(conversation_id)
    }

    async fn pending_embeddings(
        &self,
        limit: usize,
        exclude: &[Uuid],
    ) -> Result<Vec<PendingMessage>, StoreError> {
        let sql = format!(
            "SELECT id, content FROM {} \
             WHERE embedding IS NULL AND btrim(content) <> '' AND NOT (id = ANY($1)) \
             ORDER BY conversation_id, position \
             LIMIT $2",
            self.messages()
        );
        let rows = self
            .client
            .query(&sql, &[&exclude, &as_limit(limit)?])
            .await?;
        rows.iter()
            .map(|row| {
                Ok(PendingMessage {
                    id: row.try_get(0)?,
                    content: row.try_get(1)?,
                })
            })
            .collect()
    }

    async fn update_embeddings(&mut self, updates: &[EmbeddingUpdate]) -> Result<usize, StoreError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE {} SET embedding = $1, embedding_model = $2 WHERE id = $3",
            self.messages()
        );
        let transaction = self.client.transaction().await?;
        let statement = transaction.prepare(&sql).await?;
        let mut updated = 0usize;
        for update in updates {
            if update.embedding.len() != self.dimensions {
                return Err(StoreError::InvalidRow(format!(
                    "embedding for message {} has {} dimensions, column expects {}",
                    update.message_id,
                    update.embedding.len(),
                    self.dimensions
                )));
            }
            let vector = Vector::from(update.embedding.clone());
            let changed = transaction
                .execute(&statement, &[&vector, &update.model, &update.message_id])
                .await?;
            updated += changed as usize;
        }
        transaction.commit().await?;
        Ok(updated)
    }

    async fn clear_embeddings(&mut self) -> Result<u64, StoreError> {
        let sql = format!(
            "UPDATE {} SET embedding = NULL, embedding_model = NULL WHERE embedding IS NOT NULL",
            self.messages()
        );
        Ok(self.client.execute(&sql, &[]).await?)
    }

    async fn embedding_stats(&self) -> Result<EmbeddingStats, StoreError> {
        let sql = format!("SELECT COUNT(*), COUNT(embedding) FROM {}", self.messages());
        let row = self.client.query_one(&sql, &[]).await?;
        Ok(EmbeddingStats::new(row.try_get(0)?, row.try_get(1)?))
    }

    async fn conversation(&self, id: Uuid) -> Result<Option<StoredConversation>, StoreError> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM {} c WHERE c.id = $1",
            self.conversations()
        );
        let row = self.client.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn conversation_messages(&self, id: Uuid) -> Result<Vec<StoredMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM {} m WHERE m.conversation_id = $1 ORDER BY m.position",
            self.messages()
        );
        let rows = self.client.query(&sql, &[&id]).await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn message(&self, id: Uuid) -> Result<Option<StoredMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM {} m WHERE m.id = $1",
            self.messages()
        );
        let row = self.client.query_opt(&sql, &[&id]).await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn embedded_messages(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM {} m \
             WHERE m.conversation_id = $1 AND m.embedding IS NOT NULL \
             ORDER BY m.position",
            self.messages()
        );
        let rows = self.client.query(&sql, &[&conversation_id]).await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn nearest_messages(
        &self,
        query: &[f32],
        filter: &MessageFilter,
        max_distance: f64,
        limit: usize,
    ) -> Result<Vec<ScoredMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS}, m.embedding <=> $1 AS distance FROM {} m \
             WHERE m.embedding IS NOT NULL AND m.content <> '' \
               AND ($2::text IS NULL OR m.role = $2) \
               AND ($3::float8 IS NULL OR m.create_time >= $3) \
               AND ($4::float8 IS NULL OR m.create_time <= $4) \
               AND ($5::uuid IS NULL OR m.conversation_id = $5) \
               AND (NOT $6 OR strpos(m.content, $7) = 0) \
               AND m.embedding <=> $1 <= $8 \
             ORDER BY m.embedding <=> $1 ASC \
             LIMIT $9",
            self.messages()
        );
        let vector = Vector::from(query.to_vec());
        let rows = self
            .client
            .query(
                &sql,
                &[
                    &vector,
                    &filter.role,
                    &filter.since,
                    &filter.until,
                    &filter.conversation,
                    &filter.exclude_tool_payloads,
                    &TOOL_PAYLOAD_MARKER,
                    &max_distance,
                    &as_limit(limit)?,
                ],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ScoredMessage {
                    message: message_from_row(row)?,
                    distance: row.try_get("distance")?,
                })
            })
            .collect()
    }

    async fn conversations_by_average_distance(
        &self,
        target: &[f32],
        exclude: Uuid,
        limit: usize,
    ) -> Result<Vec<ScoredConversation>, StoreError> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS}, AVG(m.embedding <=> $1) AS avg_distance \
             FROM {} c JOIN {} m ON m.conversation_id = c.id \
             WHERE c.id <> $2 AND m.embedding IS NOT NULL \
             GROUP BY c.id \
             ORDER BY avg_distance ASC, c.id \
             LIMIT $3",
            self.conversations(),
            self.messages()
        );
        let vector = Vector::from(target.to_vec());
        let rows = self
            .client
            .query(&sql, &[&vector, &exclude, &as_limit(limit)?])
            .await?;
        rows.iter()
            .map(|row| {
                Ok(ScoredConversation {
                    conversation: conversation_from_row(row)?,
                    avg_distance: row.try_get("avg_distance")?,
                })
            })
            .collect()
    }

    async fn text_search(
        &self,
        needle: &str,
        case_sensitive: bool,
        limit: usize,
    ) -> Result<Vec<TextMatch>, StoreError> {
        let operator = if case_sensitive { "LIKE" } else { "ILIKE" };
        let sql = format!(
            "SELECT c.id, c.title, m.id, m.role, m.content \
             FROM {} m JOIN {} c ON c.id = m.conversation_id \
             WHERE m.content {operator} $1 \
             ORDER BY c.title, c.id, m.position \
             LIMIT $2",
            self.messages(),
            self.conversations()
        );
        let pattern = format!("%{}%", escape_like(needle));
        let rows = self
            .client
            .query(&sql, &[&pattern, &as_limit(limit)?])
            .await?;
        rows.iter()
            .map(|row| {
                Ok(TextMatch {
                    conversation_id: row.try_get(0)?,
                    title: row.try_get(1)?,
                    message_id: row.try_get(2)?,
                    role: row.try_get(3)?,
                    content: row.try_get(4)?,
                })
            })
            .collect()
    }

    async fn conversation_stats(
        &self,
        sort: StatsSort,
        limit: usize,
    ) -> Result<Vec<ConversationStats>, StoreError> {
        let order = match sort {
            StatsSort::Title => "c.title ASC, c.id",
            StatsSort::Messages => "messages DESC, c.title ASC, c.id",
            StatsSort::Words => "words DESC, c.title ASC, c.id",
        };
        let sql = format!(
            r"SELECT c.id, c.title, c.create_time,
                COUNT(m.id) AS messages,
                COALESCE(SUM(CASE WHEN btrim(m.content) = '' THEN 0
                    ELSE array_length(regexp_split_to_array(btrim(m.content), '\s+'), 1) END), 0)::bigint AS words
             FROM {} c LEFT JOIN {} m ON m.conversation_id = c.id
             GROUP BY c.id, c.title, c.create_time
             ORDER BY {order}
             LIMIT $1",
            self.conversations(),
            self.messages()
        );
        let rows = self.client.query(&sql, &[&as_limit(limit)?]).await?;
        rows.iter()
            .map(|row| {
                Ok(ConversationStats {
                    id: row.try_get(0)?,
                    title: row.try_get(1)?,
                    create_time: row.try_get(2)?,
                    messages: row.try_get(3)?,
                    words: row.try_get(4)?,
                })
            })
            .collect()
    }
}

fn conversation_from_row(row: &Row) -> Result<StoredConversation, StoreError> {
    Ok(StoredConversation {
        id: row.try_get(0)?,
        original_id: row.try_get(1)?,
        title: row.try_get(2)?,
        create_time: row.try_get(3)?,
        update_time: row.try_get(4)?,
        source: row.try_get(5)?,
    })
}

fn message_from_row(row: &Row) -> Result<StoredMessage, StoreError> {
    let embedding: Option<Vector> = row.try_get(9)?;
    Ok(StoredMessage {
        id: row.try_get(0)?,
        conversation_id: row.try_get(1)?,
        original_id: row.try_get(2)?,
        role: row.try_get(3)?,
        author_name: row.try_get(4)?,
        model: row.try_get(5)?,
        content: row.try_get(6)?,
        position: row.try_get(7)?,
        create_time: row.try_get(8)?,
        embedding: embedding.map(|vector| vector.to_vec()),
        embedding_model: row.try_get(10)?,
    })
}

fn as_limit(limit: usize) -> Result<i64, StoreError> {
    i64::try_from(limit).map_err(|_| StoreError::InvalidRow(format!("limit {limit} exceeds i64 range")))
}

/// Escapes `LIKE` wildcards so the needle matches literally.
fn escape_like(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len());
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn limits_fit_in_bigint() {
        assert_eq!(as_limit(25).expect("limit"), 25);
    }
}
