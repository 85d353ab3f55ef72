//! Table naming and schema provisioning for the Postgres store.

use serde::Serialize;
use tokio_postgres::Client;
use tracing::info;

use super::StoreError;

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self, StoreError>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        if schema.trim().is_empty() {
            return Err(StoreError::Setup("schema name is required".to_string()));
        }
        if table.trim().is_empty() {
            return Err(StoreError::Setup("table name is required".to_string()));
        }
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Returns the raw schema string.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Deterministic index name for this table.
    pub fn index_name(&self, suffix: &str) -> String {
        format!(
            "{}_{}_{}",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table),
            sanitize_ident(suffix)
        )
    }
}

/// The two tables the store works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    conversations: TableName,
    messages: TableName,
}

impl Tables {
    /// `conversations` and `messages` inside `schema`.
    pub fn new(schema: &str) -> Result<Self, StoreError> {
        Ok(Self {
            conversations: TableName::new(schema, "conversations")?,
            messages: TableName::new(schema, "messages")?,
        })
    }

    /// Conversations table.
    pub fn conversations(&self) -> &TableName {
        &self.conversations
    }

    /// Messages table.
    pub fn messages(&self) -> &TableName {
        &self.messages
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// What the server reports about the pgvector extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionStatus {
    /// Version the server could install, if pgvector is present at all.
    pub available: Option<String>,
    /// Version installed in this database.
    pub installed: Option<String>,
}

/// Snapshot used by `convoscope-db verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaStatus {
    /// pgvector availability.
    pub extension: ExtensionStatus,
    /// Whether the conversations table exists.
    pub conversations_table: bool,
    /// Whether the messages table exists.
    pub messages_table: bool,
    /// Declared dimension of `messages.embedding`.
    pub embedding_dimensions: Option<i32>,
}

/// Creates the extension, tables, and indexes if missing, then checks that an
/// existing embedding column matches `dims`.
pub async fn prepare(client: &Client, tables: &Tables, dims: usize) -> Result<(), StoreError> {
    ensure_vector_extension(client).await?;
    ensure_schema(client, tables).await?;
    ensure_tables(client, tables, dims).await?;
    ensure_indexes(client, tables).await?;
    verify_embedding_dimensions(client, tables, dims).await?;
    info!(
        conversations = %tables.conversations().qualified(),
        messages = %tables.messages().qualified(),
        dims,
        "schema ready"
    );
    Ok(())
}

/// Reports the current state without changing anything.
pub async fn inspect(client: &Client, tables: &Tables) -> Result<SchemaStatus, StoreError> {
    Ok(SchemaStatus {
        extension: vector_extension_status(client).await?,
        conversations_table: table_exists(client, tables.conversations()).await?,
        messages_table: table_exists(client, tables.messages()).await?,
        embedding_dimensions: embedding_column_dimensions(client, tables).await?,
    })
}

/// Looks up pgvector in `pg_available_extensions`.
pub async fn vector_extension_status(client: &Client) -> Result<ExtensionStatus, StoreError> {
    let row = client
        .query_opt(
            "SELECT default_version, installed_version FROM pg_available_extensions WHERE name = 'vector'",
            &[],
        )
        .await?;
    Ok(match row {
        Some(row) => ExtensionStatus {
            available: row.try_get(0)?,
            installed: row.try_get(1)?,
        },
        None => ExtensionStatus {
            available: None,
            installed: None,
        },
    })
}

async fn ensure_vector_extension(client: &Client) -> Result<(), StoreError> {
    let status = vector_extension_status(client).await?;
    if status.available.is_none() {
        return Err(StoreError::Setup(
            "pgvector is not available on this server: expected an entry named 'vector' in \
             pg_available_extensions, found none. Install pgvector for this Postgres version \
             and rerun `convoscope-db init`."
                .to_string(),
        ));
    }
    if status.installed.is_none() {
        client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS vector")
            .await?;
    }
    Ok(())
}

async fn ensure_schema(client: &Client, tables: &Tables) -> Result<(), StoreError> {
    let sql = format!(
        "CREATE SCHEMA IF NOT EXISTS {}",
        quote_ident(tables.conversations().schema())
    );
    client.batch_execute(&sql).await?;
    Ok(())
}

async fn ensure_tables(client: &Client, tables: &Tables, dims: usize) -> Result<(), StoreError> {
    if dims == 0 {
        return Err(StoreError::Setup(
            "embedding dimension must be positive".to_string(),
        ));
    }
    client
        .batch_execute(&conversations_ddl(tables))
        .await?;
    client
        .batch_execute(&messages_ddl(tables, dims))
        .await?;
    Ok(())
}

fn conversations_ddl(tables: &Tables) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id UUID PRIMARY KEY,
            original_id TEXT NOT NULL,
            title TEXT NOT NULL,
            create_time DOUBLE PRECISION NOT NULL DEFAULT 0,
            update_time DOUBLE PRECISION NOT NULL DEFAULT 0,
            source TEXT NOT NULL,
            meta JSONB NOT NULL DEFAULT '{{}}'::jsonb
        )",
        tables.conversations().qualified()
    )
}

fn messages_ddl(tables: &Tables, dims: usize) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id UUID PRIMARY KEY,
            conversation_id UUID NOT NULL REFERENCES {} (id) ON DELETE CASCADE,
            original_id TEXT NOT NULL,
            role TEXT NOT NULL,
            author_name TEXT,
            model TEXT,
            content TEXT NOT NULL,
            position INTEGER NOT NULL,
            create_time DOUBLE PRECISION NOT NULL DEFAULT 0,
            embedding VECTOR({dims}),
            embedding_model TEXT
        )",
        tables.messages().qualified(),
        tables.conversations().qualified()
    )
}

async fn ensure_indexes(client: &Client, tables: &Tables) -> Result<(), StoreError> {
    let messages = tables.messages();
    let conversations = tables.conversations();
    let statements = [
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (conversation_id, position)",
            messages.index_name("conversation_idx"),
            messages.qualified()
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (original_id)",
            conversations.index_name("original_id_idx"),
            conversations.qualified()
        ),
    ];
    for sql in statements {
        client.batch_execute(&sql).await?;
    }
    Ok(())
}

async fn table_exists(client: &Client, table: &TableName) -> Result<bool, StoreError> {
    let row = client
        .query_one("SELECT to_regclass($1) IS NOT NULL", &[&table.qualified()])
        .await?;
    Ok(row.try_get(0)?)
}

/// Declared dimension of `messages.embedding`, or `None` if the column is missing.
pub async fn embedding_column_dimensions(
    client: &Client,
    tables: &Tables,
) -> Result<Option<i32>, StoreError> {
    let row = client
        .query_opt(
            "SELECT atttypmod FROM pg_attribute \
             WHERE attrelid = to_regclass($1) AND attname = 'embedding' AND NOT attisdropped",
            &[&tables.messages().qualified()],
        )
        .await?;
    match row {
        Some(row) => {
            let typmod: i32 = row.try_get(0)?;
            Ok((typmod > 0).then_some(typmod))
        }
        None => Ok(None),
    }
}

async fn verify_embedding_dimensions(
    client: &Client,
    tables: &Tables,
    dims: usize,
) -> Result<(), StoreError> {
    match embedding_column_dimensions(client, tables).await? {
        Some(found) if usize::try_from(found).ok() != Some(dims) => Err(StoreError::Setup(format!(
            "{}.embedding is VECTOR({found}) but the configured embedding dimension is {dims}; \
             set CONVOSCOPE_EMBEDDING_DIMENSIONS={found} or migrate the column",
            tables.messages().qualified()
        ))),
        _ => Ok(()),
    }
}
