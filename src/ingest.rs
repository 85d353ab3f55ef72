//! Archive → store import.

use std::borrow::Cow;
use std::path::Path;

use chat_archive::{ArchiveError, ArchiveReader, CanonicalConversation, ConversationStream, SkippedItem};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{ConversationStore, NewConversation, NewMessage, StoreError, EXPORT_SOURCE};

/// Import failures that stop the run.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The archive could not be opened.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    /// Saving a conversation failed; earlier conversations stay committed.
    #[error("failed to save conversation {original_id}: {source}")]
    Store {
        /// Export id of the conversation being saved.
        original_id: String,
        /// Underlying store error.
        source: StoreError,
    },
}

/// One conversation written to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedConversation {
    /// New store id.
    pub id: Uuid,
    /// Export id.
    pub original_id: String,
    /// Title as stored.
    pub title: String,
    /// Messages written.
    pub messages: usize,
}

/// Outcome of an import run.
#[derive(Debug, Default)]
pub struct ImportReport {
    /// Conversations written, in archive order.
    pub imported: Vec<ImportedConversation>,
    /// Items the parser could not decode.
    pub skipped: Vec<SkippedItem>,
    /// Conversations dropped for having no messages.
    pub dropped_empty: usize,
}

impl ImportReport {
    /// Total messages written.
    pub fn message_count(&self) -> usize {
        self.imported.iter().map(|conversation| conversation.messages).sum()
    }
}

/// Opens `path` and imports every conversation in it.
pub async fn import_archive<S: ConversationStore>(
    store: &mut S,
    path: &Path,
) -> Result<ImportReport, ImportError> {
    let stream = ArchiveReader::open(path)?;
    info!(archive = %path.display(), "importing archive");
    import_stream(store, stream, |_| {}).await
}

/// Imports a stream, one transaction per conversation. `on_saved` runs after
/// each commit.
pub async fn import_stream<S, F>(
    store: &mut S,
    mut stream: ConversationStream,
    mut on_saved: F,
) -> Result<ImportReport, ImportError>
where
    S: ConversationStore,
    F: FnMut(&ImportedConversation),
{
    let mut report = ImportReport::default();
    for item in stream.by_ref() {
        let conversation = match item {
            Ok(conversation) => conversation,
            Err(skipped) => {
                report.skipped.push(skipped);
                continue;
            }
        };
        let (record, messages) = to_records(&conversation);
        let id = store
            .save_conversation(&record, &messages)
            .await
            .map_err(|source| ImportError::Store {
                original_id: record.original_id.clone(),
                source,
            })?;
        let imported = ImportedConversation {
            id,
            original_id: record.original_id,
            title: record.title,
            messages: messages.len(),
        };
        on_saved(&imported);
        report.imported.push(imported);
    }
    report.dropped_empty = stream.dropped_empty();

    if !report.skipped.is_empty() {
        warn!(skipped = report.skipped.len(), "some archive items were skipped");
    }
    info!(
        conversations = report.imported.len(),
        messages = report.message_count(),
        dropped_empty = report.dropped_empty,
        "import finished"
    );
    Ok(report)
}

/// Converts a canonical conversation into sanitized insert records, keeping
/// message order as positions.
pub fn to_records(conversation: &CanonicalConversation) -> (NewConversation, Vec<NewMessage>) {
    let record = NewConversation {
        original_id: sanitize_text(&conversation.id).into_owned(),
        title: sanitize_text(&conversation.title).into_owned(),
        create_time: conversation.create_time,
        update_time: conversation.update_time,
        source: EXPORT_SOURCE.to_string(),
    };
    let messages = conversation
        .messages
        .iter()
        .enumerate()
        .map(|(position, message)| NewMessage {
            original_id: sanitize_text(&message.id).into_owned(),
            role: sanitize_text(&message.role).into_owned(),
            author_name: message
                .author_name
                .as_deref()
                .map(|name| sanitize_text(name).into_owned()),
            model: message.model.as_deref().map(|model| sanitize_text(model).into_owned()),
            content: sanitize_text(&message.content).into_owned(),
            position: i32::try_from(position).unwrap_or(i32::MAX),
            create_time: message.create_time,
        })
        .collect();
    (record, messages)
}

/// Removes NUL characters, which Postgres text columns reject.
pub fn sanitize_text(text: &str) -> Cow<'_, str> {
    if text.contains('\0') {
        Cow::Owned(text.replace('\0', ""))
    } else {
        Cow::Borrowed(text)
    }
}
