//! Markdown export and listing renderers.

use std::fmt::Write as _;

use chrono::DateTime;
use clap::ValueEnum;
use serde::Serialize;
use uuid::Uuid;

use crate::store::{ConversationStats, ConversationStore, StoreError, StoredConversation, StoredMessage};

/// Output format for conversation listings.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ListFormat {
    /// Bordered text table.
    Table,
    /// Comma-separated values with a header row.
    Csv,
    /// Pretty-printed JSON array.
    Json,
}

/// Formats unix seconds as `YYYY-MM-DD HH:MM:SS` (UTC). `None` for
/// placeholder zero timestamps or values chrono cannot represent.
pub fn format_timestamp(secs: f64) -> Option<String> {
    if !secs.is_finite() || secs <= 0.0 {
        return None;
    }
    let whole = secs.trunc();
    let nanos = ((secs - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
        .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Renders one message as a Markdown section.
pub fn render_message(message: &StoredMessage, conversation: &StoredConversation, show_model: bool) -> String {
    let mut out = String::new();
    let role = if message.role.is_empty() { "unknown" } else { &message.role };
    let _ = writeln!(out, "\n## Message");
    let _ = writeln!(out, "**Role:** {role}");
    if let Some(name) = message.author_name.as_deref().filter(|name| !name.is_empty()) {
        let _ = writeln!(out, "**Author:** {name}");
    }
    if !conversation.title.trim().is_empty() {
        let _ = writeln!(out, "**From Conversation:** {}", conversation.title);
    }
    if let Some(created) = format_timestamp(message.create_time) {
        let _ = writeln!(out, "**Created:** {created}");
    }
    if show_model {
        if let Some(model) = message.model.as_deref().or(message.embedding_model.as_deref()) {
            let _ = writeln!(out, "**Model:** {model}");
        }
    }
    let _ = writeln!(out, "\n### Content");
    let _ = writeln!(out, "{}", message.content);
    let _ = writeln!(out, "\n---");
    out
}

/// Renders whatever `id` names: a single message, or every message of a
/// conversation in position order. `None` when it is neither.
pub async fn export_markdown<S: ConversationStore>(
    store: &S,
    id: Uuid,
    show_model: bool,
) -> Result<Option<String>, StoreError> {
    if let Some(message) = store.message(id).await? {
        let Some(conversation) = store.conversation(message.conversation_id).await? else {
            return Err(StoreError::InvalidRow(format!(
                "message {id} references missing conversation {}",
                message.conversation_id
            )));
        };
        return Ok(Some(render_message(&message, &conversation, show_model)));
    }

    let Some(conversation) = store.conversation(id).await? else {
        return Ok(None);
    };
    let messages = store.conversation_messages(id).await?;
    Ok(Some(
        messages
            .iter()
            .map(|message| render_message(message, &conversation, show_model))
            .collect(),
    ))
}

#[derive(Serialize)]
struct ListingRow<'a> {
    id: Uuid,
    title: &'a str,
    messages: i64,
    words: i64,
}

/// Renders a listing in the requested format.
pub fn render_listing(rows: &[ConversationStats], format: ListFormat) -> Result<String, serde_json::Error> {
    match format {
        ListFormat::Table => Ok(render_table(rows)),
        ListFormat::Csv => Ok(render_csv(rows)),
        ListFormat::Json => {
            let rows: Vec<_> = rows
                .iter()
                .map(|row| ListingRow {
                    id: row.id,
                    title: &row.title,
                    messages: row.messages,
                    words: row.words,
                })
                .collect();
            serde_json::to_string_pretty(&rows)
        }
    }
}

fn render_table(rows: &[ConversationStats]) -> String {
    let headers = ["Title", "Messages", "Words"];
    let cells: Vec<[String; 3]> = rows
        .iter()
        .map(|row| [row.title.clone(), row.messages.to_string(), row.words.to_string()])
        .collect();
    let mut widths = headers.map(|header| header.chars().count());
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let rule: String = widths
        .iter()
        .map(|width| "-".repeat(width + 2))
        .collect::<Vec<_>>()
        .join("+");
    let mut out = String::new();
    let _ = writeln!(out, "+{rule}+");
    let _ = writeln!(
        out,
        "| {:<w0$} | {:>w1$} | {:>w2$} |",
        headers[0],
        headers[1],
        headers[2],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2]
    );
    let _ = writeln!(out, "|{rule}|");
    for [title, messages, words] in &cells {
        let pad = widths[0] - title.chars().count();
        let _ = writeln!(
            out,
            "| {title}{} | {messages:>w1$} | {words:>w2$} |",
            " ".repeat(pad),
            w1 = widths[1],
            w2 = widths[2]
        );
    }
    let _ = write!(out, "+{rule}+");
    out
}

fn render_csv(rows: &[ConversationStats]) -> String {
    let mut out = String::from("Title,Messages,Words\n");
    for row in rows {
        let _ = writeln!(out, "{},{},{}", csv_field(&row.title), row.messages, row.words);
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, NewConversation, NewMessage, EXPORT_SOURCE};
    use pretty_assertions::assert_eq;

    fn stats(title: &str, messages: i64, words: i64) -> ConversationStats {
        ConversationStats {
            id: Uuid::nil(),
            title: title.to_string(),
            create_time: 0.0,
            messages,
            words,
        }
    }

    #[test]
    fn timestamps_render_in_utc() {
        assert_eq!(format_timestamp(1_700_000_000.5).as_deref(), Some("2023-11-14 22:13:20"));
        assert_eq!(format_timestamp(0.0), None);
        assert_eq!(format_timestamp(f64::NAN), None);
    }

    #[test]
    fn table_aligns_columns() {
        let table = render_listing(&[stats("Rust", 12, 340), stats("Weather", 3, 9)], ListFormat::Table)
            .expect("table");
        let expected = "\
+---------+----------+-------+
| Title   | Messages | Words |
|---------+----------+-------|
| Rust    |       12 |   340 |
| Weather |        3 |     9 |
+---------+----------+-------+";
        assert_eq!(table, expected);
    }

    #[test]
    fn csv_quotes_titles_with_separators() {
        let csv = render_listing(&[stats("Hello, \"world\"", 1, 2)], ListFormat::Csv).expect("csv");
        assert_eq!(csv, "Title,Messages,Words\n\"Hello, \"\"world\"\"\",1,2\n");
    }

    #[test]
    fn json_lists_counts() {
        let json = render_listing(&[stats("Rust", 2, 5)], ListFormat::Json).expect("json");
        let parsed: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed[0]["title"], "Rust");
        assert_eq!(parsed[0]["messages"], 2);
        assert_eq!(parsed[0]["words"], 5);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn exports_messages_and_whole_conversations() {
        let mut store = MemoryStore::new();
        let id = store
            .save_conversation(
                &NewConversation {
                    original_id: "c1".to_string(),
                    title: "Borrowing".to_string(),
                    create_time: 1_700_000_000.0,
                    update_time: 1_700_000_100.0,
                    source: EXPORT_SOURCE.to_string(),
                },
                &[
                    NewMessage {
                        original_id: "m0".to_string(),
                        role: "user".to_string(),
                        author_name: None,
                        model: None,
                        content: "What is a borrow?".to_string(),
                        position: 0,
                        create_time: 1_700_000_000.0,
                    },
                    NewMessage {
                        original_id: "m1".to_string(),
                        role: "assistant".to_string(),
                        author_name: None,
                        model: Some("gpt-4o".to_string()),
                        content: "A reference.".to_string(),
                        position: 1,
                        create_time: 0.0,
                    },
                ],
            )
            .await
            .expect("save");
        let messages = store.conversation_messages(id).await.expect("messages");

        let single = export_markdown(&store, messages[1].id, true)
            .await
            .expect("export")
            .expect("found");
        assert_eq!(
            single,
            "\n## Message\n**Role:** assistant\n**From Conversation:** Borrowing\n**Model:** gpt-4o\n\n### Content\nA reference.\n\n---\n"
        );

        let whole = export_markdown(&store, id, false).await.expect("export").expect("found");
        assert_eq!(whole.matches("## Message").count(), 2);
        assert!(whole.contains("**Created:** 2023-11-14 22:13:20"));
        assert!(!whole.contains("**Model:**"));
        assert!(whole.find("What is a borrow?") < whole.find("A reference."));

        assert_eq!(export_markdown(&store, Uuid::new_v4(), false).await.expect("export"), None);
    }
}
