#![warn(missing_docs)]
//! Schema-tolerant decoding of exported chat archives.
//!
//! Exports store each conversation as an unordered `mapping` of node ids to
//! message nodes whose author and content encodings vary between export
//! versions. This crate recovers ordered, canonical records from that shape and
//! streams them out of plain JSON files or zip bundles without loading the
//! whole archive into memory.

pub mod coerce;
pub mod extract;
pub mod stream;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub use coerce::{coerce_float, coerce_string};
pub use extract::{extract_content, extract_map};
pub use stream::{ArchiveError, ArchiveReader, ConversationStream, ParseReport, SkipReason, SkippedItem};

/// Role assigned when a node carries no usable author information.
pub const UNKNOWN_ROLE: &str = "unknown";
/// Title assigned when a conversation has none.
pub const UNTITLED: &str = "Untitled";

/// A single message recovered from a mapping node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// Message id, or the conversation id when the node has none.
    pub id: String,
    /// Id of the owning conversation.
    pub conversation_id: String,
    /// Author role (`user`, `assistant`, `system`, `tool`, ...).
    pub role: String,
    /// Display name of the author, when the export records one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    /// Model slug recorded in the node metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Flattened text content; empty when nothing could be extracted.
    pub content: String,
    /// Unix seconds, `0.0` when unknown.
    pub create_time: f64,
}

impl CanonicalMessage {
    fn placeholder(conversation_id: &str) -> Self {
        Self {
            id: conversation_id.to_string(),
            conversation_id: conversation_id.to_string(),
            role: UNKNOWN_ROLE.to_string(),
            author_name: None,
            model: None,
            content: String::new(),
            create_time: 0.0,
        }
    }
}

/// A conversation with its messages ordered by creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalConversation {
    /// Conversation id from the export.
    pub id: String,
    /// Conversation title.
    pub title: String,
    /// Unix seconds, `0.0` when unknown.
    pub create_time: f64,
    /// Unix seconds, `0.0` when unknown.
    pub update_time: f64,
    /// Messages sorted ascending by `create_time`.
    pub messages: Vec<CanonicalMessage>,
}

impl CanonicalConversation {
    fn placeholder() -> Self {
        Self {
            id: "unknown".to_string(),
            title: "Unknown".to_string(),
            create_time: 0.0,
            update_time: 0.0,
            messages: Vec::new(),
        }
    }
}

/// Why a mapping node could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The node is not a JSON object.
    #[error("node is not an object")]
    NotAnObject,
    /// The node is an empty object.
    #[error("node is empty")]
    Empty,
    /// The node has a `message` key holding something other than an object
    /// (export roots carry `"message": null`).
    #[error("node has no message payload")]
    NoMessage,
}

/// A mapping entry that was skipped while normalizing a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedNode {
    /// Key of the entry inside `mapping`.
    pub node_id: String,
    /// Why the entry was skipped.
    pub reason: NodeError,
}

/// A normalized conversation plus the mapping entries that were skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationReport {
    /// The normalized conversation.
    pub conversation: CanonicalConversation,
    /// Entries that did not yield a message.
    pub skipped: Vec<SkippedNode>,
}

/// Normalizes a node, reporting the cases where no message can be recovered.
pub fn try_normalize_message(
    raw: &Value,
    conversation_id: &str,
) -> Result<CanonicalMessage, NodeError> {
    let node = raw.as_object().ok_or(NodeError::NotAnObject)?;
    if node.is_empty() {
        return Err(NodeError::Empty);
    }
    let message = match node.get("message") {
        Some(Value::Object(inner)) => inner,
        Some(_) => return Err(NodeError::NoMessage),
        None => node,
    };

    Ok(CanonicalMessage {
        id: present(message, "id")
            .map(coerce_string)
            .unwrap_or_else(|| conversation_id.to_string()),
        conversation_id: conversation_id.to_string(),
        role: resolve_role(message),
        author_name: author(message)
            .and_then(|author| present(author, "name"))
            .map(coerce_string)
            .filter(|name| !name.trim().is_empty()),
        model: message
            .get("metadata")
            .and_then(Value::as_object)
            .and_then(|metadata| present(metadata, "model_slug"))
            .map(coerce_string)
            .filter(|slug| !slug.trim().is_empty()),
        content: extract_map(message),
        create_time: message.get("create_time").map(coerce_float).unwrap_or(0.0),
    })
}

/// Normalizes a node into a message, falling back to a placeholder record
/// (`role = "unknown"`, empty content) when nothing can be recovered.
pub fn normalize_message(raw: &Value, conversation_id: &str) -> CanonicalMessage {
    try_normalize_message(raw, conversation_id).unwrap_or_else(|reason| {
        debug!(conversation = conversation_id, %reason, "using placeholder message");
        CanonicalMessage::placeholder(conversation_id)
    })
}

/// Normalizes a conversation node, discarding the skipped-entry diagnostics.
pub fn normalize_conversation(raw: &Value) -> CanonicalConversation {
    normalize_conversation_report(raw).conversation
}

/// Normalizes a conversation node and reports which mapping entries were skipped.
pub fn normalize_conversation_report(raw: &Value) -> ConversationReport {
    let Some(node) = raw.as_object() else {
        return ConversationReport {
            conversation: CanonicalConversation::placeholder(),
            skipped: Vec::new(),
        };
    };

    let id = present(node, "id")
        .map(coerce_string)
        .unwrap_or_else(|| "unknown".to_string());
    let title = present(node, "title")
        .map(coerce_string)
        .unwrap_or_else(|| UNTITLED.to_string());

    let mut messages = Vec::new();
    let mut skipped = Vec::new();
    if let Some(mapping) = node.get("mapping").and_then(Value::as_object) {
        for (node_id, entry) in mapping {
            match try_normalize_message(entry, &id) {
                Ok(message) => messages.push(message),
                Err(reason) => {
                    debug!(conversation = %id, node = %node_id, %reason, "skipping mapping entry");
                    skipped.push(SkippedNode {
                        node_id: node_id.clone(),
                        reason,
                    });
                }
            }
        }
    }
    messages.sort_by(|a, b| a.create_time.total_cmp(&b.create_time));

    ConversationReport {
        conversation: CanonicalConversation {
            create_time: node.get("create_time").map(coerce_float).unwrap_or(0.0),
            update_time: node.get("update_time").map(coerce_float).unwrap_or(0.0),
            id,
            title,
            messages,
        },
        skipped,
    }
}

fn author(message: &Map<String, Value>) -> Option<&Map<String, Value>> {
    message.get("author").and_then(Value::as_object)
}

fn resolve_role(message: &Map<String, Value>) -> String {
    author(message)
        .and_then(|author| present(author, "role"))
        .into_iter()
        .chain(present(message, "role"))
        .map(coerce_string)
        .find(|role| !role.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_ROLE.to_string())
}

/// Looks up a key, treating an explicit `null` as absent.
fn present<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|value| !value.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn message(id: &str, role: &str, content: &str, create_time: f64) -> CanonicalMessage {
        CanonicalMessage {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            role: role.to_string(),
            author_name: None,
            model: None,
            content: content.to_string(),
            create_time,
        }
    }

    #[test]
    fn two_node_mapping_sorts_by_create_time() {
        let raw = json!({
            "id": "c1",
            "title": "Greetings",
            "create_time": 1.0,
            "update_time": 3.0,
            "mapping": {
                "a": {"message": {"id": "a", "author": {"role": "user"}, "content": {"parts": ["hello"]}, "create_time": 2}},
                "b": {"message": {"id": "b", "author": {"role": "assistant"}, "content": {"parts": ["world"]}, "create_time": 1}},
            }
        });

        let conversation = normalize_conversation(&raw);
        assert_eq!(
            conversation,
            CanonicalConversation {
                id: "c1".to_string(),
                title: "Greetings".to_string(),
                create_time: 1.0,
                update_time: 3.0,
                messages: vec![
                    message("b", "assistant", "world", 1.0),
                    message("a", "user", "hello", 2.0),
                ],
            }
        );
    }

    #[test]
    fn ordering_does_not_depend_on_mapping_order() {
        let forward = json!({"id": "c1", "mapping": {
            "x": {"message": {"id": "x", "create_time": 30}},
            "y": {"message": {"id": "y", "create_time": 10}},
            "z": {"message": {"id": "z", "create_time": 20}},
        }});
        let reversed = json!({"id": "c1", "mapping": {
            "z": {"message": {"id": "z", "create_time": 20}},
            "y": {"message": {"id": "y", "create_time": 10}},
            "x": {"message": {"id": "x", "create_time": 30}},
        }});
        let ids = |raw: &Value| {
            normalize_conversation(raw)
                .messages
                .into_iter()
                .map(|m| m.id)
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&forward), vec!["y", "z", "x"]);
        assert_eq!(ids(&reversed), vec!["y", "z", "x"]);
    }

    #[test]
    fn role_falls_back_through_author_then_top_level() {
        let from_author = json!({"author": {"role": "tool", "name": "browser"}, "role": "user"});
        let from_top = json!({"author": {"role": null}, "role": "system"});
        let missing = json!({"author": "someone", "content": "hi"});

        let tool = normalize_message(&from_author, "c1");
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.author_name.as_deref(), Some("browser"));
        assert_eq!(normalize_message(&from_top, "c1").role, "system");
        assert_eq!(normalize_message(&missing, "c1").role, UNKNOWN_ROLE);
    }

    #[test]
    fn missing_or_null_id_defaults_to_conversation() {
        assert_eq!(normalize_message(&json!({"content": "x"}), "c9").id, "c9");
        assert_eq!(normalize_message(&json!({"id": null}), "c9").id, "c9");
        assert_eq!(normalize_message(&json!({"id": 17}), "c9").id, "17");
    }

    #[test]
    fn model_slug_is_lifted_from_metadata() {
        let raw = json!({"message": {"metadata": {"model_slug": "gpt-4o"}, "content": {"parts": ["ok"]}}});
        let normalized = normalize_message(&raw, "c1");
        assert_eq!(normalized.model.as_deref(), Some("gpt-4o"));
        assert_eq!(normalized.content, "ok");
    }

    #[test]
    fn content_is_extracted_from_the_whole_message_node() {
        let parts_only = json!({"message": {"id": "m", "author": {"role": "user"}, "parts": ["hello"], "create_time": 1}});
        assert_eq!(normalize_message(&parts_only, "c").content, "hello");

        let text_only = json!({"role": "user", "text": "plain text node"});
        let normalized = normalize_message(&text_only, "c");
        assert_eq!(normalized.content, "plain text node");
        assert_eq!(normalized.role, "user");

        let null_content = json!({"message": {"content": null, "text": "shadowed"}});
        assert_eq!(normalize_message(&null_content, "c").content, "");
    }

    #[test]
    fn malformed_nodes_never_fail() {
        let inputs = [
            json!(null),
            json!(42),
            json!("text"),
            json!([]),
            json!({}),
            json!({"message": null}),
            json!({"message": [1, 2]}),
            json!({"message": {"author": 5, "content": {"parts": [null, {"x": 1}]}, "create_time": "soon"}}),
        ];
        for input in &inputs {
            let normalized = normalize_message(input, "c1");
            assert_eq!(normalized.conversation_id, "c1");
            assert!(!normalized.role.is_empty());
            assert!(normalized.create_time.is_finite());
        }
        assert_eq!(try_normalize_message(&json!(3), "c1"), Err(NodeError::NotAnObject));
        assert_eq!(try_normalize_message(&json!({}), "c1"), Err(NodeError::Empty));
        assert_eq!(
            try_normalize_message(&json!({"message": null, "parent": "p"}), "c1"),
            Err(NodeError::NoMessage)
        );
    }

    #[test]
    fn non_object_conversation_yields_placeholder() {
        let conversation = normalize_conversation(&json!(["not", "a", "conversation"]));
        assert_eq!(conversation.id, "unknown");
        assert_eq!(conversation.title, "Unknown");
        assert!(conversation.messages.is_empty());
    }

    #[test]
    fn null_title_becomes_untitled() {
        let conversation = normalize_conversation(&json!({"id": "c1", "title": null}));
        assert_eq!(conversation.title, UNTITLED);
        assert_eq!(conversation.create_time, 0.0);
    }

    #[test]
    fn unparseable_entries_are_reported_not_emitted() {
        let raw = json!({"id": "c1", "mapping": {
            "root": {"id": "root", "message": null, "children": ["m1"]},
            "junk": 7,
            "m1": {"message": {"id": "m1", "author": {"role": "user"}, "content": {"parts": ["hi"]}}},
        }});
        let report = normalize_conversation_report(&raw);
        assert_eq!(report.conversation.messages.len(), 1);
        assert_eq!(
            report.skipped,
            vec![
                SkippedNode {
                    node_id: "root".to_string(),
                    reason: NodeError::NoMessage
                },
                SkippedNode {
                    node_id: "junk".to_string(),
                    reason: NodeError::NotAnObject
                },
            ]
        );
    }

    #[test]
    fn wholly_unparseable_mapping_has_no_messages() {
        let raw = json!({"id": "c1", "mapping": {"a": null, "b": {"message": false}}});
        assert!(normalize_conversation(&raw).messages.is_empty());
        let no_mapping = json!({"id": "c2", "mapping": "oops"});
        assert!(normalize_conversation(&no_mapping).messages.is_empty());
    }
}
