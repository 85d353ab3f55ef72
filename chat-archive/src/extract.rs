//! Recursive text extraction from nested message content.

use serde_json::{Map, Value};
use tracing::warn;

use crate::coerce::coerce_string;

/// Keys that hold a message body, highest priority first. The first one
/// present wins even when its value is `null`.
pub const CONTENT_KEYS: [&str; 5] = ["content", "parts", "text", "value", "message"];

/// Nesting depth after which extraction gives up on a branch.
pub const MAX_EXTRACTION_DEPTH: usize = 128;

/// Flattens any content node into human-readable text.
///
/// Strings pass through untouched, sequences and key-less objects are joined
/// with single spaces, and objects carrying one of [`CONTENT_KEYS`] descend
/// into that key only. Scalars fall back to [`coerce_string`].
pub fn extract_content(node: &Value) -> String {
    extract_at(node, 0)
}

/// [`extract_content`] for an object that is already unwrapped, such as a
/// message node.
pub fn extract_map(map: &Map<String, Value>) -> String {
    extract_object(map, 0)
}

fn extract_at(node: &Value, depth: usize) -> String {
    if depth > MAX_EXTRACTION_DEPTH {
        warn!(depth, "content nesting too deep; dropping branch");
        return String::new();
    }
    match node {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => join_extracted(items.iter(), depth),
        Value::Object(map) => extract_object(map, depth),
        scalar => coerce_string(scalar),
    }
}

fn extract_object(map: &Map<String, Value>, depth: usize) -> String {
    match CONTENT_KEYS.iter().find_map(|key| map.get(*key)) {
        Some(inner) => extract_at(inner, depth + 1),
        None => join_extracted(map.values(), depth),
    }
}

fn join_extracted<'a>(nodes: impl Iterator<Item = &'a Value>, depth: usize) -> String {
    nodes
        .map(|node| extract_at(node, depth + 1))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unwrapped_maps_follow_the_same_priority() {
        let node = json!({"id": "m", "parts": ["hello", "there"], "text": "ignored"});
        let map = node.as_object().expect("object");
        assert_eq!(extract_map(map), "hello there");
        assert_eq!(extract_map(map), extract_content(&node));
    }

    #[test]
    fn nested_parts_join_with_spaces() {
        assert_eq!(
            extract_content(&json!({"content": {"parts": ["a", "b"]}})),
            "a b"
        );
    }

    #[test]
    fn key_priority_is_content_parts_text_value_message() {
        let node = json!({
            "message": "m",
            "value": "v",
            "text": "t",
            "parts": ["p"],
            "content": "c",
        });
        assert_eq!(extract_content(&node), "c");
        assert_eq!(
            extract_content(&json!({"message": "m", "value": "v", "text": "t", "parts": ["p"]})),
            "p"
        );
        assert_eq!(
            extract_content(&json!({"message": "m", "value": "v", "text": "t"})),
            "t"
        );
        assert_eq!(extract_content(&json!({"message": "m", "value": "v"})), "v");
        assert_eq!(extract_content(&json!({"message": "m"})), "m");
    }

    #[test]
    fn present_null_key_still_wins() {
        assert_eq!(extract_content(&json!({"content": null, "text": "ignored"})), "");
    }

    #[test]
    fn keyless_objects_join_values_in_document_order() {
        assert_eq!(
            extract_content(&json!({"b": "first", "a": ["second", 3]})),
            "first second 3"
        );
    }

    #[test]
    fn scalars_render_as_text() {
        assert_eq!(extract_content(&json!(null)), "");
        assert_eq!(extract_content(&json!(12)), "12");
        assert_eq!(extract_content(&json!(false)), "false");
        assert_eq!(extract_content(&json!(["x", null, "y"])), "x  y");
    }

    #[test]
    fn extraction_is_idempotent() {
        let samples = [
            json!({"content": {"content_type": "text", "parts": ["hello", {"text": "world"}]}}),
            json!([1, [2, [3]], {"value": "four"}]),
            json!("already flat"),
            json!({"unknown": {"nested": true}}),
        ];
        for sample in samples {
            let once = extract_content(&sample);
            assert_eq!(extract_content(&Value::String(once.clone())), once);
        }
    }

    #[test]
    fn runaway_nesting_degrades_to_empty() {
        let mut node = json!("deep");
        for _ in 0..(MAX_EXTRACTION_DEPTH + 8) {
            node = json!({ "content": node });
        }
        assert_eq!(extract_content(&node), "");
    }
}
