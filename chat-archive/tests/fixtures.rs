use std::fs::File;
use std::io::Write;
use std::path::Path;

use pretty_assertions::assert_eq;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use chat_archive::{ArchiveReader, CanonicalConversation, ParseReport, SkipReason};

fn expected_conversations() -> Vec<CanonicalConversation> {
    serde_json::from_str(include_str!("fixtures/expected/conversations.json"))
        .expect("expected fixture parses")
}

fn write_zip(path: &Path, entries: &[(&str, CompressionMethod, &str)]) {
    let file = File::create(path).expect("create zip");
    let mut writer = ZipWriter::new(file);
    for (name, method, body) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default().compression_method(*method))
            .expect("start entry");
        writer.write_all(body.as_bytes()).expect("write entry");
    }
    writer.finish().expect("finish zip");
}

#[test]
fn export_fixture_matches_expected_output() {
    let stream = ArchiveReader::open("tests/fixtures/conversations.json").expect("open fixture");
    let report = ParseReport::collect(stream);

    assert_eq!(report.conversations, expected_conversations());
    assert!(report.skipped.is_empty(), "unexpected skips: {:?}", report.skipped);
    assert_eq!(report.dropped_empty, 1);
}

#[test]
fn broken_items_are_skipped_without_losing_good_ones() {
    let stream = ArchiveReader::open("tests/fixtures/broken.json").expect("open fixture");
    let report = ParseReport::collect(stream);

    let ids: Vec<_> = report.conversations.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["good"]);
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.skipped[0].index, Some(1));
    assert!(matches!(report.skipped[0].reason, SkipReason::Decode(_)));
    assert_eq!(report.skipped[1].index, Some(2));
    assert!(matches!(report.skipped[1].reason, SkipReason::Truncated { .. }));
}

#[test]
fn zip_bundles_stream_json_entries_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("export.zip");
    let extra = r#"[{"id": "extra", "title": "Stored entry", "mapping": {"m": {"message": {"author": {"role": "user"}, "content": "plain", "create_time": 9}}}}]"#;
    write_zip(
        &path,
        &[
            ("README.txt", CompressionMethod::Stored, "not json"),
            (
                "conversations.json",
                CompressionMethod::Deflated,
                include_str!("fixtures/conversations.json"),
            ),
            ("user.json", CompressionMethod::Deflated, r#"{"email": "someone@example.com"}"#),
            ("nested/extra.json", CompressionMethod::Stored, extra),
        ],
    );

    let report = ParseReport::collect(ArchiveReader::open(&path).expect("open zip"));

    let ids: Vec<_> = report.conversations.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["conv-rust", "conv-weather", "unknown", "extra"]);
    assert_eq!(&report.conversations[..3], &expected_conversations()[..]);
    assert_eq!(report.dropped_empty, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].origin, "user.json");
    assert!(matches!(report.skipped[0].reason, SkipReason::NotAnArray));
}

#[test]
fn zip_extension_is_case_insensitive() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("EXPORT.ZIP");
    write_zip(
        &path,
        &[(
            "conversations.json",
            CompressionMethod::Deflated,
            include_str!("fixtures/conversations.json"),
        )],
    );

    let report = ParseReport::collect(ArchiveReader::open(&path).expect("open zip"));
    assert_eq!(report.conversations, expected_conversations());
}

#[test]
fn reopening_rereads_the_source() {
    let first = ArchiveReader::open("tests/fixtures/conversations.json")
        .expect("open fixture")
        .filter_map(Result::ok)
        .count();
    let second = ArchiveReader::open("tests/fixtures/conversations.json")
        .expect("open fixture")
        .filter_map(Result::ok)
        .count();
    assert_eq!(first, 3);
    assert_eq!(second, first);
}

#[test]
fn missing_file_is_an_open_error() {
    let err = ArchiveReader::open("tests/fixtures/does-not-exist.json")
        .err()
        .expect("missing file fails");
    assert!(err.to_string().contains("does-not-exist.json"));
}
