use std::io::Write;
use std::process::{Command, Stdio};

use chat_archive::CanonicalConversation;

fn parse_lines(stdout: &[u8]) -> Vec<CanonicalConversation> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("stdout line is a conversation"))
        .collect()
}

#[test]
fn cli_reads_file_path() {
    let output = Command::new(env!("CARGO_BIN_EXE_chat_archive"))
        .arg("tests/fixtures/conversations.json")
        .output()
        .expect("run CLI");

    assert!(
        output.status.success(),
        "cli exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    let expected: Vec<CanonicalConversation> =
        serde_json::from_str(include_str!("fixtures/expected/conversations.json"))
            .expect("expected fixture parses");
    assert_eq!(parse_lines(&output.stdout), expected);
    assert!(String::from_utf8_lossy(&output.stderr)
        .contains("3 conversations parsed, 0 skipped, 1 empty"));
}

#[test]
fn cli_reads_stdin_when_no_args() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_chat_archive"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn CLI");

    let json = include_str!("fixtures/broken.json");
    child
        .stdin
        .as_mut()
        .expect("stdin open")
        .write_all(json.as_bytes())
        .expect("write stdin");

    let output = child.wait_with_output().expect("read CLI output");
    assert!(
        output.status.success(),
        "cli exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    let conversations = parse_lines(&output.stdout);
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].id, "good");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("skipped <stdin> item 1: invalid JSON"), "{stderr}");
    assert!(stderr.contains("1 conversation parsed, 2 skipped, 0 empty"), "{stderr}");
}

#[test]
fn cli_rejects_missing_archive() {
    let output = Command::new(env!("CARGO_BIN_EXE_chat_archive"))
        .arg("tests/fixtures/nope.zip")
        .output()
        .expect("run CLI");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to open"));
}

#[test]
fn cli_prints_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_chat_archive"))
        .arg("--help")
        .output()
        .expect("run CLI");

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("Usage: "));
}
