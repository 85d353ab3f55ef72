use std::env;
use std::io::{self, BufWriter, Write};
use std::process;

use chat_archive::{ArchiveReader, ConversationStream};

fn main() {
    if let Err(err) = run() {
        eprintln!("{}: {err}", env!("CARGO_PKG_NAME"));
        process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let mut args = env::args();
    let program = args
        .next()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

    let input = match args.next() {
        Some(flag) if is_help_flag(&flag) => {
            print_help(&program);
            return Ok(());
        }
        Some(flag) if is_version_flag(&flag) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(path) if path == "-" => Input::Stdin,
        Some(path) => Input::File(path),
        None => Input::Stdin,
    };

    if let Some(extra) = args.next() {
        return Err(format!("unexpected argument: {extra}\n{}", usage(&program)));
    }

    let stream = match input {
        Input::Stdin => ArchiveReader::from_reader("<stdin>", io::stdin().lock()),
        Input::File(path) => ArchiveReader::open(&path).map_err(|err| err.to_string())?,
    };
    dump(stream)
}

fn dump(mut stream: ConversationStream) -> Result<(), String> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut kept = 0usize;
    let mut skipped = 0usize;
    for item in stream.by_ref() {
        match item {
            Ok(conversation) => {
                let line = serde_json::to_string(&conversation)
                    .map_err(|err| format!("failed to serialize JSON: {err}"))?;
                writeln!(out, "{line}").map_err(|err| format!("failed to write stdout: {err}"))?;
                kept += 1;
            }
            Err(item) => {
                eprintln!("skipped {item}");
                skipped += 1;
            }
        }
    }
    out.flush()
        .map_err(|err| format!("failed to write stdout: {err}"))?;
    eprintln!(
        "{kept} conversation{} parsed, {skipped} skipped, {} empty",
        if kept == 1 { "" } else { "s" },
        stream.dropped_empty()
    );
    Ok(())
}

enum Input {
    Stdin,
    File(String),
}

fn is_help_flag(arg: &str) -> bool {
    arg == "-h" || arg == "--help"
}

fn is_version_flag(arg: &str) -> bool {
    arg == "-V" || arg == "--version"
}

fn print_help(program: &str) {
    println!(
        "{}\n\nOptions:\n  -h, --help      Show this message\n  -V, --version   Print package version",
        usage(program)
    );
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [ARCHIVE|-]\n\n\
         Provide a chat export (conversations.json or the .zip bundle) or '-' to read \
         a JSON array from stdin. When no argument is passed, stdin is used. \
         Conversations are printed as JSON lines; skipped items are reported on stderr."
    )
}
