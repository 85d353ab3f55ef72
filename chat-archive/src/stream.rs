//! Incremental archive reading.
//!
//! Exports can run to gigabytes, so nothing here materializes the whole
//! document. A byte-level scanner splits the top-level JSON array into items,
//! keeping only the item currently being decoded in memory, and zip bundles
//! are walked entry by entry straight from the file.

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use flate2::read::DeflateDecoder;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use zip::{CompressionMethod, ZipArchive};

use crate::{normalize_conversation_report, CanonicalConversation};

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Failure to open an archive at all.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The file could not be opened.
    #[error("failed to open {path:?}: {source}")]
    Open {
        /// Path that was requested.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The zip central directory could not be read.
    #[error("failed to read zip archive {path:?}: {source}")]
    Zip {
        /// Path that was requested.
        path: PathBuf,
        /// Underlying zip error.
        source: zip::result::ZipError,
    },
}

/// Why an item (or a whole entry) was skipped.
#[derive(Debug, Error)]
pub enum SkipReason {
    /// Reading the underlying stream failed.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    /// The document does not start with `[`.
    #[error("document is not a JSON array")]
    NotAnArray,
    /// The document ended before the array was closed.
    #[error("document ended inside the array ({bytes} trailing bytes)")]
    Truncated {
        /// Bytes of the partial item that were buffered.
        bytes: usize,
    },
    /// The item bytes are not valid JSON.
    #[error("invalid JSON: {0}")]
    Decode(#[from] serde_json::Error),
    /// A zip entry uses a compression method other than stored or deflate.
    #[error("unsupported compression method {0}")]
    UnsupportedCompression(String),
    /// A zip entry is encrypted.
    #[error("entry is encrypted")]
    Encrypted,
    /// A zip entry header could not be read.
    #[error("unreadable zip entry: {0}")]
    Entry(zip::result::ZipError),
}

/// Diagnostic for a skipped item.
#[derive(Debug)]
pub struct SkippedItem {
    /// File path or zip entry name the item came from.
    pub origin: String,
    /// Zero-based position of the item in its array, if one was reached.
    pub index: Option<usize>,
    /// What went wrong.
    pub reason: SkipReason,
}

impl fmt::Display for SkippedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{} item {}: {}", self.origin, index, self.reason),
            None => write!(f, "{}: {}", self.origin, self.reason),
        }
    }
}

/// Opens archives as conversation streams.
pub struct ArchiveReader;

impl ArchiveReader {
    /// Opens `path`, treating `.zip` files (any case) as bundles of `.json` entries
    /// and anything else as a single JSON document.
    pub fn open(path: impl AsRef<Path>) -> Result<ConversationStream, ArchiveError> {
        let path = path.as_ref();
        let sources = if is_zip(path) {
            plan_zip_entries(path)?
        } else {
            let file = File::open(path).map_err(|source| ArchiveError::Open {
                path: path.to_path_buf(),
                source,
            })?;
            let reader: Box<dyn BufRead> = Box::new(BufReader::new(file));
            VecDeque::from([Source::Document {
                origin: path.display().to_string(),
                reader,
            }])
        };
        Ok(ConversationStream::new(path.to_path_buf(), sources))
    }

    /// Streams conversations from an already-open JSON document (stdin, a socket).
    pub fn from_reader(origin: impl Into<String>, reader: impl BufRead + 'static) -> ConversationStream {
        let reader: Box<dyn BufRead> = Box::new(reader);
        ConversationStream::new(
            PathBuf::new(),
            VecDeque::from([Source::Document {
                origin: origin.into(),
                reader,
            }]),
        )
    }
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

enum Source {
    Document {
        origin: String,
        reader: Box<dyn BufRead>,
    },
    ZipEntry(ZipEntryPlan),
    Broken(SkippedItem),
}

/// Location of a zip entry's payload, captured up front so entries can be read
/// through a fresh file handle without borrowing the archive.
struct ZipEntryPlan {
    name: String,
    data_start: u64,
    compressed_size: u64,
    compression: CompressionMethod,
    encrypted: bool,
    crc32: u32,
}

impl ZipEntryPlan {
    fn open(&self, archive: &Path) -> Result<Box<dyn BufRead>, SkipReason> {
        if self.encrypted {
            return Err(SkipReason::Encrypted);
        }
        let mut file = File::open(archive)?;
        file.seek(SeekFrom::Start(self.data_start))?;
        let payload = BufReader::new(file).take(self.compressed_size);
        // Inflating here bypasses the zip crate's reader, so the entry CRC is
        // checked by `CrcCheck` once the payload is read to the end.
        let inflated: Box<dyn Read> = match self.compression {
            CompressionMethod::Stored => Box::new(payload),
            CompressionMethod::Deflated => Box::new(DeflateDecoder::new(payload)),
            other => return Err(SkipReason::UnsupportedCompression(format!("{other:?}"))),
        };
        Ok(Box::new(BufReader::new(CrcCheck::new(
            inflated,
            self.crc32,
            self.name.clone(),
        ))))
    }
}

/// Hashes everything read through it and fails at end of input when the
/// CRC-32 differs from the one recorded in the zip directory.
struct CrcCheck<R> {
    inner: R,
    hasher: Crc32,
    expected: u32,
    name: String,
}

impl<R: Read> CrcCheck<R> {
    fn new(inner: R, expected: u32, name: String) -> Self {
        Self {
            inner,
            hasher: Crc32::new(),
            expected,
            name,
        }
    }
}

impl<R: Read> Read for CrcCheck<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read > 0 {
            self.hasher.update(&buf[..read]);
            return Ok(read);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let actual = self.hasher.clone().finalize();
        if actual != self.expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "CRC-32 mismatch in {}: expected {:08x}, computed {actual:08x}",
                    self.name, self.expected
                ),
            ));
        }
        Ok(0)
    }
}

fn plan_zip_entries(path: &Path) -> Result<VecDeque<Source>, ArchiveError> {
    let file = File::open(path).map_err(|source| ArchiveError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|source| ArchiveError::Zip {
        path: path.to_path_buf(),
        source,
    })?;

    let mut sources = VecDeque::new();
    for index in 0..archive.len() {
        let name = archive.name_for_index(index).unwrap_or_default().to_string();
        if !name.ends_with(".json") {
            debug!(entry = %name, "ignoring non-JSON zip entry");
            continue;
        }
        match archive.by_index_raw(index) {
            Ok(entry) => sources.push_back(Source::ZipEntry(ZipEntryPlan {
                name,
                data_start: entry.data_start(),
                compressed_size: entry.compressed_size(),
                compression: entry.compression(),
                encrypted: entry.encrypted(),
                crc32: entry.crc32(),
            })),
            Err(err) => sources.push_back(Source::Broken(SkippedItem {
                origin: name,
                index: None,
                reason: SkipReason::Entry(err),
            })),
        }
    }
    Ok(sources)
}

/// Lazily decoded conversations from one archive.
///
/// Yields `Err` for items that could not be decoded and keeps going; empty
/// conversations are counted in [`ConversationStream::dropped_empty`] and never
/// yielded. Dropping the stream closes every open handle.
pub struct ConversationStream {
    archive: PathBuf,
    sources: VecDeque<Source>,
    current: Option<(String, ItemSplitter<Box<dyn BufRead>>)>,
    dropped_empty: usize,
}

impl ConversationStream {
    fn new(archive: PathBuf, sources: VecDeque<Source>) -> Self {
        Self {
            archive,
            sources,
            current: None,
            dropped_empty: 0,
        }
    }

    /// Conversations dropped so far because they had no messages.
    pub fn dropped_empty(&self) -> usize {
        self.dropped_empty
    }

    fn advance_source(&mut self) -> Option<Result<(), SkippedItem>> {
        let source = self.sources.pop_front()?;
        let opened = match source {
            Source::Document { origin, reader } => Ok((origin, reader)),
            Source::ZipEntry(plan) => match plan.open(&self.archive) {
                Ok(reader) => Ok((plan.name, reader)),
                Err(reason) => Err(SkippedItem {
                    origin: plan.name,
                    index: None,
                    reason,
                }),
            },
            Source::Broken(skipped) => Err(skipped),
        };
        Some(opened.map(|(origin, reader)| {
            debug!(origin = %origin, "reading conversations");
            self.current = Some((origin, ItemSplitter::new(reader)));
        }))
    }
}

impl Iterator for ConversationStream {
    type Item = Result<CanonicalConversation, SkippedItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                if let Err(skipped) = self.advance_source()? {
                    warn!(%skipped, "skipping archive entry");
                    return Some(Err(skipped));
                }
                continue;
            }
            let Some((origin, splitter)) = self.current.as_mut() else {
                continue;
            };

            let index = splitter.items_started();
            let bytes = match splitter.next_item() {
                None => {
                    self.current = None;
                    continue;
                }
                Some(Ok(bytes)) => bytes,
                Some(Err(reason)) => {
                    let skipped = SkippedItem {
                        origin: origin.clone(),
                        index: (!matches!(reason, SkipReason::NotAnArray)).then_some(index),
                        reason,
                    };
                    self.current = None;
                    warn!(%skipped, "stopping document");
                    return Some(Err(skipped));
                }
            };

            let value = match serde_json::from_slice::<Value>(bytes) {
                Ok(value) => value,
                Err(err) => {
                    let skipped = SkippedItem {
                        origin: origin.clone(),
                        index: Some(index),
                        reason: SkipReason::Decode(err),
                    };
                    warn!(%skipped, "skipping item");
                    return Some(Err(skipped));
                }
            };

            let report = normalize_conversation_report(&value);
            if !report.skipped.is_empty() {
                debug!(
                    conversation = %report.conversation.id,
                    skipped = report.skipped.len(),
                    "mapping entries without messages"
                );
            }
            if report.conversation.messages.is_empty() {
                debug!(conversation = %report.conversation.id, "dropping empty conversation");
                self.dropped_empty += 1;
                continue;
            }
            return Some(Ok(report.conversation));
        }
    }
}

/// Everything a stream produced, folded into one value.
#[derive(Debug, Default)]
pub struct ParseReport {
    /// Conversations that decoded and had at least one message.
    pub conversations: Vec<CanonicalConversation>,
    /// Items and entries that were skipped.
    pub skipped: Vec<SkippedItem>,
    /// Conversations dropped because they had no messages.
    pub dropped_empty: usize,
}

impl ParseReport {
    /// Drains `stream` to completion.
    pub fn collect(mut stream: ConversationStream) -> Self {
        let mut report = Self::default();
        for item in stream.by_ref() {
            match item {
                Ok(conversation) => report.conversations.push(conversation),
                Err(skipped) => report.skipped.push(skipped),
            }
        }
        report.dropped_empty = stream.dropped_empty();
        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Items,
    /// The array is closed; the rest of the input still has to be drained.
    Closing,
    Done,
}

/// Splits a top-level JSON array into the raw bytes of each item.
struct ItemSplitter<R> {
    reader: R,
    phase: Phase,
    buf: Vec<u8>,
    /// Unclosed `{` / `[` of the current item, innermost last.
    openers: Vec<u8>,
    items: usize,
}

impl<R: BufRead> ItemSplitter<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            phase: Phase::Start,
            buf: Vec::new(),
            openers: Vec::new(),
            items: 0,
        }
    }

    /// Number of items handed out so far, which is also the index of the next one.
    fn items_started(&self) -> usize {
        self.items
    }

    fn next_item(&mut self) -> Option<Result<&[u8], SkipReason>> {
        if self.phase == Phase::Start {
            if let Err(reason) = self.open_array() {
                self.phase = Phase::Done;
                return Some(Err(reason));
            }
            self.phase = Phase::Items;
        }
        match self.phase {
            Phase::Done => return None,
            Phase::Closing => return self.finish(),
            Phase::Start | Phase::Items => {}
        }

        self.buf.clear();
        self.openers.clear();
        let mut in_string = false;
        let mut escaped = false;
        loop {
            let chunk = match self.reader.fill_buf() {
                Ok(chunk) => chunk,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.phase = Phase::Done;
                    return Some(Err(SkipReason::Io(err)));
                }
            };
            if chunk.is_empty() {
                self.phase = Phase::Done;
                return Some(Err(SkipReason::Truncated {
                    bytes: self.buf.len(),
                }));
            }

            let mut consumed = 0usize;
            let mut boundary = None;
            for &byte in chunk {
                consumed += 1;
                if in_string {
                    self.buf.push(byte);
                    if escaped {
                        escaped = false;
                    } else if byte == b'\\' {
                        escaped = true;
                    } else if byte == b'"' {
                        in_string = false;
                        if self.openers.is_empty() {
                            boundary = Some(Boundary::Item);
                            break;
                        }
                    }
                    continue;
                }
                match byte {
                    b'"' => {
                        self.buf.push(byte);
                        in_string = true;
                    }
                    b'{' | b'[' => {
                        self.buf.push(byte);
                        self.openers.push(byte);
                    }
                    b']' if self.openers.is_empty() => {
                        boundary = Some(Boundary::EndOfArray);
                        break;
                    }
                    b'}' | b']' => {
                        self.buf.push(byte);
                        close_opener(&mut self.openers, byte);
                        if self.openers.is_empty() {
                            boundary = Some(Boundary::Item);
                            break;
                        }
                    }
                    b',' if self.openers.is_empty() => {
                        boundary = Some(Boundary::Item);
                        break;
                    }
                    b' ' | b'\t' | b'\r' | b'\n' if self.openers.is_empty() => {
                        if !self.buf.is_empty() {
                            boundary = Some(Boundary::Item);
                            break;
                        }
                    }
                    _ => self.buf.push(byte),
                }
            }
            self.reader.consume(consumed);

            match boundary {
                Some(Boundary::EndOfArray) => {
                    self.phase = Phase::Closing;
                    if self.buf.is_empty() {
                        return self.finish();
                    }
                    break;
                }
                // stray separators between items
                Some(Boundary::Item) if self.buf.is_empty() => continue,
                Some(Boundary::Item) => break,
                None => {}
            }
        }

        self.items += 1;
        Some(Ok(&self.buf))
    }

    /// Reads whatever follows the closing `]` so integrity checks in the
    /// reader chain see the whole input.
    fn finish(&mut self) -> Option<Result<&[u8], SkipReason>> {
        self.phase = Phase::Done;
        match io::copy(&mut self.reader, &mut io::sink()) {
            Ok(_) => None,
            Err(err) => Some(Err(SkipReason::Io(err))),
        }
    }

    fn open_array(&mut self) -> Result<(), SkipReason> {
        loop {
            let chunk = match self.reader.fill_buf() {
                Ok(chunk) => chunk,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(SkipReason::Io(err)),
            };
            let Some(&first) = chunk.first() else {
                return Err(SkipReason::NotAnArray);
            };
            if first.is_ascii_whitespace() || UTF8_BOM.contains(&first) {
                self.reader.consume(1);
                continue;
            }
            if first == b'[' {
                self.reader.consume(1);
                return Ok(());
            }
            debug!(byte = first, "document does not open with '['");
            return Err(SkipReason::NotAnArray);
        }
    }
}

/// Pops back to the opener matching `closer`. A mismatched closer still
/// closes its own kind, so one malformed item cannot swallow the rest of the
/// array. Closers with no matching opener are left in the item.
fn close_opener(openers: &mut Vec<u8>, closer: u8) {
    let opener = if closer == b'}' { b'{' } else { b'[' };
    if let Some(at) = openers.iter().rposition(|&open| open == opener) {
        openers.truncate(at);
    }
}

#[derive(Debug, Clone, Copy)]
enum Boundary {
    Item,
    EndOfArray,
}
