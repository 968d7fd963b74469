//! Best-effort plain-text extraction from Notes body blobs.
//!
//! A body blob is a gzip stream wrapping an undocumented protobuf document. The layout
//! varies across Notes releases, so decoding is layered: a tolerant walk along the
//! protobuf path that has held for every known release, then a scan for readable text
//! runs. [`decode`] is total: it never fails and never panics, whatever the input.
use std::io::Read;

use flate2::read::GzDecoder;
use tracing::debug;

/// Shortest printable run kept by the heuristic scan, in characters.
pub const MIN_TEXT_RUN: usize = 4;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const MAX_INFLATED_BYTES: u64 = 64 * 1024 * 1024;
/// Placeholder Notes inserts in the text where an attachment sits.
const ATTACHMENT_MARKER: char = '\u{fffc}';

/// Field numbers on the path `NoteStoreProto.document.note.note_text`.
const NOTE_TEXT_PATH: [u64; 3] = [2, 3, 2];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedText {
    /// A clean gzip stream whose protobuf note text was found where expected.
    FullyParsed(String),
    /// Text recovered from a damaged or unrecognized payload; order is preserved, structure is not.
    PartiallyParsed(String),
    Unparseable,
}

impl DecodedText {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::FullyParsed(text) | Self::PartiallyParsed(text) => Some(text),
            Self::Unparseable => None,
        }
    }

    /// The note body this outcome yields; nothing readable becomes an empty body.
    pub fn into_body(self) -> String {
        match self {
            Self::FullyParsed(text) | Self::PartiallyParsed(text) => text,
            Self::Unparseable => String::new(),
        }
    }
}

enum Inflated<'a> {
    Clean(Vec<u8>),
    Damaged(Vec<u8>),
    Plain(&'a [u8]),
}

/// Decompress if the blob carries a gzip header; otherwise hand the bytes back untouched.
fn inflate(blob: &[u8]) -> Inflated<'_> {
    if !blob.starts_with(&GZIP_MAGIC) {
        return Inflated::Plain(blob);
    }
    let mut out = Vec::new();
    match GzDecoder::new(blob)
        .take(MAX_INFLATED_BYTES)
        .read_to_end(&mut out)
    {
        Ok(_) => Inflated::Clean(out),
        Err(e) if !out.is_empty() => {
            debug!(error = %e, recovered = out.len(), "gzip stream damaged, keeping prefix");
            Inflated::Damaged(out)
        }
        Err(e) => {
            debug!(error = %e, "gzip stream unreadable, scanning raw bytes");
            Inflated::Plain(blob)
        }
    }
}

// ---------------------------------------------------------------------------
// Protobuf walk
// ---------------------------------------------------------------------------

fn read_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

/// Payload of the first length-delimited field numbered `field` in `message`.
fn find_field(message: &[u8], field: u64) -> Option<&[u8]> {
    let mut pos = 0usize;
    while pos < message.len() {
        let key = read_varint(message, &mut pos)?;
        match key & 0x7 {
            0 => {
                read_varint(message, &mut pos)?;
            }
            1 => pos = pos.checked_add(8)?,
            2 => {
                let len = usize::try_from(read_varint(message, &mut pos)?).ok()?;
                let end = pos.checked_add(len)?;
                let payload = message.get(pos..end)?;
                if key >> 3 == field {
                    return Some(payload);
                }
                pos = end;
            }
            5 => pos = pos.checked_add(4)?,
            // Groups and unknown wire types mean this isn't the layout we expect.
            _ => return None,
        }
    }
    None
}

fn structured_text(bytes: &[u8]) -> Option<String> {
    let text = NOTE_TEXT_PATH
        .iter()
        .try_fold(bytes, |message, &field| find_field(message, field))?;
    let text = std::str::from_utf8(text).ok()?;
    Some(text.replace(ATTACHMENT_MARKER, ""))
}

// ---------------------------------------------------------------------------
// Heuristic scan
// ---------------------------------------------------------------------------

fn is_text_char(ch: char) -> bool {
    matches!(ch, '\n' | '\t') || !(ch.is_control() || ch == ATTACHMENT_MARKER || ch == '\u{fffd}')
}

fn flush_run(runs: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if trimmed.chars().count() >= MIN_TEXT_RUN {
        runs.push(trimmed.to_string());
    }
    current.clear();
}

/// Printable UTF-8 runs of at least [`MIN_TEXT_RUN`] characters, in byte order.
fn printable_runs(bytes: &[u8]) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for chunk in bytes.utf8_chunks() {
        for ch in chunk.valid().chars() {
            if is_text_char(ch) {
                current.push(ch);
            } else {
                flush_run(&mut runs, &mut current);
            }
        }
        if !chunk.invalid().is_empty() {
            flush_run(&mut runs, &mut current);
        }
    }
    flush_run(&mut runs, &mut current);
    runs
}

/// Decode a body blob into plain text.
pub fn decode(blob: &[u8]) -> DecodedText {
    if blob.is_empty() {
        return DecodedText::Unparseable;
    }

    let inflated = inflate(blob);
    let (bytes, clean): (&[u8], bool) = match &inflated {
        Inflated::Clean(bytes) => (bytes, true),
        Inflated::Damaged(bytes) => (bytes, false),
        Inflated::Plain(bytes) => (bytes, false),
    };

    if let Some(text) = structured_text(bytes) {
        return if clean {
            DecodedText::FullyParsed(text)
        } else {
            DecodedText::PartiallyParsed(text)
        };
    }

    let runs = printable_runs(bytes);
    if runs.is_empty() {
        DecodedText::Unparseable
    } else {
        DecodedText::PartiallyParsed(runs.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn varint(mut value: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    fn field(number: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        varint(number << 3 | 2, &mut out);
        varint(payload.len() as u64, &mut out);
        out.extend_from_slice(payload);
        out
    }

    /// A minimal note document with a version varint ahead of the payload, like Notes writes.
    fn note_proto(text: &str) -> Vec<u8> {
        let mut note = vec![0x08, 0x00];
        note.extend(field(2, text.as_bytes()));
        note.extend(field(5, b"\x08\x01"));
        let mut document = vec![0x08, 0x00, 0x10, 0x00];
        document.extend(field(3, &note));
        let mut root = vec![0x08, 0x00];
        root.extend(field(2, &document));
        root
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn gzipped_note_document_is_fully_parsed() {
        let blob = gzip(&note_proto("Groceries\nmilk, eggs"));
        assert_eq!(
            decode(&blob),
            DecodedText::FullyParsed("Groceries\nmilk, eggs".to_string())
        );
    }

    #[test]
    fn attachment_markers_are_dropped() {
        let blob = gzip(&note_proto("Trip\n\u{fffc}\nphotos above"));
        assert_eq!(decode(&blob).into_body(), "Trip\n\nphotos above");
    }

    #[test]
    fn empty_note_text_is_still_fully_parsed() {
        let blob = gzip(&note_proto(""));
        assert_eq!(decode(&blob), DecodedText::FullyParsed(String::new()));
    }

    #[test]
    fn uncompressed_document_is_partial() {
        let decoded = decode(&note_proto("plain protobuf body"));
        assert_eq!(
            decoded,
            DecodedText::PartiallyParsed("plain protobuf body".to_string())
        );
    }

    #[test]
    fn unknown_layout_falls_back_to_printable_runs() {
        let mut payload = vec![0xff, 0x00, 0x03];
        payload.extend_from_slice("first paragraph".as_bytes());
        payload.extend_from_slice(&[0x12, 0x01, 0xc3]);
        payload.extend_from_slice("ok".as_bytes());
        payload.push(0x00);
        payload.extend_from_slice("second déjà vu".as_bytes());
        payload.push(0x07);

        assert_eq!(
            decode(&gzip(&payload)),
            DecodedText::PartiallyParsed("first paragraph\nsecond déjà vu".to_string())
        );
    }

    #[test]
    fn truncated_gzip_keeps_what_inflated() {
        let text = "a long enough body that survives truncation ".repeat(64);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::none());
        encoder.write_all(text.as_bytes()).unwrap();
        let blob = encoder.finish().unwrap();
        let truncated = &blob[..blob.len() - 12];

        let decoded = decode(truncated);
        let DecodedText::PartiallyParsed(recovered) = decoded else {
            panic!("expected partial text, got {decoded:?}");
        };
        assert!(recovered.starts_with("a long enough body"));
    }

    #[test]
    fn garbage_after_gzip_magic_is_scanned_raw() {
        let mut blob = GZIP_MAGIC.to_vec();
        blob.extend_from_slice(b"\x00\x00readable tail");
        assert_eq!(
            decode(&blob),
            DecodedText::PartiallyParsed("readable tail".to_string())
        );
    }

    #[test]
    fn nothing_readable_is_unparseable() {
        assert_eq!(decode(&[]), DecodedText::Unparseable);
        assert_eq!(decode(&[0x00, 0x01, 0xff, 0xfe, 0x02]), DecodedText::Unparseable);
        assert_eq!(decode(b"abc"), DecodedText::Unparseable);
        assert_eq!(DecodedText::Unparseable.into_body(), "");
    }

    #[test]
    fn malformed_varints_do_not_panic() {
        let mut pos = 0;
        assert_eq!(read_varint(&[0xff; 12], &mut pos), None);
        assert_eq!(find_field(&[0x12, 0xff, 0xff, 0xff, 0xff, 0x0f], 2), None);
        assert_eq!(find_field(&[0x0b], 2), None);
    }
}
