//! AT line framing and message decode.
//!
//! The co-processor answers every command with one or more CR LF terminated
//! text lines (`OK`, `ERROR`, `+CIPSNTPTIME:...`) and pushes unsolicited
//! subscription messages on the same stream. This module holds the
//! well-known tokens, the pure line decoder, and [`LineBuffer`], the byte
//! accumulator every consumer of the stream owns privately. Outgoing lines
//! are framed by [`Transport::write_line`](espat_core::transport::Transport::write_line).

/// The two-byte sequence that terminates every line.
pub const TERMINATOR: &[u8] = b"\r\n";

/// Generic success token.
pub const OK: &str = "OK";

/// Generic failure token.
pub const ERROR: &str = "ERROR";

/// Reported once the station has associated with an access point.
pub const WIFI_CONNECTED: &str = "WIFI CONNECTED";

/// Reported when an access point join is rejected.
pub const FAIL: &str = "FAIL";

/// Reported when a `AT+CIPSEND` payload has been transmitted.
pub const SEND_OK: &str = "SEND OK";

/// Marker that introduces an unsolicited subscription message.
pub const UNSOLICITED_MARKER: &str = "MQTTSUBRECV";

/// Width of the fixed prefix between the marker and the topic field
/// (`:<link id>,`).
pub const MARKER_PREFIX_LEN: usize = 3;

/// Separator between the topic and payload fields.
pub const FIELD_SEPARATOR: char = ',';

/// Result of attempting to decode one line from a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// A complete line was decoded.
    Line {
        /// Line text without the terminator. Invalid UTF-8 is replaced.
        text: String,
        /// Number of bytes consumed from the input, terminator included.
        consumed: usize,
    },

    /// The buffer does not yet contain a terminator. More data is needed.
    Incomplete,
}

/// Decode the earliest CR LF terminated line from a byte buffer.
pub fn decode_line(buf: &[u8]) -> DecodeResult {
    match find_terminator(buf, 0) {
        Some(pos) => DecodeResult::Line {
            text: String::from_utf8_lossy(&buf[..pos]).into_owned(),
            consumed: pos + TERMINATOR.len(),
        },
        None => DecodeResult::Incomplete,
    }
}

/// Decode an unsolicited subscription message from accumulated text.
///
/// Everything up to and including `marker` plus `prefix_len` further bytes
/// is skipped. The rest of the line is split at the first
/// [`FIELD_SEPARATOR`]; only the first two fields are kept, and surrounding
/// whitespace and double quotes are trimmed from each. Returns `None` when
/// the marker is missing or the second field is absent.
///
/// # Examples
///
/// ```
/// use espat_text_io::protocol::{decode_unsolicited, MARKER_PREFIX_LEN, UNSOLICITED_MARKER};
///
/// let msg = decode_unsolicited(
///     "+MQTTSUBRECV:0,\"sensors/temp\",\"21.5\"\r\n",
///     UNSOLICITED_MARKER,
///     MARKER_PREFIX_LEN,
/// );
/// assert_eq!(msg, Some(("sensors/temp".to_string(), "21.5".to_string())));
/// ```
pub fn decode_unsolicited(text: &str, marker: &str, prefix_len: usize) -> Option<(String, String)> {
    let start = text.find(marker)? + marker.len();
    let rest = text.get(start..)?;
    // Skip the fixed prefix by characters so a stray multi-byte character
    // cannot split a code point.
    let rest = match rest.char_indices().nth(prefix_len) {
        Some((idx, _)) => &rest[idx..],
        None => "",
    };
    let line = match rest.find("\r\n") {
        Some(end) => &rest[..end],
        None => rest,
    };

    let mut fields = line.split(FIELD_SEPARATOR);
    let topic = clean_field(fields.next()?);
    let payload = clean_field(fields.next()?);
    Some((topic, payload))
}

fn clean_field(field: &str) -> String {
    field.trim().trim_matches('"').to_string()
}

/// Locate the first terminator at or after `from`.
fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
        .map(|pos| pos + from)
}

/// Growable byte accumulator with line extraction.
///
/// Bytes are only appended at the back and trimmed from the front. The
/// buffer remembers how far it has already searched for a terminator so
/// repeated `has_line()` calls on a growing partial line stay cheap.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Offset below which no terminator starts.
    scanned: usize,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Whether at least one complete line is buffered.
    pub fn has_line(&mut self) -> bool {
        match find_terminator(&self.buf, self.scanned) {
            Some(_) => true,
            None => {
                // The last byte may be the first half of a terminator.
                self.scanned = self.buf.len().saturating_sub(TERMINATOR.len() - 1);
                false
            }
        }
    }

    /// Remove and return the earliest complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        match decode_line(&self.buf) {
            DecodeResult::Line { text, consumed } => {
                self.buf.drain(..consumed);
                self.scanned = 0;
                Some(text)
            }
            DecodeResult::Incomplete => {
                self.scanned = self.buf.len().saturating_sub(TERMINATOR.len() - 1);
                None
            }
        }
    }

    /// Whether the raw buffered text contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        let needle = needle.as_bytes();
        if needle.is_empty() {
            return true;
        }
        self.buf.windows(needle.len()).any(|w| w == needle)
    }

    /// The raw buffered bytes as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    /// Drop the oldest bytes, keeping at most `keep` trailing bytes.
    ///
    /// Returns the number of bytes dropped. A line that straddles the cut
    /// is lost.
    pub fn truncate_to_suffix(&mut self, keep: usize) -> usize {
        let dropped = self.buf.len().saturating_sub(keep);
        if dropped > 0 {
            self.buf.drain(..dropped);
            self.scanned = 0;
        }
        dropped
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
