//! Incremental NDJSON event parsing.
//!
//! [`parse_event_line`] decodes one framed line; [`StreamParser`] layers
//! chunk buffering on top so raw byte chunks can be fed in at arbitrary
//! boundaries. Malformed input never raises: undecodable lines come out
//! as [`ParsedLine::Malformed`] and are dropped by callers after a
//! warning. Feeding the same bytes in different chunkings yields the
//! same sequence of outcomes.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::agent::codec::StreamCodec;
use crate::agent::events::StreamEvent;

/// Longest prefix of a bad line kept for diagnostics.
const CONTEXT_BYTES: usize = 256;

/// Outcome of decoding one stdout line.
#[derive(Debug, Clone)]
pub enum ParsedLine {
    /// A recognized stream event.
    Event(StreamEvent),
    /// The line was dropped; `detail` explains why and `context` holds a
    /// bounded prefix of the offending input.
    Malformed {
        /// Human-readable parse failure description.
        detail: String,
        /// Truncated copy of the line for diagnostics.
        context: String,
    },
}

/// Decode one NDJSON line into a stream event.
///
/// Returns `None` for blank lines. Lines that fail to decode, or decode
/// to an unrecognized `type`, return [`ParsedLine::Malformed`] — never
/// an error.
#[must_use]
pub fn parse_event_line(line: &str) -> Option<ParsedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    match serde_json::from_str::<StreamEvent>(trimmed) {
        Ok(StreamEvent::Unknown) => Some(ParsedLine::Malformed {
            detail: "unrecognized event type".to_owned(),
            context: truncate_context(trimmed),
        }),
        Ok(event) => Some(ParsedLine::Event(event)),
        Err(err) => Some(ParsedLine::Malformed {
            detail: format!("malformed json: {err}"),
            context: truncate_context(trimmed),
        }),
    }
}

fn truncate_context(line: &str) -> String {
    if line.len() <= CONTEXT_BYTES {
        return line.to_owned();
    }
    let mut end = CONTEXT_BYTES;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}

/// Chunk-tolerant stream parser.
///
/// Buffers incomplete trailing data across [`push`](Self::push) calls;
/// [`finish`](Self::finish) flushes a complete final line that lacked a
/// terminating newline.
#[derive(Debug, Default)]
pub struct StreamParser {
    codec: StreamCodec,
    buf: BytesMut,
}

impl StreamParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw chunk, invoking `sink` for each completed line.
    pub fn push(&mut self, chunk: &[u8], sink: &mut dyn FnMut(ParsedLine)) {
        self.buf.extend_from_slice(chunk);
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(line)) => {
                    if let Some(parsed) = parse_event_line(&line) {
                        sink(parsed);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    // Oversized line: the codec discards up to the next
                    // newline; report and keep decoding.
                    sink(ParsedLine::Malformed {
                        detail: err.to_string(),
                        context: String::new(),
                    });
                }
            }
        }
    }

    /// Signal end of stream, flushing any buffered trailing line.
    pub fn finish(&mut self, sink: &mut dyn FnMut(ParsedLine)) {
        loop {
            match self.codec.decode_eof(&mut self.buf) {
                Ok(Some(line)) => {
                    if let Some(parsed) = parse_event_line(&line) {
                        sink(parsed);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    sink(ParsedLine::Malformed {
                        detail: err.to_string(),
                        context: String::new(),
                    });
                    break;
                }
            }
        }
    }
}
