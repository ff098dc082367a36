//! NDJSON codec for the agent stdout stream.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length to
//! prevent memory exhaustion from an unterminated or runaway line in a
//! misbehaving agent process. Decode-only: nothing is ever written back
//! to the agent over this framing.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum accepted line length: 1 MiB.
///
/// Longer lines cause [`StreamCodec::decode`] to return
/// [`AppError::Stream`]; the remainder of the offending line is
/// discarded and decoding resumes at the next newline.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-framed UTF-8 decoder for the agent's stdout.
#[derive(Debug)]
pub struct StreamCodec(LinesCodec);

impl StreamCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for StreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StreamCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    /// Decode the final line at EOF, including a clean trailing line
    /// without a terminating newline.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

fn map_codec_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Stream(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
