//! Error types for the framing layer.
//!
//! The taxonomy separates wire-level framing problems, end-of-stream
//! conditions and decompression failures:
//!
//! - [`FramingError`]: the stream cannot be split into messages (missing
//!   Content-Length at a boundary, a message above the configured limit).
//! - [`EofError`]: the peer closed the stream, cleanly or mid-message.
//! - [`DecompressError`]: the external codec rejected one compressed unit.
//! - [`CodecError`]: top-level enum wrapping all categories plus I/O errors.
//!
//! Framing and EOF errors cost the connection; a decompression error costs
//! only the affected message.

use std::io;

use thiserror::Error;

/// Errors found while locating message boundaries.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The header region reached a boundary without declaring a body length.
    #[error("header ended at byte {header_len} without a Content-Length")]
    MissingContentLength {
        /// Header bytes scanned, including the terminator.
        header_len: usize,
    },

    /// The message grows past the configured limit.
    #[error("message exceeds max size: {size} > {max}")]
    Oversized {
        /// Size known so far: buffered header bytes, or header plus declared
        /// body once the boundary is found.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// End-of-stream conditions.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EofError {
    /// The stream ended between messages.
    #[error("connection closed cleanly at message boundary")]
    CleanClose,

    /// The stream ended before the header/body boundary arrived.
    #[error("premature EOF: {received} header bytes without a boundary")]
    TruncatedHeader {
        /// Header bytes buffered at EOF.
        received: usize,
    },

    /// The stream ended inside a body.
    #[error("premature EOF: {received} of {expected} message bytes received")]
    TruncatedBody {
        /// Bytes of the message buffered at EOF.
        received: usize,
        /// Header plus declared body length.
        expected: usize,
    },

    /// The stream ended before a compressed unit's delimiter.
    #[error("premature EOF: {received} bytes of an unterminated compressed unit")]
    TruncatedCompressed {
        /// Compressed bytes buffered at EOF.
        received: usize,
    },
}

/// Failure reported by a [`super::sigcomp::Decompressor`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("decompression failed: {reason}")]
pub struct DecompressError {
    reason: String,
}

impl DecompressError {
    /// Wrap a codec-provided reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The codec-provided reason.
    #[must_use]
    pub fn reason(&self) -> &str { &self.reason }
}

/// Top-level framing error.
///
/// ```
/// use sipwire::codec::{CodecError, EofError, FramingError};
///
/// let err = CodecError::from(FramingError::Oversized { size: 9000, max: 4096 });
/// assert!(err.should_disconnect());
///
/// let clean = CodecError::from(EofError::CleanClose);
/// assert!(!clean.should_disconnect());
/// ```
#[derive(Debug, Error)]
pub enum CodecError {
    /// The stream cannot be split into messages.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The stream ended.
    #[error("EOF: {0}")]
    Eof(#[from] EofError),

    /// One compressed unit was rejected.
    #[error("{0}")]
    Decompress(#[from] DecompressError),

    /// Transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether the error costs the connection.
    ///
    /// | Error | Disconnect |
    /// |-------|------------|
    /// | `Framing(_)` | yes |
    /// | `Eof(CleanClose)` | no |
    /// | `Eof(_)` otherwise | yes |
    /// | `Decompress(_)` | no |
    /// | `Io(_)` | yes |
    #[must_use]
    pub fn should_disconnect(&self) -> bool {
        match self {
            Self::Framing(_) | Self::Io(_) => true,
            Self::Eof(eof) => !matches!(eof, EofError::CleanClose),
            Self::Decompress(_) => false,
        }
    }

    /// Whether the error reports the peer closing the stream.
    #[must_use]
    pub fn is_eof(&self) -> bool { matches!(self, Self::Eof(_)) }
}
