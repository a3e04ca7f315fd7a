//! Header/body boundary detection.
//!
//! [`BoundaryScanner`] walks a growing header buffer one decision at a time.
//! Each decision looks at no more than four bytes; when those bytes are not
//! yet buffered the scanner stops and resumes from the same offset once more
//! data has been appended. Because every decision is taken against the same
//! bytes no matter how the stream was split, the result is independent of
//! read boundaries.
//!
//! The boundary is the first `CRLFCRLF`, `CRCR` or `LFLF`, with `CRLF LF`
//! accepted as well. Folded continuation lines (a line break followed by a
//! space or tab) are blanked to spaces in place so the header can later be
//! parsed line by line.

use super::error::FramingError;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
/// Longest Content-Length value considered, in characters.
const MAX_LENGTH_DIGITS: usize = 19;

pub(crate) fn is_line_break(byte: u8) -> bool { byte == CR || byte == LF }

fn is_blank(byte: u8) -> bool { byte == b' ' || byte == b'\t' }

/// Classification of the byte at a scan position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Header content.
    Ordinary,
    /// A folded line break `width` bytes wide.
    Fold {
        /// Bytes to blank.
        width: usize,
    },
    /// A header line ends here; the next line starts at `next`.
    LineEnd {
        /// Offset of the following line.
        next: usize,
    },
    /// The header region ends; the body starts at `body_start`.
    Boundary {
        /// Offset of the first body byte.
        body_start: usize,
    },
    /// The decision needs bytes that have not arrived yet.
    NeedMore,
}

/// Classify the byte at `at` using up to three bytes of lookahead.
///
/// ```
/// use sipwire::codec::scanner::{Step, classify};
///
/// assert_eq!(classify(b"a\r\n\r\nbody", 1), Step::Boundary { body_start: 5 });
/// assert_eq!(classify(b"a\r\n b", 1), Step::Fold { width: 2 });
/// assert_eq!(classify(b"a\r\nb", 1), Step::LineEnd { next: 3 });
/// assert_eq!(classify(b"a\r\n", 1), Step::NeedMore);
/// ```
#[must_use]
pub fn classify(buf: &[u8], at: usize) -> Step {
    let Some(&byte) = buf.get(at) else {
        return Step::NeedMore;
    };
    if !is_line_break(byte) {
        return Step::Ordinary;
    }
    let Some(&next) = buf.get(at + 1) else {
        return Step::NeedMore;
    };
    if next == byte {
        return Step::Boundary { body_start: at + 2 };
    }
    if byte == CR && next == LF {
        let Some(&third) = buf.get(at + 2) else {
            return Step::NeedMore;
        };
        return match third {
            b' ' | b'\t' => Step::Fold { width: 2 },
            LF => Step::Boundary { body_start: at + 3 },
            CR => match buf.get(at + 3) {
                None => Step::NeedMore,
                Some(&LF) => Step::Boundary { body_start: at + 4 },
                Some(_) => Step::LineEnd { next: at + 2 },
            },
            _ => Step::LineEnd { next: at + 2 },
        };
    }
    if is_blank(next) {
        Step::Fold { width: 1 }
    } else {
        Step::LineEnd { next: at + 1 }
    }
}

/// Extract the value of a Content-Length header line.
///
/// The name matches case-insensitively in its long form or as the compact
/// `l`. Blanks may precede the colon and the value. The value is read as a
/// decimal integer; anything negative or malformed reads as zero. Returns
/// `None` when the line is some other header.
///
/// ```
/// use sipwire::codec::scanner::parse_content_length;
///
/// assert_eq!(parse_content_length(b"Content-Length: 42"), Some(42));
/// assert_eq!(parse_content_length(b"l :7"), Some(7));
/// assert_eq!(parse_content_length(b"content-length: -3"), Some(0));
/// assert_eq!(parse_content_length(b"Link: <x>"), None);
/// ```
#[must_use]
pub fn parse_content_length(line: &[u8]) -> Option<usize> {
    let rest = strip_name(line)?;
    let rest = &rest[rest.iter().take_while(|b| is_blank(**b)).count()..];
    let rest = rest.strip_prefix(b":")?;
    let value: Vec<u8> = rest
        .iter()
        .copied()
        .skip_while(|b| is_blank(*b))
        .take_while(|b| !is_blank(*b) && !is_line_break(*b))
        .take(MAX_LENGTH_DIGITS)
        .collect();
    Some(parse_decimal(&value))
}

fn strip_name(line: &[u8]) -> Option<&[u8]> {
    const LONG: &[u8] = b"content-length";
    if line.len() >= LONG.len() && line[..LONG.len()].eq_ignore_ascii_case(LONG) {
        return Some(&line[LONG.len()..]);
    }
    match line.first() {
        Some(b'l' | b'L') => Some(&line[1..]),
        _ => None,
    }
}

fn parse_decimal(value: &[u8]) -> usize {
    let (negative, digits) = match value.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some((b'+', rest)) => (false, rest),
        _ => (false, value),
    };
    if negative {
        return 0;
    }
    digits
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0usize, |acc, b| {
            acc.saturating_mul(10).saturating_add(usize::from(b - b'0'))
        })
}

/// Outcome of a [`BoundaryScanner::scan`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scan {
    /// The header is complete.
    Boundary {
        /// Offset of the first body byte.
        body_start: usize,
        /// Declared body length.
        content_length: usize,
    },
    /// More bytes are required.
    NeedMore,
}

/// Resumable scan over a header buffer that only ever grows at its end.
#[derive(Clone, Debug, Default)]
pub struct BoundaryScanner {
    pos: usize,
    line_start: usize,
    content_length: Option<usize>,
}

impl BoundaryScanner {
    /// Create a scanner positioned at the start of a message.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Continue scanning `buf` from where the previous call stopped.
    ///
    /// Folded line breaks are rewritten to spaces in `buf`. The first
    /// Content-Length header found is remembered and never searched for again
    /// for this message.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::MissingContentLength`] when the boundary is
    /// reached and no Content-Length header was seen.
    pub fn scan(&mut self, buf: &mut [u8]) -> Result<Scan, FramingError> {
        while self.pos < buf.len() {
            match classify(buf, self.pos) {
                Step::Ordinary => self.pos += 1,
                Step::Fold { width } => {
                    buf[self.pos..self.pos + width].fill(b' ');
                    self.pos += width;
                }
                Step::LineEnd { next } => {
                    self.observe_line(&buf[self.line_start..self.pos]);
                    self.line_start = next;
                    self.pos = next;
                }
                Step::Boundary { body_start } => {
                    self.observe_line(&buf[self.line_start..self.pos]);
                    self.pos = body_start;
                    let content_length = self
                        .content_length
                        .ok_or(FramingError::MissingContentLength {
                            header_len: body_start,
                        })?;
                    return Ok(Scan::Boundary {
                        body_start,
                        content_length,
                    });
                }
                Step::NeedMore => break,
            }
        }
        Ok(Scan::NeedMore)
    }

    fn observe_line(&mut self, line: &[u8]) {
        if self.content_length.is_none() {
            self.content_length = parse_content_length(line);
        }
    }

    /// Content-Length found so far for the current message.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> { self.content_length }

    /// Bytes examined so far.
    #[must_use]
    pub fn scanned(&self) -> usize { self.pos }

    /// Forget all progress.
    pub fn reset(&mut self) { *self = Self::default(); }
}
