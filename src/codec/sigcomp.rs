//! Compressed (SigComp) message units on stream transports.
//!
//! A compressed unit ends with the two-byte delimiter `0xFF 0xFF`. An
//! unescaped `0xFF` followed by a byte `N` in `0x00..=0x7F` instead introduces
//! `N` quoted bytes that are copied verbatim and are never delimiter
//! candidates. [`DelimiterScanner`] tracks that state across reads so a unit can
//! be isolated no matter where the stream was split.
//!
//! Once isolated, the unit (without its delimiter) is handed to a
//! [`Decompressor`]; the plaintext it returns is framed like any other
//! message.

use bytes::Bytes;

pub use super::error::DecompressError;

const ESCAPE: u8 = 0xFF;
const MAX_QUOTED: u8 = 0x7F;

/// Whether a message starting with `byte` is compressed.
///
/// SigComp messages begin with the bit pattern `11111xxx`, which never starts
/// a plaintext SIP message.
#[must_use]
pub fn is_compressed_start(byte: u8) -> bool { byte & 0xF8 == 0xF8 }

/// Delivery guarantee of the transport carrying a compressed unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportReliability {
    /// Ordered byte stream (TCP, TLS).
    Stream,
    /// Reliable message boundaries (SCTP).
    Message,
}

/// Plaintext produced by a [`Decompressor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decompressed {
    /// Decompressed message bytes.
    pub plain: Bytes,
    /// Correlation id the layer above must echo back to the codec.
    pub unique_id: u64,
}

/// External decompression codec.
///
/// Implementations may keep per-compartment state; the registry calls them
/// from worker threads.
pub trait Decompressor: Send + Sync + 'static {
    /// Decompress one unit.
    ///
    /// # Errors
    ///
    /// Returns [`DecompressError`] when the unit cannot be decoded. Only the
    /// affected message is dropped.
    fn decompress(
        &self,
        unit: &[u8],
        reliability: TransportReliability,
    ) -> Result<Decompressed, DecompressError>;
}

/// Outcome of a [`DelimiterScanner::scan`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unit {
    /// A unit is complete.
    Complete {
        /// Length of the unit, delimiter excluded.
        len: usize,
        /// Bytes to consume, delimiter included.
        consumed: usize,
    },
    /// The delimiter has not arrived yet.
    NeedMore,
}

/// Resumable delimiter search over a growing buffer.
#[derive(Clone, Debug, Default)]
pub struct DelimiterScanner {
    pos: usize,
    quoted: usize,
    escape_pending: bool,
}

impl DelimiterScanner {
    /// Create a scanner at the start of a unit.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Continue scanning `buf` from where the previous call stopped.
    ///
    /// ```
    /// use sipwire::codec::sigcomp::{DelimiterScanner, Unit};
    ///
    /// // 0xFF 0x01 quotes the following 0xFF, so only the final pair ends the unit.
    /// let buf = [0xF8, 0xFF, 0x01, 0xFF, 0x42, 0xFF, 0xFF];
    /// let mut scanner = DelimiterScanner::new();
    /// assert_eq!(scanner.scan(&buf), Unit::Complete { len: 5, consumed: 7 });
    /// ```
    pub fn scan(&mut self, buf: &[u8]) -> Unit {
        while self.pos < buf.len() {
            if self.quoted > 0 {
                let skip = self.quoted.min(buf.len() - self.pos);
                self.pos += skip;
                self.quoted -= skip;
                continue;
            }
            let byte = buf[self.pos];
            self.pos += 1;
            if self.escape_pending {
                self.escape_pending = false;
                match byte {
                    ESCAPE => {
                        return Unit::Complete {
                            len: self.pos - 2,
                            consumed: self.pos,
                        };
                    }
                    0..=MAX_QUOTED => self.quoted = usize::from(byte),
                    _ => {
                        tracing::debug!(byte, "reserved escape sequence in compressed unit");
                    }
                }
            } else if byte == ESCAPE {
                self.escape_pending = true;
            }
        }
        Unit::NeedMore
    }

    /// Whether the last byte seen was an unescaped `0xFF`.
    #[must_use]
    pub fn escape_pending(&self) -> bool { self.escape_pending }

    /// Quoted bytes still to skip.
    #[must_use]
    pub fn quoted_remaining(&self) -> usize { self.quoted }

    /// Bytes examined so far.
    #[must_use]
    pub fn scanned(&self) -> usize { self.pos }

    /// Forget all progress.
    pub fn reset(&mut self) { *self = Self::default(); }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0xF8, true)]
    #[case(0xFF, true)]
    #[case(0xF7, false)]
    #[case(b'I', false)]
    fn detects_compressed_start(#[case] byte: u8, #[case] expected: bool) {
        assert_eq!(is_compressed_start(byte), expected);
    }

    #[test]
    fn delimiter_split_across_reads() {
        let mut buf = vec![0xF9, 0x10, 0xFF];
        let mut scanner = DelimiterScanner::new();
        assert_eq!(scanner.scan(&buf), Unit::NeedMore);
        assert!(scanner.escape_pending());
        buf.push(0xFF);
        assert_eq!(scanner.scan(&buf), Unit::Complete { len: 2, consumed: 4 });
    }

    #[test]
    fn quoted_run_split_across_reads() {
        let mut buf = vec![0xF9, 0xFF, 0x03, 0xFF];
        let mut scanner = DelimiterScanner::new();
        assert_eq!(scanner.scan(&buf), Unit::NeedMore);
        assert_eq!(scanner.quoted_remaining(), 2);
        buf.extend_from_slice(&[0xFF, 0xFF]);
        assert_eq!(scanner.scan(&buf), Unit::NeedMore);
        assert_eq!(scanner.quoted_remaining(), 0);
        assert!(!scanner.escape_pending());
        buf.extend_from_slice(&[0xFF, 0xFF, 0x00]);
        assert_eq!(scanner.scan(&buf), Unit::Complete { len: 6, consumed: 8 });
    }

    #[test]
    fn zero_length_quote_is_plain_data() {
        let buf = [0xF8, 0xFF, 0x00, 0x20, 0xFF, 0xFF];
        let mut scanner = DelimiterScanner::new();
        assert_eq!(scanner.scan(&buf), Unit::Complete { len: 4, consumed: 6 });
    }
}
