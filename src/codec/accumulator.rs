//! Per-connection stream reassembly.
//!
//! [`MessageFramer`] is the state machine that turns an inbound byte buffer
//! into complete [`SipFrame`]s. It keeps the header of the message in progress
//! contiguous, so a header split over several reads is scanned exactly as if
//! it had arrived at once. [`ReceiveAccumulator`] owns the buffer for one
//! connection and exposes the read-by-read interface used by the registry.

use std::{fmt, num::NonZeroUsize, sync::Arc};

use bytes::{Buf, BytesMut};

use super::{
    error::{CodecError, EofError, FramingError},
    frame::SipFrame,
    scanner::{BoundaryScanner, Scan, is_line_break},
    sigcomp::{Decompressed, Decompressor, DelimiterScanner, TransportReliability, Unit},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Between messages: leading line breaks are discarded.
    Start,
    /// Searching for the header/body boundary.
    Header,
    /// Waiting for `total` bytes; the body starts at `body_start`.
    Body { total: usize, body_start: usize },
    /// Searching for a compressed unit's delimiter.
    Compressed,
}

/// Incremental message framer.
pub struct MessageFramer {
    phase: Phase,
    scanner: BoundaryScanner,
    units: DelimiterScanner,
    max_message_size: usize,
    decompressor: Option<Arc<dyn Decompressor>>,
    reliability: TransportReliability,
}

impl fmt::Debug for MessageFramer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFramer")
            .field("phase", &self.phase)
            .field("scanner", &self.scanner)
            .field("units", &self.units)
            .field("max_message_size", &self.max_message_size)
            .field("decompressor", &self.decompressor.is_some())
            .finish()
    }
}

impl MessageFramer {
    /// Create a framer accepting messages up to `max_message_size` bytes.
    #[must_use]
    pub fn new(max_message_size: NonZeroUsize) -> Self {
        Self {
            phase: Phase::Start,
            scanner: BoundaryScanner::new(),
            units: DelimiterScanner::new(),
            max_message_size: max_message_size.get(),
            decompressor: None,
            reliability: TransportReliability::Stream,
        }
    }

    /// Recognise compressed units and expand them with `decompressor`.
    #[must_use]
    pub fn with_decompressor(
        mut self,
        decompressor: Arc<dyn Decompressor>,
        reliability: TransportReliability,
    ) -> Self {
        self.decompressor = Some(decompressor);
        self.reliability = reliability;
        self
    }

    /// Extract the next complete message from the front of `src`.
    ///
    /// Returns `Ok(None)` once `src` holds only part of a message; the partial
    /// bytes stay in `src` and scanning resumes where it stopped on the next
    /// call. Leading line breaks between messages are discarded. A compressed
    /// unit that fails to decompress is dropped and framing continues.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Framing`] when a header lacks Content-Length or a
    /// message exceeds the size limit. The framer is reset; the caller is
    /// expected to abandon the stream.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SipFrame>, CodecError> {
        loop {
            match self.phase {
                Phase::Start => {
                    let leading = src.iter().take_while(|b| is_line_break(**b)).count();
                    src.advance(leading);
                    let Some(&first) = src.first() else {
                        return Ok(None);
                    };
                    self.phase = if self.decompressor.is_some()
                        && super::sigcomp::is_compressed_start(first)
                    {
                        Phase::Compressed
                    } else {
                        Phase::Header
                    };
                }
                Phase::Header => match self.scanner.scan(&mut src[..]) {
                    Ok(Scan::NeedMore) => {
                        self.check_size(src.len())?;
                        return Ok(None);
                    }
                    Ok(Scan::Boundary {
                        body_start,
                        content_length,
                    }) => {
                        let total = body_start.saturating_add(content_length);
                        self.check_size(total)?;
                        self.phase = Phase::Body { total, body_start };
                    }
                    Err(err) => return Err(self.fail(err)),
                },
                Phase::Body { total, body_start } => {
                    if src.len() < total {
                        src.reserve(total - src.len());
                        return Ok(None);
                    }
                    let bytes = src.split_to(total).freeze();
                    self.reset();
                    return Ok(Some(SipFrame::new(bytes, body_start)));
                }
                Phase::Compressed => match self.units.scan(&src[..]) {
                    Unit::NeedMore => {
                        self.check_size(src.len())?;
                        return Ok(None);
                    }
                    Unit::Complete { len, consumed } => {
                        let unit = src.split_to(consumed);
                        self.reset();
                        if let Some(frame) = self.expand(&unit[..len]) {
                            return Ok(Some(frame));
                        }
                    }
                },
            }
        }
    }

    /// Like [`decode`](Self::decode), for the final call after the peer closed
    /// the stream.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Eof`] when bytes of an unfinished message remain,
    /// plus everything [`decode`](Self::decode) can return.
    pub fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<SipFrame>, CodecError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match self.eof_state(src.len()) {
            EofError::CleanClose => Ok(None),
            truncated => {
                src.clear();
                self.reset();
                Err(truncated.into())
            }
        }
    }

    fn eof_state(&self, buffered: usize) -> EofError {
        if buffered == 0 {
            return EofError::CleanClose;
        }
        match self.phase {
            Phase::Start | Phase::Header => EofError::TruncatedHeader { received: buffered },
            Phase::Body { total, .. } => EofError::TruncatedBody {
                received: buffered,
                expected: total,
            },
            Phase::Compressed => EofError::TruncatedCompressed { received: buffered },
        }
    }

    fn expand(&self, unit: &[u8]) -> Option<SipFrame> {
        let codec = self.decompressor.as_ref()?;
        match codec.decompress(unit, self.reliability) {
            Ok(Decompressed { plain, unique_id }) => {
                if plain.len() > self.max_message_size {
                    log::warn!(
                        "dropping decompressed message of {} bytes (max {})",
                        plain.len(),
                        self.max_message_size
                    );
                    return None;
                }
                match SipFrame::from_unit(plain) {
                    Ok(Some(frame)) => Some(frame.with_compression_id(unique_id)),
                    Ok(None) => {
                        log::warn!("dropping decompressed message without header boundary");
                        None
                    }
                    Err(err) => {
                        log::warn!("dropping decompressed message: {err}");
                        None
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, unit_len = unit.len(), "dropping compressed message");
                None
            }
        }
    }

    fn check_size(&mut self, size: usize) -> Result<(), CodecError> {
        if size > self.max_message_size {
            let max = self.max_message_size;
            return Err(self.fail(FramingError::Oversized { size, max }));
        }
        Ok(())
    }

    fn fail(&mut self, err: FramingError) -> CodecError {
        log::warn!("framing failed: {err}");
        crate::metrics::inc_framing_errors();
        self.reset();
        err.into()
    }

    /// Whether the framer is between messages.
    #[must_use]
    pub fn is_idle(&self) -> bool { self.phase == Phase::Start }

    /// Whether the header is complete and body bytes are awaited.
    #[must_use]
    pub fn in_body(&self) -> bool { matches!(self.phase, Phase::Body { .. }) }

    /// Content-Length of the message in progress, once seen.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> { self.scanner.content_length() }

    /// Offset of the body in the message in progress, once known.
    #[must_use]
    pub fn body_start(&self) -> Option<usize> {
        match self.phase {
            Phase::Body { body_start, .. } => Some(body_start),
            _ => None,
        }
    }

    /// Abandon the message in progress.
    pub fn reset(&mut self) {
        self.phase = Phase::Start;
        self.scanner.reset();
        self.units.reset();
    }
}

/// Result of feeding one read to [`ReceiveAccumulator::advance`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advance {
    /// Bytes of the window that were used. The rest must be fed again.
    pub consumed: usize,
    /// Message completed by this window, if any.
    pub frame: Option<SipFrame>,
}

/// Receive-side state of one connection.
///
/// ```
/// use std::num::NonZeroUsize;
///
/// use sipwire::codec::ReceiveAccumulator;
///
/// let mut acc = ReceiveAccumulator::new(NonZeroUsize::new(4096).expect("non-zero"));
/// assert!(acc.push(b"X-Header: a\r\nContent-L").expect("framing").is_empty());
/// let frames = acc.push(b"ength: 5\r\n\r\nHELLO").expect("framing");
/// assert_eq!(frames.len(), 1);
/// assert_eq!(frames[0].body(), b"HELLO");
/// ```
#[derive(Debug)]
pub struct ReceiveAccumulator {
    framer: MessageFramer,
    pending: BytesMut,
}

impl ReceiveAccumulator {
    /// Create an accumulator for plaintext streams.
    #[must_use]
    pub fn new(max_message_size: NonZeroUsize) -> Self {
        Self::from_framer(MessageFramer::new(max_message_size))
    }

    /// Create an accumulator around a configured framer.
    #[must_use]
    pub fn from_framer(framer: MessageFramer) -> Self {
        Self {
            framer,
            pending: BytesMut::new(),
        }
    }

    /// Feed one window and report how much of it the current message used.
    ///
    /// At most one message is completed per call. When `consumed` is less
    /// than `window.len()` the caller re-invokes `advance` with the
    /// remainder, which starts the next message.
    ///
    /// # Errors
    ///
    /// Propagates framing errors; the partial message is discarded.
    pub fn advance(&mut self, window: &[u8]) -> Result<Advance, CodecError> {
        self.pending.extend_from_slice(window);
        match self.framer.decode(&mut self.pending) {
            Ok(Some(frame)) => {
                let leftover = self.pending.len();
                self.pending.clear();
                Ok(Advance {
                    consumed: window.len().saturating_sub(leftover),
                    frame: Some(frame),
                })
            }
            Ok(None) => Ok(Advance {
                consumed: window.len(),
                frame: None,
            }),
            Err(err) => {
                self.pending.clear();
                Err(err)
            }
        }
    }

    /// Feed one window, appending every completed message to `frames`.
    ///
    /// Messages completed before an error are still appended.
    ///
    /// # Errors
    ///
    /// Propagates framing errors; the partial message is discarded.
    pub fn push_into(&mut self, window: &[u8], frames: &mut Vec<SipFrame>) -> Result<(), CodecError> {
        self.pending.extend_from_slice(window);
        loop {
            match self.framer.decode(&mut self.pending) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Ok(()),
                Err(err) => {
                    self.pending.clear();
                    return Err(err);
                }
            }
        }
    }

    /// Feed one window and collect the completed messages.
    ///
    /// # Errors
    ///
    /// Propagates framing errors; messages completed before the error are
    /// lost. Use [`push_into`](Self::push_into) to keep them.
    pub fn push(&mut self, window: &[u8]) -> Result<Vec<SipFrame>, CodecError> {
        let mut frames = Vec::new();
        self.push_into(window, &mut frames)?;
        Ok(frames)
    }

    /// Classify the buffered remainder once the peer has closed the stream
    /// and discard it.
    pub fn finish(&mut self) -> EofError {
        let state = self.framer.eof_state(self.pending.len());
        self.reset();
        state
    }

    /// Number of bytes of the message in progress.
    #[must_use]
    pub fn buffered(&self) -> usize { self.pending.len() }

    /// The bytes of the message in progress.
    #[must_use]
    pub fn pending(&self) -> &[u8] { &self.pending }

    /// Whether the header is complete and body bytes are awaited.
    #[must_use]
    pub fn in_body(&self) -> bool { self.framer.in_body() }

    /// Content-Length of the message in progress, once seen.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> { self.framer.content_length() }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_idle(&self) -> bool { self.framer.is_idle() && self.pending.is_empty() }

    /// Drop buffered bytes and start over.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.framer.reset();
    }
}

#[cfg(test)]
mod tests;
