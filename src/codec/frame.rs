//! Complete inbound messages.

use bytes::{Buf, Bytes};

use super::{
    error::FramingError,
    scanner::{BoundaryScanner, Scan, is_line_break},
};

/// One complete message: header region followed by its body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SipFrame {
    bytes: Bytes,
    body_start: usize,
    compression_id: Option<u64>,
}

impl SipFrame {
    /// Wrap `bytes` whose body begins at `body_start`.
    ///
    /// `body_start` is clamped to the message length.
    #[must_use]
    pub fn new(bytes: Bytes, body_start: usize) -> Self {
        let body_start = body_start.min(bytes.len());
        Self {
            bytes,
            body_start,
            compression_id: None,
        }
    }

    /// Frame a buffer that is known to hold exactly one message.
    ///
    /// Used for decompressed units, where the unit delimiter already marks
    /// the message end: a Content-Length shorter than the remaining bytes
    /// truncates the body. Returns `Ok(None)` when no header/body boundary
    /// exists.
    ///
    /// # Errors
    ///
    /// [`FramingError::MissingContentLength`] when the header carries no
    /// Content-Length, as for plaintext.
    ///
    /// ```
    /// use bytes::Bytes;
    /// use sipwire::codec::SipFrame;
    ///
    /// let frame = SipFrame::from_unit(Bytes::from_static(b"\r\nOPTIONS x\r\nl: 3\r\n\r\nabc"))
    ///     .expect("Content-Length present")
    ///     .expect("boundary present");
    /// assert_eq!(frame.header(), b"OPTIONS x\r\nl: 3\r\n\r\n");
    /// assert_eq!(frame.body(), b"abc");
    ///
    /// assert!(SipFrame::from_unit(Bytes::from_static(b"OPTIONS x\r\n\r\nabc")).is_err());
    /// ```
    pub fn from_unit(mut bytes: Bytes) -> Result<Option<Self>, FramingError> {
        let leading = bytes.iter().take_while(|b| is_line_break(**b)).count();
        bytes.advance(leading);
        let mut scratch = bytes.to_vec();
        let (body_start, content_length) = match BoundaryScanner::new().scan(&mut scratch)? {
            Scan::Boundary {
                body_start,
                content_length,
            } => (body_start, content_length),
            Scan::NeedMore => return Ok(None),
        };
        scratch.truncate(body_start.saturating_add(content_length).min(scratch.len()));
        Ok(Some(Self::new(Bytes::from(scratch), body_start)))
    }

    /// Attach the correlation id returned by the decompressor.
    #[must_use]
    pub fn with_compression_id(mut self, id: u64) -> Self {
        self.compression_id = Some(id);
        self
    }

    /// Whole message.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] { &self.bytes }

    /// Header region, terminator included.
    #[must_use]
    pub fn header(&self) -> &[u8] { &self.bytes[..self.body_start] }

    /// Body region.
    #[must_use]
    pub fn body(&self) -> &[u8] { &self.bytes[self.body_start..] }

    /// Offset of the first body byte.
    #[must_use]
    pub fn body_start(&self) -> usize { self.body_start }

    /// Total message length.
    #[must_use]
    pub fn len(&self) -> usize { self.bytes.len() }

    /// Whether the message has no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.bytes.is_empty() }

    /// Correlation id for messages that arrived compressed.
    #[must_use]
    pub fn compression_id(&self) -> Option<u64> { self.compression_id }

    /// Consume the frame, returning the message bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes { self.bytes }
}
