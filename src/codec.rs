//! Stream reassembly for SIP over connection-oriented transports.
//!
//! Inbound bytes arrive in arbitrary windows. The types here turn those
//! windows into complete messages:
//!
//! - [`scanner::BoundaryScanner`] finds the header/body boundary and the
//!   Content-Length header, resuming exactly where the previous window ended.
//! - [`ReceiveAccumulator`] keeps the per-connection buffer and yields zero or
//!   more [`SipFrame`]s per read.
//! - [`sigcomp`] isolates compressed units and hands them to an external
//!   [`Decompressor`]; the plaintext re-enters the same framer.
//!
//! # Error Handling
//!
//! See the [`error`] module. Framing errors and truncated streams cost the
//! connection ([`CodecError::should_disconnect`]); a decompression failure only
//! drops the affected message.

use std::{num::NonZeroUsize, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub mod accumulator;
pub mod error;
pub mod frame;
pub mod scanner;
pub mod sigcomp;

pub use accumulator::{Advance, MessageFramer, ReceiveAccumulator};
pub use error::{CodecError, DecompressError, EofError, FramingError};
pub use frame::SipFrame;
pub use scanner::{BoundaryScanner, Scan};
pub use sigcomp::{Decompressed, Decompressor, TransportReliability};

use crate::config::{MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE};

pub(crate) fn clamp_message_size(value: NonZeroUsize) -> NonZeroUsize {
    NonZeroUsize::new(value.get().clamp(MIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE)).unwrap_or(value)
}

/// [`Decoder`]/[`Encoder`] pair for SIP over a byte stream.
///
/// Lets the framer sit under `tokio_util::codec::FramedRead` and friends.
/// Outbound messages are already encoded by the layer above, so encoding only
/// enforces the size limit.
///
/// ```
/// use std::num::NonZeroUsize;
///
/// use bytes::BytesMut;
/// use sipwire::codec::SipStreamCodec;
/// use tokio_util::codec::Decoder;
///
/// let mut codec = SipStreamCodec::new(NonZeroUsize::new(4096).expect("non-zero"));
/// let mut buf = BytesMut::from(&b"\r\nOPTIONS sip:a SIP/2.0\r\nl: 2\r\n\r\nhi"[..]);
/// let frame = codec.decode(&mut buf).expect("framing").expect("complete");
/// assert_eq!(frame.body(), b"hi");
/// assert!(buf.is_empty());
/// ```
#[derive(Debug)]
pub struct SipStreamCodec {
    framer: MessageFramer,
    max_message_size: usize,
}

impl SipStreamCodec {
    /// Create a codec for plaintext streams.
    ///
    /// `max_message_size` is clamped to the supported range.
    #[must_use]
    pub fn new(max_message_size: NonZeroUsize) -> Self {
        let max = clamp_message_size(max_message_size);
        Self {
            framer: MessageFramer::new(max),
            max_message_size: max.get(),
        }
    }

    /// Create a codec that also accepts compressed units.
    #[must_use]
    pub fn with_decompressor(
        max_message_size: NonZeroUsize,
        decompressor: Arc<dyn Decompressor>,
    ) -> Self {
        let max = clamp_message_size(max_message_size);
        Self {
            framer: MessageFramer::new(max)
                .with_decompressor(decompressor, TransportReliability::Stream),
            max_message_size: max.get(),
        }
    }

    /// Largest message accepted in either direction.
    #[must_use]
    pub fn max_message_size(&self) -> usize { self.max_message_size }
}

impl Decoder for SipStreamCodec {
    type Item = SipFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.framer.decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.framer.decode_eof(src)
    }
}

impl Encoder<Bytes> for SipStreamCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_message_size {
            return Err(FramingError::Oversized {
                size: item.len(),
                max: self.max_message_size,
            }
            .into());
        }
        dst.extend_from_slice(&item);
        Ok(())
    }
}
