//! Delivery of complete inbound messages.
//!
//! The registry hands every framed [`SipFrame`] to a [`FrameSink`]. Most
//! applications plug in a [`MessagePipeline`], which parses the frame with a
//! [`MessageModel`] and delivers the result to a [`MessageSink`]. A message
//! the model flags as bad syntax is still delivered, with the flag set, unless
//! the sink's [`MessageSink::on_bad_syntax`] asks for it to be discarded.

use std::{fmt, sync::Arc};

use log::debug;

use crate::{
    codec::SipFrame,
    connection::{ConnectionHandle, TransportKind},
};

/// Receives every complete inbound frame.
pub trait FrameSink: Send + Sync + 'static {
    /// A message arrived on `conn`.
    fn on_frame(&self, conn: ConnectionHandle, transport: TransportKind, frame: SipFrame);
}

impl<S: FrameSink + ?Sized> FrameSink for Arc<S> {
    fn on_frame(&self, conn: ConnectionHandle, transport: TransportKind, frame: SipFrame) {
        (**self).on_frame(conn, transport, frame);
    }
}

/// Sink that drops every frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardFrames;

impl FrameSink for DiscardFrames {
    fn on_frame(&self, conn: ConnectionHandle, _transport: TransportKind, frame: SipFrame) {
        debug!("discarding {} byte message on {conn}", frame.len());
    }
}

/// Outcome of parsing one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Parsed<M> {
    /// Well-formed message.
    Ok(M),
    /// Message built despite a syntax problem.
    BadSyntax {
        /// What could be salvaged.
        message: M,
        /// Human-readable description of the problem.
        reason: String,
    },
}

/// Message-model collaborator turning a frame into an application message.
pub trait MessageModel: Send + Sync + 'static {
    /// Parsed message type.
    type Message: Send;

    /// Parse `frame`. Parsing never fails outright: malformed input is
    /// reported through [`Parsed::BadSyntax`].
    fn parse(&self, frame: &SipFrame) -> Parsed<Self::Message>;
}

/// Model that keeps the frame as the message.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawModel;

impl MessageModel for RawModel {
    type Message = SipFrame;

    fn parse(&self, frame: &SipFrame) -> Parsed<SipFrame> { Parsed::Ok(frame.clone()) }
}

/// A parsed message and where it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage<M> {
    /// Connection the message arrived on.
    pub conn: ConnectionHandle,
    /// Transport of that connection.
    pub transport: TransportKind,
    /// The message.
    pub message: M,
    /// Correlation id returned by the decompressor, to be echoed back.
    pub compression_id: Option<u64>,
    /// Syntax problem reported by the model, if any.
    pub bad_syntax: Option<String>,
}

/// What to do with a message flagged as bad syntax.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BadSyntaxVerdict {
    /// Deliver it with the flag set.
    #[default]
    Continue,
    /// Drop it.
    Discard,
}

/// Consumer of parsed messages.
pub trait MessageSink<M>: Send + Sync + 'static {
    /// A message is ready.
    fn on_message(&self, message: InboundMessage<M>);

    /// Decide the fate of a bad-syntax message before it is delivered.
    fn on_bad_syntax(&self, _conn: ConnectionHandle, _message: &M, _reason: &str) -> BadSyntaxVerdict {
        BadSyntaxVerdict::Continue
    }
}

/// [`FrameSink`] parsing frames with `P` and delivering them to `S`.
pub struct MessagePipeline<P, S> {
    model: P,
    sink: S,
}

impl<P, S> fmt::Debug for MessagePipeline<P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePipeline").finish_non_exhaustive()
    }
}

impl<P, S> MessagePipeline<P, S>
where
    P: MessageModel,
    S: MessageSink<P::Message>,
{
    /// Combine a model and a sink.
    pub fn new(model: P, sink: S) -> Self { Self { model, sink } }

    /// The sink messages are delivered to.
    pub fn sink(&self) -> &S { &self.sink }
}

impl<P, S> FrameSink for MessagePipeline<P, S>
where
    P: MessageModel,
    S: MessageSink<P::Message>,
{
    fn on_frame(&self, conn: ConnectionHandle, transport: TransportKind, frame: SipFrame) {
        let compression_id = frame.compression_id();
        let (message, bad_syntax) = match self.model.parse(&frame) {
            Parsed::Ok(message) => (message, None),
            Parsed::BadSyntax { message, reason } => {
                if self.sink.on_bad_syntax(conn, &message, &reason) == BadSyntaxVerdict::Discard {
                    debug!("bad-syntax message on {conn} discarded: {reason}");
                    return;
                }
                (message, Some(reason))
            }
        };
        self.sink.on_message(InboundMessage {
            conn,
            transport,
            message,
            compression_id,
            bad_syntax,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use rstest::rstest;

    use super::*;

    /// Flags messages whose start line lacks a SIP version.
    struct StartLine;

    impl MessageModel for StartLine {
        type Message = String;

        fn parse(&self, frame: &SipFrame) -> Parsed<String> {
            let header = String::from_utf8_lossy(frame.header()).into_owned();
            let line = header.lines().next().unwrap_or_default().to_string();
            if line.contains("SIP/2.0") {
                Parsed::Ok(line)
            } else {
                Parsed::BadSyntax {
                    message: line,
                    reason: "missing SIP version".into(),
                }
            }
        }
    }

    struct Collect {
        verdict: BadSyntaxVerdict,
        seen: Mutex<Vec<InboundMessage<String>>>,
    }

    impl MessageSink<String> for Collect {
        fn on_message(&self, message: InboundMessage<String>) {
            self.seen.lock().expect("sink lock").push(message);
        }

        fn on_bad_syntax(&self, _conn: ConnectionHandle, _message: &String, _reason: &str) -> BadSyntaxVerdict {
            self.verdict
        }
    }

    fn frame(text: &'static str) -> SipFrame {
        let bytes = Bytes::from_static(text.as_bytes());
        let body_start = text.find("\r\n\r\n").map_or(text.len(), |i| i + 4);
        SipFrame::new(bytes, body_start)
    }

    #[rstest]
    #[case(BadSyntaxVerdict::Continue, 2)]
    #[case(BadSyntaxVerdict::Discard, 1)]
    fn bad_syntax_follows_verdict(#[case] verdict: BadSyntaxVerdict, #[case] delivered: usize) {
        let pipeline = MessagePipeline::new(
            StartLine,
            Collect {
                verdict,
                seen: Mutex::new(Vec::new()),
            },
        );
        let conn = ConnectionHandle::new(0, 1);
        pipeline.on_frame(conn, TransportKind::Tcp, frame("OPTIONS sip:a SIP/2.0\r\n\r\n"));
        pipeline.on_frame(conn, TransportKind::Tcp, frame("garbage\r\n\r\n"));

        let seen = pipeline.sink().seen.lock().expect("sink lock");
        assert_eq!(seen.len(), delivered);
        assert_eq!(seen[0].bad_syntax, None);
        if delivered == 2 {
            assert_eq!(seen[1].bad_syntax.as_deref(), Some("missing SIP version"));
            assert_eq!(seen[1].message, "garbage");
        }
    }

    #[test]
    fn compression_id_is_forwarded() {
        struct Keep(Mutex<Option<InboundMessage<SipFrame>>>);
        impl MessageSink<SipFrame> for Keep {
            fn on_message(&self, message: InboundMessage<SipFrame>) {
                *self.0.lock().expect("sink lock") = Some(message);
            }
        }

        let pipeline = MessagePipeline::new(RawModel, Keep(Mutex::new(None)));
        pipeline.on_frame(
            ConnectionHandle::new(3, 4),
            TransportKind::Tls,
            frame("ACK sip:a SIP/2.0\r\n\r\n").with_compression_id(7),
        );
        let got = pipeline
            .sink()
            .0
            .lock()
            .expect("sink lock")
            .take()
            .expect("delivered");
        assert_eq!(got.compression_id, Some(7));
        assert_eq!(got.transport, TransportKind::Tls);
    }
}
