//! Tests for `MessageFramer` and `ReceiveAccumulator`.

use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;
use rstest::{fixture, rstest};

use super::*;
use crate::codec::sigcomp::{DecompressError, Decompressed};

const MAX: usize = 4096;

fn limit(size: usize) -> NonZeroUsize { NonZeroUsize::new(size).expect("non-zero limit") }

#[allow(unused_braces)]
#[fixture]
fn accumulator() -> ReceiveAccumulator { ReceiveAccumulator::new(limit(MAX)) }

fn bodies(frames: &[SipFrame]) -> Vec<&[u8]> { frames.iter().map(SipFrame::body).collect() }

#[rstest]
fn single_window_yields_message(mut accumulator: ReceiveAccumulator) {
    let frames = accumulator
        .push(b"X-Header: a\r\nContent-Length: 5\r\n\r\nHELLO")
        .expect("framing");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].body(), b"HELLO");
    assert_eq!(frames[0].header(), b"X-Header: a\r\nContent-Length: 5\r\n\r\n");
    assert!(accumulator.is_idle());
}

#[rstest]
fn content_length_split_mid_name(mut accumulator: ReceiveAccumulator) {
    let whole = ReceiveAccumulator::new(limit(MAX))
        .push(b"X-Header: a\r\nContent-Length: 5\r\n\r\nHELLO")
        .expect("framing");
    assert!(
        accumulator
            .push(b"X-Header: a\r\nContent-L")
            .expect("framing")
            .is_empty()
    );
    assert_eq!(accumulator.content_length(), None);
    let split = accumulator
        .push(b"ength: 5\r\n\r\nHELLO")
        .expect("framing");
    assert_eq!(split, whole);
}

#[rstest]
fn two_messages_in_one_window(mut accumulator: ReceiveAccumulator) {
    let window = b"A\r\nl: 0\r\n\r\nB\r\nl: 0\r\n\r\n";
    let frames = accumulator.push(window).expect("framing");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].as_bytes(), b"A\r\nl: 0\r\n\r\n");
    assert_eq!(frames[1].as_bytes(), b"B\r\nl: 0\r\n\r\n");
}

#[rstest]
fn advance_reports_consumed_bytes(mut accumulator: ReceiveAccumulator) {
    let window = b"A\r\nl: 0\r\n\r\nB\r\nl: 0\r\n\r\n";
    let first = accumulator.advance(window).expect("framing");
    assert_eq!(first.consumed, 11);
    assert_eq!(
        first.frame.as_ref().map(SipFrame::as_bytes),
        Some(&b"A\r\nl: 0\r\n\r\n"[..])
    );

    let second = accumulator
        .advance(&window[first.consumed..])
        .expect("framing");
    assert_eq!(second.consumed, 11);
    assert_eq!(
        second.frame.as_ref().map(SipFrame::as_bytes),
        Some(&b"B\r\nl: 0\r\n\r\n"[..])
    );
    assert!(accumulator.is_idle());
}

#[rstest]
fn advance_on_partial_window_consumes_everything(mut accumulator: ReceiveAccumulator) {
    let step = accumulator.advance(b"A\r\nl: 3\r\n\r\nx").expect("framing");
    assert_eq!(step.consumed, 12);
    assert!(step.frame.is_none());
    assert!(accumulator.in_body());

    let step = accumulator.advance(b"yzNEXT").expect("framing");
    assert_eq!(step.consumed, 2);
    assert_eq!(step.frame.map(|f| f.body().to_vec()), Some(b"xyz".to_vec()));
}

#[rstest]
fn leading_line_breaks_are_skipped(mut accumulator: ReceiveAccumulator) {
    let step = accumulator
        .advance(b"\r\n\r\n\nA\r\nl: 0\r\n\r\n")
        .expect("framing");
    let frame = step.frame.expect("message");
    assert_eq!(step.consumed, 16);
    assert_eq!(frame.len(), 11);
    assert!(frame.as_bytes().starts_with(b"A"));
}

#[rstest]
fn keep_alive_only_window_leaves_nothing(mut accumulator: ReceiveAccumulator) {
    assert!(accumulator.push(b"\r\n\r\n").expect("framing").is_empty());
    assert_eq!(accumulator.buffered(), 0);
    assert_eq!(accumulator.finish(), EofError::CleanClose);
}

#[rstest]
fn body_arrives_over_several_windows(mut accumulator: ReceiveAccumulator) {
    assert!(accumulator.push(b"A\r\nl: 10\r\n\r\n01").expect("framing").is_empty());
    assert!(accumulator.push(b"2345").expect("framing").is_empty());
    let frames = accumulator.push(b"6789A").expect("framing");
    assert_eq!(bodies(&frames), vec![&b"0123456789"[..]]);
    assert_eq!(accumulator.buffered(), 1);
}

#[rstest]
fn terminator_split_between_windows(mut accumulator: ReceiveAccumulator) {
    assert!(accumulator.push(b"A\r\nl: 1\r\n\r").expect("framing").is_empty());
    assert!(!accumulator.in_body());
    let frames = accumulator.push(b"\nZ").expect("framing");
    assert_eq!(bodies(&frames), vec![&b"Z"[..]]);
}

#[rstest]
fn missing_content_length_is_fatal(mut accumulator: ReceiveAccumulator) {
    let err = accumulator
        .push(b"INVITE sip:b SIP/2.0\r\nVia: x\r\n\r\n")
        .expect_err("no Content-Length");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::MissingContentLength { .. })
    ));
    assert!(err.should_disconnect());
    assert!(accumulator.is_idle());
}

#[rstest]
fn messages_before_error_are_kept(mut accumulator: ReceiveAccumulator) {
    let mut frames = Vec::new();
    let err = accumulator
        .push_into(b"A\r\nl: 0\r\n\r\nB\r\n\r\n", &mut frames)
        .expect_err("second message lacks Content-Length");
    assert_eq!(frames.len(), 1);
    assert!(err.should_disconnect());
}

#[test]
fn oversized_header_is_rejected() {
    let mut acc = ReceiveAccumulator::new(limit(16));
    let err = acc
        .push(b"X-Very-Long-Header: aaaaaaaa")
        .expect_err("header exceeds limit");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::Oversized { size: 28, max: 16 })
    ));
}

#[test]
fn oversized_declared_body_is_rejected() {
    let mut acc = ReceiveAccumulator::new(limit(64));
    let err = acc
        .push(b"A\r\nl: 100\r\n\r\n")
        .expect_err("declared body exceeds limit");
    assert!(matches!(
        err,
        CodecError::Framing(FramingError::Oversized { size: 113, max: 64 })
    ));
}

#[rstest]
#[case(b"A\r\nl: 1".as_slice(), EofError::TruncatedHeader { received: 7 })]
#[case(b"A\r\nl: 4\r\n\r\nab".as_slice(), EofError::TruncatedBody { received: 13, expected: 15 })]
#[case(b"\r\n".as_slice(), EofError::CleanClose)]
fn finish_classifies_remainder(
    mut accumulator: ReceiveAccumulator,
    #[case] window: &[u8],
    #[case] expected: EofError,
) {
    accumulator.push(window).expect("framing");
    assert_eq!(accumulator.finish(), expected);
    assert!(accumulator.is_idle());
}

#[test]
fn decode_eof_reports_truncation() {
    let mut framer = MessageFramer::new(limit(MAX));
    let mut src = BytesMut::from(&b"A\r\nl: 4\r\n\r\nab"[..]);
    let err = framer.decode_eof(&mut src).expect_err("truncated body");
    assert!(matches!(
        err,
        CodecError::Eof(EofError::TruncatedBody {
            received: 13,
            expected: 15
        })
    ));
    assert!(src.is_empty());

    let mut clean = BytesMut::from(&b"\r\n"[..]);
    assert!(framer.decode_eof(&mut clean).expect("clean close").is_none());
}

/// Test codec: the plaintext is the unit without its one-byte SigComp prefix.
/// Units whose prefix is `0xFB` fail.
#[derive(Default)]
struct StripPrefix {
    next_id: AtomicU64,
}

impl Decompressor for StripPrefix {
    fn decompress(
        &self,
        unit: &[u8],
        reliability: TransportReliability,
    ) -> Result<Decompressed, DecompressError> {
        assert_eq!(reliability, TransportReliability::Stream);
        match unit.split_first() {
            Some((0xFB, _)) | None => Err(DecompressError::new("unknown compartment")),
            Some((_, rest)) => Ok(Decompressed {
                plain: Bytes::copy_from_slice(rest),
                unique_id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            }),
        }
    }
}

fn compressing_accumulator() -> ReceiveAccumulator {
    let framer = MessageFramer::new(limit(MAX))
        .with_decompressor(Arc::new(StripPrefix::default()), TransportReliability::Stream);
    ReceiveAccumulator::from_framer(framer)
}

#[test]
fn compressed_unit_reenters_framing() {
    let mut acc = compressing_accumulator();
    let mut stream = vec![0xF8];
    stream.extend_from_slice(b"MESSAGE x\r\nl: 2\r\n\r\nhi");
    stream.extend_from_slice(&[0xFF, 0xFF]);
    stream.extend_from_slice(b"B\r\nl: 0\r\n\r\n");

    let (head, tail) = stream.split_at(5);
    assert!(acc.push(head).expect("framing").is_empty());
    let frames = acc.push(tail).expect("framing");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].body(), b"hi");
    assert_eq!(frames[0].compression_id(), Some(1));
    assert_eq!(frames[1].compression_id(), None);
}

#[test]
fn decompressed_message_without_content_length_is_dropped() {
    let mut acc = compressing_accumulator();
    let mut stream = vec![0xF8];
    stream.extend_from_slice(b"MESSAGE x\r\nVia: a\r\n\r\nbody-bytes");
    stream.extend_from_slice(&[0xFF, 0xFF]);
    stream.extend_from_slice(b"B\r\nl: 0\r\n\r\n");

    let frames = acc.push(&stream).expect("the connection survives");
    assert_eq!(frames.len(), 1);
    assert!(frames[0].as_bytes().starts_with(b"B"));
    assert_eq!(frames[0].compression_id(), None);
}

#[test]
fn failed_decompression_drops_only_that_message() {
    let mut acc = compressing_accumulator();
    let mut stream = vec![0xFB, 0x01, 0xFF, 0xFF];
    stream.extend_from_slice(b"B\r\nl: 0\r\n\r\n");
    let frames = acc.push(&stream).expect("framing continues");
    assert_eq!(frames.len(), 1);
    assert!(frames[0].as_bytes().starts_with(b"B"));
}

#[test]
fn compressed_bytes_ignored_without_codec() {
    let mut acc = ReceiveAccumulator::new(limit(MAX));
    let err = acc
        .push(b"\xF8garbage\r\n\r\n")
        .expect_err("treated as plaintext without Content-Length");
    assert!(err.should_disconnect());
}

#[derive(Clone, Debug)]
struct Message {
    lines: Vec<String>,
    body: Vec<u8>,
    ending: &'static str,
    leading: usize,
}

impl Message {
    fn encode(&self, out: &mut Vec<u8>) {
        for _ in 0..self.leading {
            out.extend_from_slice(b"\r\n");
        }
        for line in &self.lines {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(self.ending.as_bytes());
        }
        out.extend_from_slice(self.ending.as_bytes());
        out.extend_from_slice(&self.body);
    }
}

fn length_name() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "Content-Length",
        "content-length",
        "CONTENT-LENGTH",
        "Content-length",
        "l",
        "L",
    ])
}

fn fold() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["\r\n ", "\r\n\t", "\n ", "\n\t", "\r ", "\r\t"])
}

fn message() -> impl Strategy<Value = Message> {
    (
        length_name(),
        prop::sample::select(vec!["", " ", "  "]),
        prop::collection::vec("[A-Za-z0-9 ;=.-]{0,12}", 0..4),
        prop::option::of(("[a-z]{1,6}", fold(), "[a-z]{1,6}")),
        prop::collection::vec(any::<u8>(), 0..24),
        prop::sample::select(vec!["\r\n", "\n", "\r"]),
        0usize..3,
    )
        .prop_map(|(name, pad, values, folded, body, ending, leading)| {
            let mut lines = vec!["OPTIONS sip:x SIP/2.0".to_owned()];
            lines.extend(
                values
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| format!("X-H{i}: {v}")),
            );
            if let Some((a, sep, b)) = folded {
                lines.push(format!("Subject: {a}{sep}{b}"));
            }
            lines.push(format!("{name}{pad}: {}", body.len()));
            Message {
                lines,
                body,
                ending,
                leading,
            }
        })
}

fn frame_all(windows: &[&[u8]]) -> Vec<SipFrame> {
    let mut acc = ReceiveAccumulator::new(limit(MAX));
    let mut frames = Vec::new();
    for window in windows {
        acc.push_into(window, &mut frames).expect("framing");
    }
    assert!(acc.is_idle(), "stream ends on a message boundary");
    frames
}

fn frame_by_advance(stream: &[u8], split: usize) -> Vec<SipFrame> {
    let mut acc = ReceiveAccumulator::new(limit(MAX));
    let mut frames = Vec::new();
    for window in [&stream[..split], &stream[split..]] {
        let mut rest = window;
        while !rest.is_empty() {
            let step = acc.advance(rest).expect("framing");
            frames.extend(step.frame);
            rest = &rest[step.consumed..];
        }
    }
    frames
}

proptest! {
    #[test]
    fn split_point_does_not_change_messages(
        messages in prop::collection::vec(message(), 1..4),
        split in any::<prop::sample::Index>(),
    ) {
        let mut stream = Vec::new();
        for m in &messages {
            m.encode(&mut stream);
        }
        let at = split.index(stream.len() + 1);
        let whole = frame_all(&[&stream]);
        prop_assert_eq!(whole.len(), messages.len());
        prop_assert_eq!(frame_all(&[&stream[..at], &stream[at..]]), whole.clone());
        prop_assert_eq!(frame_by_advance(&stream, at), whole);
    }

    #[test]
    fn byte_at_a_time_matches_single_window(message in message()) {
        let mut stream = Vec::new();
        message.encode(&mut stream);
        let windows: Vec<&[u8]> = stream.chunks(1).collect();
        let frames = frame_all(&windows);
        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(frames[0].body(), message.body.as_slice());
        prop_assert_eq!(frame_all(&[&stream]), frames);
    }

    #[test]
    fn folds_normalise_identically(
        message in message(),
        split in any::<prop::sample::Index>(),
    ) {
        let mut stream = Vec::new();
        message.encode(&mut stream);
        let at = split.index(stream.len() + 1);
        let whole = frame_all(&[&stream]);
        let split = frame_all(&[&stream[..at], &stream[at..]]);
        prop_assert_eq!(whole[0].header(), split[0].header());
        if let Some(subject) = message.lines.iter().find(|l| l.starts_with("Subject:")) {
            let blanked: Vec<u8> = subject
                .bytes()
                .map(|b| if b == b'\r' || b == b'\n' { b' ' } else { b })
                .collect();
            prop_assert!(
                whole[0]
                    .header()
                    .windows(blanked.len())
                    .any(|w| w == blanked.as_slice())
            );
        }
    }
}
