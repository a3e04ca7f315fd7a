//! Frame SIP messages read from standard input.
//!
//! Reads a raw SIP byte stream (for example a captured TCP flow) from stdin
//! and logs every complete message with its header and body sizes. The
//! maximum message size can be given as the first argument.

use std::num::NonZeroUsize;

use futures::StreamExt;
use sipwire::SipStreamCodec;
use tokio_util::codec::FramedRead;

const DEFAULT_MAX_MESSAGE: usize = 64 * 1024;

#[tokio::main]
async fn main() {
    // Applications embedding the library should install their own subscriber.
    tracing_subscriber::fmt::init();

    let max = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<NonZeroUsize>().ok())
        .or(NonZeroUsize::new(DEFAULT_MAX_MESSAGE))
        .unwrap_or(NonZeroUsize::MIN);
    let mut frames = FramedRead::new(tokio::io::stdin(), SipStreamCodec::new(max));
    let mut count = 0usize;
    while let Some(next) = frames.next().await {
        match next {
            Ok(frame) => {
                count += 1;
                tracing::info!(
                    message = count,
                    header_bytes = frame.body_start(),
                    body_bytes = frame.body().len(),
                    "framed message"
                );
            }
            Err(err) => {
                tracing::error!(error = %err, "stream cannot be framed");
                std::process::exit(1);
            }
        }
    }
    tracing::info!(messages = count, "end of stream");
}
