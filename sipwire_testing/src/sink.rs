//! Frame sink collecting everything delivered.

use std::sync::{Mutex, PoisonError};

use sipwire::{
    SipFrame,
    connection::{ConnectionHandle, TransportKind},
    message::FrameSink,
};

/// Keeps every delivered frame.
#[derive(Debug, Default)]
pub struct CollectingSink {
    frames: Mutex<Vec<(ConnectionHandle, TransportKind, SipFrame)>>,
}

impl CollectingSink {
    /// Frames delivered on `conn`, in order.
    #[must_use]
    pub fn frames_for(&self, conn: ConnectionHandle) -> Vec<SipFrame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(c, _, _)| *c == conn)
            .map(|(_, _, frame)| frame.clone())
            .collect()
    }

    /// Number of frames delivered on any connection.
    #[must_use]
    pub fn len(&self) -> usize { self.frames.lock().unwrap_or_else(PoisonError::into_inner).len() }

    /// Whether nothing was delivered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl FrameSink for CollectingSink {
    fn on_frame(&self, conn: ConnectionHandle, transport: TransportKind, frame: SipFrame) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((conn, transport, frame));
    }
}
