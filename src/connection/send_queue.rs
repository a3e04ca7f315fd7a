//! Outbound messages waiting on a connection.

use std::{collections::VecDeque, fmt};

use bytes::Bytes;

use super::OwnerId;

/// Identifier of one queued outbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendId(u64);

impl SendId {
    /// Create a send id.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for SendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "SendId({})", self.0) }
}

/// One outbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingSend {
    /// Queue-wide id.
    pub id: SendId,
    /// Owner to notify; `None` once the owner detached mid-send.
    pub owner: Option<OwnerId>,
    /// Encoded message.
    pub buffer: Bytes,
    /// Bytes already written to the socket.
    pub sent: usize,
    /// Keep the message when its owner detaches.
    pub dont_remove: bool,
}

impl PendingSend {
    /// Bytes still to write.
    #[must_use]
    pub fn remaining(&self) -> usize { self.buffer.len().saturating_sub(self.sent) }

    fn survives_detach(&self) -> bool { self.sent > 0 || self.dont_remove }
}

/// A message the socket finished writing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completed {
    /// The message.
    pub id: SendId,
    /// Owner to tell, if it is still attached.
    pub owner: Option<OwnerId>,
}

/// FIFO of outbound messages for one connection.
#[derive(Debug, Default)]
pub struct SendQueue {
    pending: VecDeque<PendingSend>,
}

impl SendQueue {
    /// Append a message.
    pub fn push(&mut self, send: PendingSend) { self.pending.push_back(send); }

    /// Message currently being written.
    #[must_use]
    pub fn head(&self) -> Option<&PendingSend> { self.pending.front() }

    /// Account for `written` bytes leaving the socket and pop every message
    /// that is now complete.
    pub fn advance(&mut self, mut written: usize) -> Vec<Completed> {
        let mut done = Vec::new();
        while let Some(head) = self.pending.front_mut() {
            let step = written.min(head.remaining());
            head.sent += step;
            written -= step;
            if head.remaining() > 0 {
                break;
            }
            if let Some(send) = self.pending.pop_front() {
                done.push(Completed {
                    id: send.id,
                    owner: send.owner,
                });
            }
        }
        done
    }

    /// Release `owner`'s messages.
    ///
    /// Unstarted messages are dropped. Partially written ones, and those
    /// flagged `dont_remove`, are kept without an owner in a buffer of their
    /// own so the write can finish. Returns the number of dropped messages.
    pub fn detach(&mut self, owner: OwnerId) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|send| send.owner != Some(owner) || send.survives_detach());
        for send in &mut self.pending {
            if send.owner == Some(owner) {
                send.owner = None;
                send.buffer = Bytes::copy_from_slice(&send.buffer);
            }
        }
        before - self.pending.len()
    }

    /// Each distinct owner with queued messages, with its first message, in
    /// queue order.
    #[must_use]
    pub fn unsent_owners(&self) -> Vec<(OwnerId, SendId)> {
        let mut owners: Vec<(OwnerId, SendId)> = Vec::new();
        for send in &self.pending {
            let Some(owner) = send.owner else { continue };
            if !owners.iter().any(|(o, _)| *o == owner) {
                owners.push((owner, send.id));
            }
        }
        owners
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize { self.pending.len() }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.pending.is_empty() }

    /// Drop everything.
    pub fn clear(&mut self) { self.pending.clear(); }
}
