//! Connection records and the primitives guarding them.
//!
//! A [`ConnectionHandle`] names one pooled record *and* the incarnation the
//! caller knows about. Records are recycled under a fresh unique id, so a
//! handle kept past its record's termination is rejected with
//! [`crate::TransportError::Destructed`] rather than reaching the next
//! occupant of the slot.

use std::{fmt, net::SocketAddr};

pub mod counter;
pub mod lock;
pub mod owners;
pub mod record;
pub mod send_queue;
pub mod state;

pub use counter::live_connection_count;
pub use lock::{ApiGuard, EventGuard, Locked, TripleLock};
pub use owners::{ConnectionOwner, OwnerId, OwnerList, OwnerRegistry};
pub use record::{ConnectionRecord, NoOwnerAction};
pub use send_queue::{Completed, PendingSend, SendId, SendQueue};
pub use state::{
    ConnectionRole,
    ConnectionState,
    ConnectionStatus,
    StateReason,
    TlsState,
    TransportKind,
};

/// Generation-tagged reference to a pooled connection record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle {
    index: u32,
    id: u64,
}

impl ConnectionHandle {
    /// Create a handle for slot `index` holding incarnation `id`.
    #[must_use]
    pub fn new(index: u32, id: u64) -> Self { Self { index, id } }

    /// Pool slot.
    #[must_use]
    pub fn index(&self) -> u32 { self.index }

    /// Unique id of the incarnation.
    #[must_use]
    pub fn id(&self) -> u64 { self.id }

    pub(crate) fn slot(&self) -> usize { self.index as usize }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}.{}", self.index, self.id)
    }
}

/// Local address a connection is bound to.
///
/// `id` identifies the configured local address; two connections on the same
/// local address share it. The socket address drives dual-stack matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LocalAddress {
    /// Configured local address identifier.
    pub id: u32,
    /// Bound socket address.
    pub addr: SocketAddr,
}

impl LocalAddress {
    /// Describe local address `id` bound to `addr`.
    #[must_use]
    pub fn new(id: u32, addr: SocketAddr) -> Self { Self { id, addr } }
}

/// Opaque socket identifier issued by the socket collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SocketId(pub u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "socket#{}", self.0) }
}
