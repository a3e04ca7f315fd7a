//! Socket I/O collaborator boundary.
//!
//! The registry never touches descriptors. It asks a [`SocketDriver`] to open,
//! register, deregister and close sockets, and the network thread reports
//! back through the registry's `on_*` indications.

use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::connection::{LocalAddress, SocketId, TransportKind};

/// Readiness a socket is registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    /// Outgoing connect completion.
    Connect,
    /// Inbound data and close.
    Read,
    /// Inbound data, close and write readiness.
    ReadWrite,
}

/// Socket operations requested by the registry.
pub trait SocketDriver: Send + Sync + 'static {
    /// Create a socket bound to `local` for a connection towards `remote`.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the socket cannot be created.
    fn construct(
        &self,
        transport: TransportKind,
        local: &LocalAddress,
        remote: SocketAddr,
    ) -> io::Result<SocketId>;

    /// Register `socket` with the event loop.
    ///
    /// # Errors
    ///
    /// Returns the OS error when registration fails.
    fn register(&self, socket: SocketId, interest: Interest) -> io::Result<()>;

    /// Stop delivering events for `socket`.
    ///
    /// # Errors
    ///
    /// Returns the OS error when the socket is unknown to the event loop.
    fn deregister(&self, socket: SocketId) -> io::Result<()>;

    /// Close `socket`. Completion is reported through
    /// [`crate::registry::ConnectionRegistry::on_closed`].
    ///
    /// # Errors
    ///
    /// Returns the OS error when the close cannot be started.
    fn close(&self, socket: SocketId) -> io::Result<()>;
}

/// Driver that hands out socket ids and performs no I/O.
///
/// Useful when the host feeds the registry from its own event loop and only
/// needs identifiers.
#[derive(Debug, Default)]
pub struct DetachedSockets {
    next: AtomicU64,
}

impl SocketDriver for DetachedSockets {
    fn construct(
        &self,
        _transport: TransportKind,
        _local: &LocalAddress,
        _remote: SocketAddr,
    ) -> io::Result<SocketId> {
        Ok(SocketId(self.next.fetch_add(1, Ordering::Relaxed) + 1))
    }

    fn register(&self, _socket: SocketId, _interest: Interest) -> io::Result<()> { Ok(()) }

    fn deregister(&self, _socket: SocketId) -> io::Result<()> { Ok(()) }

    fn close(&self, _socket: SocketId) -> io::Result<()> { Ok(()) }
}
