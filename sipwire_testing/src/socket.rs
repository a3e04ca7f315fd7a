//! Socket driver double recording every request.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Mutex,
        PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use sipwire::{
    connection::{LocalAddress, SocketId, TransportKind},
    socket::{Interest, SocketDriver},
};

/// One request made to a [`RecordingSocketDriver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketCall {
    /// `construct`, with the id handed out.
    Construct(SocketId, TransportKind, SocketAddr),
    /// `register`.
    Register(SocketId, Interest),
    /// `deregister`.
    Deregister(SocketId),
    /// `close`.
    Close(SocketId),
}

/// Records requests and optionally fails registrations.
#[derive(Debug, Default)]
pub struct RecordingSocketDriver {
    calls: Mutex<Vec<SocketCall>>,
    next: AtomicU64,
    fail_register: AtomicBool,
}

impl RecordingSocketDriver {
    /// Requests so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<SocketCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sockets closed so far.
    #[must_use]
    pub fn closed(&self) -> Vec<SocketId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SocketCall::Close(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Make every following `register` fail.
    pub fn fail_registrations(&self) { self.fail_register.store(true, Ordering::Relaxed); }

    fn push(&self, call: SocketCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl SocketDriver for RecordingSocketDriver {
    fn construct(
        &self,
        transport: TransportKind,
        _local: &LocalAddress,
        remote: SocketAddr,
    ) -> io::Result<SocketId> {
        let id = SocketId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.push(SocketCall::Construct(id, transport, remote));
        Ok(id)
    }

    fn register(&self, socket: SocketId, interest: Interest) -> io::Result<()> {
        self.push(SocketCall::Register(socket, interest));
        if self.fail_register.load(Ordering::Relaxed) {
            return Err(io::Error::other("registration refused"));
        }
        Ok(())
    }

    fn deregister(&self, socket: SocketId) -> io::Result<()> {
        self.push(SocketCall::Deregister(socket));
        Ok(())
    }

    fn close(&self, socket: SocketId) -> io::Result<()> {
        self.push(SocketCall::Close(socket));
        Ok(())
    }
}
