//! Indications from the network thread and their processing on the event
//! path.
//!
//! The `on_*` methods and [`ConnectionRegistry::receive`] only queue a
//! [`TransportEvent`]. [`EventHandler::handle`] takes the connection's
//! event-path lock and runs the matching handler, so everything that happens
//! to one connection is serialised with the API calls made on it.

use bytes::Bytes;
use log::{debug, info, warn};

use super::ConnectionRegistry;
use crate::{
    codec::EofError,
    connection::{
        ConnectionHandle,
        ConnectionRecord,
        ConnectionRole,
        ConnectionState,
        ConnectionStatus,
        Locked,
        StateReason,
        TlsState,
        TransportKind,
    },
    dispatch::{EventHandler, StatusTarget, TransportEvent},
    error::{Result, TransportError},
    metrics::{self, DisconnectCause},
    socket::Interest,
};

type Guard<'a> = Locked<'a, ConnectionRecord>;

impl ConnectionRegistry {
    /// Hand bytes read from the socket of `conn` to its accumulator.
    ///
    /// # Errors
    ///
    /// [`TransportError::QueueFull`] or [`TransportError::QueueClosed`] when
    /// the window cannot be queued; the caller keeps the bytes and retries.
    pub fn receive(&self, conn: ConnectionHandle, bytes: Bytes) -> Result<()> {
        self.dispatcher.post(TransportEvent::Received { conn, bytes })
    }

    /// The outgoing connect of `conn` completed.
    pub fn on_connected(&self, conn: ConnectionHandle) { self.post_or_run(TransportEvent::Connected { conn }); }

    /// The peer closed its side of the stream of `conn`.
    pub fn on_peer_closed(&self, conn: ConnectionHandle) { self.post_or_run(TransportEvent::PeerClosed { conn }); }

    /// The socket of `conn` is closed.
    pub fn on_closed(&self, conn: ConnectionHandle) { self.post_or_run(TransportEvent::SocketClosed { conn }); }

    /// The TLS layer of `conn` moved to `state`.
    pub fn on_tls_state(&self, conn: ConnectionHandle, state: TlsState) {
        self.post_or_run(TransportEvent::TlsStateChanged { conn, state });
    }

    /// The socket of `conn` reported an error.
    pub fn on_network_error(&self, conn: ConnectionHandle) {
        self.post_or_run(TransportEvent::NetworkError { conn });
    }

    /// The socket of `conn` wrote `written` bytes of its outbound queue.
    pub fn on_bytes_sent(&self, conn: ConnectionHandle, written: usize) {
        self.post_or_run(TransportEvent::BytesSent { conn, written });
    }

    /// An SCTP association event worth telling the owners of `conn` about.
    pub fn on_sctp_status(&self, conn: ConnectionHandle, status: ConnectionStatus) {
        match self.lock_event(conn) {
            Ok(guard) => self.queue_status(&guard, conn, status, StatusTarget::All),
            Err(err) => debug!("{status} for {conn} dropped: {err}"),
        }
    }

    fn process(&self, guard: &Guard<'_>, conn: ConnectionHandle, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::StateChanged { state, reason, .. } => {
                self.notify_state(guard, conn, state, reason);
                Ok(())
            }
            TransportEvent::Status { status, target, .. } => {
                self.notify_status(guard, conn, status, target);
                Ok(())
            }
            TransportEvent::Received { bytes, .. } => self.handle_received(guard, conn, &bytes),
            TransportEvent::Connected { .. } => {
                self.handle_connected(guard, conn);
                Ok(())
            }
            TransportEvent::PeerClosed { .. } => self.handle_peer_closed(guard, conn),
            TransportEvent::SocketClosed { .. } => {
                self.handle_socket_closed(guard, conn);
                Ok(())
            }
            TransportEvent::TlsStateChanged { state, .. } => {
                self.handle_tls_state(guard, conn, state);
                Ok(())
            }
            TransportEvent::BytesSent { written, .. } => {
                self.handle_bytes_sent(guard, conn, written);
                Ok(())
            }
            TransportEvent::NetworkError { .. } => {
                warn!("network error on {conn}");
                self.queue_status(guard, conn, ConnectionStatus::Error, StatusTarget::All);
                self.disconnect_locked(guard, conn, StateReason::Undefined, DisconnectCause::NetworkError);
                Ok(())
            }
            TransportEvent::IdleTimerExpired { ticket, .. } => {
                self.handle_timer(guard, conn, ticket);
                Ok(())
            }
            TransportEvent::Terminated { .. } => {
                self.release_terminated(guard, conn);
                Ok(())
            }
            TransportEvent::Shutdown => Ok(()),
        }
    }

    fn handle_received(&self, guard: &Guard<'_>, conn: ConnectionHandle, bytes: &[u8]) -> Result<()> {
        let mut frames = Vec::new();
        let (transport, outcome) = {
            let mut rec = guard.data();
            if rec.state.is_closing() {
                debug!("dropping {} bytes read on closing {conn}", bytes.len());
                return Ok(());
            }
            let outcome = rec.receive.push_into(bytes, &mut frames);
            (rec.transport, outcome)
        };
        if !frames.is_empty() && self.pool().idle.remove(conn) {
            debug!("{conn} left the idle list on receipt");
        }
        for frame in frames {
            metrics::inc_messages(transport);
            guard.released(|| self.sink.on_frame(conn, transport, frame))?;
        }
        match outcome {
            Ok(()) => {}
            Err(err) if err.should_disconnect() => {
                warn!("framing failed on {conn}: {err}");
                guard.data().net_error = true;
                self.disconnect_locked(guard, conn, StateReason::Undefined, DisconnectCause::Framing);
            }
            Err(err) => debug!("message dropped on {conn}: {err}"),
        }
        Ok(())
    }

    fn handle_connected(&self, guard: &Guard<'_>, conn: ConnectionHandle) {
        let (transport, socket) = {
            let rec = guard.data();
            if rec.role != ConnectionRole::Client || rec.state != ConnectionState::Connecting {
                debug!("ignoring connect completion on {conn} in {}", rec.state);
                return;
            }
            (rec.transport, rec.socket)
        };
        let state = match transport {
            TransportKind::Sctp => ConnectionState::SctpConnected,
            TransportKind::Tcp | TransportKind::Tls => ConnectionState::TcpConnected,
        };
        self.change_state(guard, conn, state, StateReason::ClientConnected);
        let Some(socket) = socket else {
            return;
        };
        if let Err(err) = self.socket.register(socket, Interest::ReadWrite) {
            warn!("registering {socket} of {conn} failed: {err}");
            self.queue_status(guard, conn, ConnectionStatus::Error, StatusTarget::All);
            self.disconnect_locked(guard, conn, StateReason::Undefined, DisconnectCause::NetworkError);
        }
    }

    fn handle_peer_closed(&self, guard: &Guard<'_>, conn: ConnectionHandle) -> Result<()> {
        let (partial, eof) = {
            let mut rec = guard.data();
            if rec.state.is_closing() {
                return Ok(());
            }
            let partial = rec.receive.pending().to_vec();
            (partial, rec.receive.finish())
        };
        guard.released(|| self.hooks.on_eof(conn, &eof, &partial))?;
        let cause = if eof == EofError::CleanClose {
            info!("{conn} closed by peer");
            DisconnectCause::PeerClosed
        } else {
            warn!("{conn} closed by peer mid-message: {eof}");
            guard.data().net_error = true;
            DisconnectCause::Framing
        };
        self.disconnect_locked(guard, conn, StateReason::Undefined, cause);
        Ok(())
    }

    fn handle_tls_state(&self, guard: &Guard<'_>, conn: ConnectionHandle, state: TlsState) {
        let (closing, unowned) = {
            let mut rec = guard.data();
            if rec.transport != TransportKind::Tls {
                debug!("ignoring TLS state {state} on non-TLS {conn}");
                return;
            }
            rec.tls_state = state;
            (rec.state.is_closing(), rec.is_unowned())
        };
        tracing::debug!(%conn, tls_state = %state, "TLS state changed");
        if closing {
            return;
        }
        match state {
            TlsState::CloseSequenceStarted | TlsState::Terminated => {
                self.disconnect_locked(guard, conn, StateReason::Undefined, DisconnectCause::Tls);
            }
            TlsState::Connected if unowned => self.apply_no_owner_policy(guard, conn, false),
            _ => {}
        }
    }

    fn handle_bytes_sent(&self, guard: &Guard<'_>, conn: ConnectionHandle, written: usize) {
        let completed = self
            .pool()
            .queues
            .get_mut(conn.slot())
            .map(|queue| queue.advance(written))
            .unwrap_or_default();
        for done in completed {
            let Some(owner) = done.owner else {
                debug!("unowned {} written on {conn}", done.id);
                continue;
            };
            self.notify_status(
                guard,
                conn,
                ConnectionStatus::MsgSent,
                StatusTarget::Owner(owner, Some(done.id)),
            );
        }
    }

    fn handle_timer(&self, guard: &Guard<'_>, conn: ConnectionHandle, ticket: u64) {
        {
            let mut rec = guard.data();
            let current = rec.timer.as_ref().map(|timer| timer.ticket);
            if current != Some(ticket) {
                debug!("ignoring stale idle timer {ticket} on {conn}");
                return;
            }
            rec.timer = None;
            if !rec.is_unowned() {
                return;
            }
        }
        info!("idle timer expired on {conn}");
        self.disconnect_locked(guard, conn, StateReason::Undefined, DisconnectCause::IdleTimer);
    }
}

impl EventHandler for ConnectionRegistry {
    fn handle(&self, event: TransportEvent) {
        let Some(conn) = event.connection() else {
            return;
        };
        let outcome = self
            .lock_event(conn)
            .and_then(|guard| self.process(&guard, conn, event));
        match outcome {
            Ok(()) => {}
            Err(TransportError::Destructed) => debug!("event for recycled {conn} dropped"),
            Err(err) => warn!("processing event for {conn} failed: {err}"),
        }
    }
}
