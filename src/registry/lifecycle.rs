//! Allocation, reuse, state changes, disconnection and termination.

use std::{net::SocketAddr, sync::Arc, sync::atomic::Ordering};

use log::{debug, error, info, warn};

use super::{ConnectionRegistry, key::ConnectionKey, timer};
use crate::{
    connection::{
        ConnectionHandle,
        ConnectionOwner,
        ConnectionRecord,
        ConnectionRole,
        ConnectionState,
        ConnectionStatus,
        LocalAddress,
        Locked,
        OwnerId,
        SocketId,
        StateReason,
        TransportKind,
        record::RecordInit,
    },
    dispatch::{EventHandler, StatusTarget, TransportEvent},
    error::{Result, TransportError},
    metrics::{self, DisconnectCause},
    socket::Interest,
};

/// A request for a client connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Transport and addressing the connection must match.
    pub key: ConnectionKey,
    /// Open a new connection even if a matching one exists. Ignored for
    /// SCTP, which always reuses.
    pub force_creation: bool,
}

impl ConnectRequest {
    /// Request reuse of a connection matching `key`.
    #[must_use]
    pub fn new(key: ConnectionKey) -> Self {
        Self {
            key,
            force_creation: false,
        }
    }

    /// Request a fresh connection.
    #[must_use]
    pub fn forced(key: ConnectionKey) -> Self {
        Self {
            key,
            force_creation: true,
        }
    }
}

/// Connection handed out by [`ConnectionRegistry::find_or_create`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Acquired {
    /// The connection.
    pub handle: ConnectionHandle,
    /// Whether an existing connection was reused.
    pub reused: bool,
}

/// A connection accepted by a listening socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Accepted {
    /// Transport of the connection.
    pub transport: TransportKind,
    /// [`ConnectionRole::Server`] for an accepted peer,
    /// [`ConnectionRole::MultiServer`] for a listening endpoint.
    pub role: ConnectionRole,
    /// Local address it was accepted on.
    pub local: LocalAddress,
    /// Peer address.
    pub remote: Option<SocketAddr>,
    /// Socket issued by the driver.
    pub socket: SocketId,
}

type Guard<'a> = Locked<'a, ConnectionRecord>;

impl ConnectionRegistry {
    /// Find a connection matching `request.key` or allocate a new one, and
    /// attach `owner` to it.
    ///
    /// A hashed candidate is reused only if it is still the same incarnation,
    /// in a state able to carry traffic, free of network errors and without
    /// an armed disconnection timer. A newly allocated client starts in
    /// [`ConnectionState::Ready`]; call [`connect`](Self::connect) to open it.
    ///
    /// # Errors
    ///
    /// [`TransportError::PoolExhausted`] when no record is free, or the error
    /// of attaching the owner. A record allocated by this call is terminated
    /// when the attach fails.
    pub fn find_or_create(
        &self,
        request: ConnectRequest,
        owner: OwnerId,
        callbacks: Arc<dyn ConnectionOwner>,
    ) -> Result<Acquired> {
        let ConnectRequest {
            key,
            force_creation,
        } = request;
        let force = force_creation && key.transport != TransportKind::Sctp;
        let hash_key = key.hash_key();
        if !force {
            let candidate = self.pool().lookup(&hash_key);
            if let Some(handle) = candidate {
                if let Some(acquired) = self.try_reuse(handle, owner, &callbacks)? {
                    return Ok(acquired);
                }
            }
        }

        let handle = self.allocate(RecordInit {
            transport: key.transport,
            role: ConnectionRole::Client,
            local: key.local,
            remote: key.remote_socket(),
            alias: None,
            socket: None,
        })?;
        let guard = self.lock_api(handle)?;
        if !force {
            self.pool().insert_primary(hash_key, handle);
        }
        if let Err(err) = self.attach_locked(&guard, handle, owner, callbacks) {
            warn!("attaching {owner} to new connection {handle} failed: {err}");
            self.terminate_locked(&guard, handle);
            return Err(err);
        }
        Ok(Acquired {
            handle,
            reused: false,
        })
    }

    fn try_reuse(
        &self,
        handle: ConnectionHandle,
        owner: OwnerId,
        callbacks: &Arc<dyn ConnectionOwner>,
    ) -> Result<Option<Acquired>> {
        let Ok(guard) = self.lock_api(handle) else {
            debug!("hashed candidate {handle} was recycled");
            return Ok(None);
        };
        let current = self.slot(handle)?.id();
        let reusable = guard.data().is_reusable(current, handle.id());
        if !reusable {
            debug!("hashed candidate {handle} is not reusable");
            return Ok(None);
        }
        self.attach_locked(&guard, handle, owner, Arc::clone(callbacks))?;
        debug!("reusing {handle} for {owner}");
        Ok(Some(Acquired {
            handle,
            reused: true,
        }))
    }

    fn allocate(&self, init: RecordInit) -> Result<ConnectionHandle> {
        self.evict_for_capacity();
        let index = self
            .pool()
            .take_free()
            .ok_or(TransportError::PoolExhausted {
                capacity: self.capacity(),
            })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle::new(index, id);
        let slot = self.slot(handle)?;
        slot.assign(id);
        let guard = slot.lock_api(id)?;
        let role = init.role;
        let transport = init.transport;
        {
            let mut rec = guard.data();
            rec.init(init, self.framer(transport));
            rec.state = match role {
                ConnectionRole::Client | ConnectionRole::MultiServer => ConnectionState::Ready,
                ConnectionRole::Server => ConnectionState::Idle,
            };
        }
        info!("allocated {handle} ({role} {transport})");
        Ok(handle)
    }

    /// Disconnect the oldest parked client once pool usage crosses the
    /// configured threshold.
    fn evict_for_capacity(&self) {
        if !self.config.parks_idle_clients() {
            return;
        }
        let threshold = usize::from(self.config.connection_capacity_percent);
        let victim = {
            let mut pool = self.pool();
            let percent = pool.usage_percent();
            if percent > threshold || percent >= 100 {
                pool.idle.pop_oldest()
            } else {
                None
            }
        };
        let Some(victim) = victim else {
            return;
        };
        debug!("pool above {threshold}%: evicting parked {victim}");
        match self.lock_api(victim) {
            Ok(guard) => self.disconnect_locked(&guard, victim, StateReason::Undefined, DisconnectCause::Capacity),
            Err(err) => debug!("parked {victim} already gone: {err}"),
        }
    }

    /// Open the socket of a client connection.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidState`] unless the connection is a
    /// [`ConnectionState::Ready`] client with a resolved remote address, or
    /// [`TransportError::Socket`] when the driver fails.
    pub fn connect(&self, conn: ConnectionHandle) -> Result<()> {
        let guard = self.lock_api(conn)?;
        let (transport, local, remote) = {
            let rec = guard.data();
            let target = rec.local.zip(rec.remote);
            match target {
                Some((local, remote))
                    if rec.role == ConnectionRole::Client
                        && rec.state == ConnectionState::Ready
                        && rec.socket.is_none() =>
                {
                    (rec.transport, local, remote)
                }
                _ => return Err(TransportError::InvalidState { state: rec.state }),
            }
        };
        let socket = self.socket.construct(transport, &local, remote)?;
        guard.data().socket = Some(socket);
        self.socket.register(socket, Interest::Connect)?;
        self.change_state(&guard, conn, ConnectionState::Connecting, StateReason::Undefined);
        Ok(())
    }

    /// Register a connection accepted by a listening socket.
    ///
    /// Server connections start connected and stay out of the primary hash;
    /// multi-server endpoints start [`ConnectionState::Ready`] and are never
    /// exposed to owners.
    ///
    /// # Errors
    ///
    /// [`TransportError::PoolExhausted`] when no record is free, or
    /// [`TransportError::InvalidState`] when `accepted.role` is a client.
    pub fn accept(&self, accepted: Accepted) -> Result<ConnectionHandle> {
        if accepted.role == ConnectionRole::Client {
            return Err(TransportError::InvalidState {
                state: ConnectionState::Idle,
            });
        }
        let handle = self.allocate(RecordInit {
            transport: accepted.transport,
            role: accepted.role,
            local: accepted.local,
            remote: accepted.remote,
            alias: None,
            socket: Some(accepted.socket),
        })?;
        let guard = self.lock_api(handle)?;
        if let Err(err) = self.socket.register(accepted.socket, Interest::Read) {
            warn!("registering accepted {handle} failed: {err}");
            self.terminate_locked(&guard, handle);
            return Err(err.into());
        }
        if accepted.role == ConnectionRole::Server {
            let state = match accepted.transport {
                TransportKind::Sctp => ConnectionState::SctpConnected,
                TransportKind::Tcp | TransportKind::Tls => ConnectionState::TcpConnected,
            };
            self.change_state(&guard, handle, state, StateReason::ServerConnected);
        }
        Ok(handle)
    }

    /// Close `conn` on request.
    ///
    /// While the usage counter is raised the close is deferred until it drops
    /// back to zero.
    ///
    /// # Errors
    ///
    /// [`TransportError::Destructed`] for a stale handle.
    pub fn disconnect(&self, conn: ConnectionHandle) -> Result<()> {
        let guard = self.lock_api(conn)?;
        self.disconnect_locked(&guard, conn, StateReason::Disconnected, DisconnectCause::Requested);
        Ok(())
    }

    /// Start a local close: cancel the timer, leave the idle list, close the
    /// socket, move to `Closing` and queue the socket-closed indication.
    pub(crate) fn disconnect_locked(
        &self,
        guard: &Guard<'_>,
        conn: ConnectionHandle,
        reason: StateReason,
        cause: DisconnectCause,
    ) {
        let (socket, timer) = {
            let mut rec = guard.data();
            if rec.state.is_closing() || rec.state == ConnectionState::Idle {
                return;
            }
            if rec.usage > 0 {
                debug!("{conn} in use ({}); close deferred", rec.usage);
                rec.deleted = true;
                return;
            }
            rec.closed_locally = true;
            (rec.socket, rec.timer.take())
        };
        if let Some(timer) = timer {
            timer::cancel(conn, &timer);
        }
        self.pool().idle.remove(conn);
        metrics::inc_disconnects(cause);
        info!("disconnecting {conn} ({cause:?})");
        if let Some(socket) = socket {
            if let Err(err) = self.socket.deregister(socket) {
                debug!("deregistering {socket} of {conn} failed: {err}");
            }
            if let Err(err) = self.socket.close(socket) {
                warn!("closing {socket} of {conn} failed: {err}");
            }
        }
        self.change_state(guard, conn, ConnectionState::Closing, reason);
        self.post_or_run(TransportEvent::SocketClosed { conn });
    }

    /// Queue `event`; when shutting down or when it cannot be queued, handle
    /// it right away on this thread.
    pub(crate) fn post_or_run(&self, event: TransportEvent) {
        let event = if self.is_shutting_down() {
            event
        } else {
            match self.dispatcher.post(event.clone()) {
                Ok(()) => return,
                Err(err) => {
                    error!("cannot queue {event:?}: {err}; handling synchronously");
                    event
                }
            }
        };
        // The handler's event-path lock nests inside the caller's guard.
        self.handle(event);
    }

    /// Move `conn` to `state`.
    ///
    /// Transitions back to an opening state after a local close are dropped.
    /// On `Closed`, every distinct owner with unsent messages is told
    /// [`ConnectionStatus::MsgNotSent`] once before the state itself is fanned
    /// out. Delivery goes through the dispatcher; if the event cannot be
    /// queued it is not delivered and the connection is closed locally.
    pub(crate) fn change_state(
        &self,
        guard: &Guard<'_>,
        conn: ConnectionHandle,
        state: ConnectionState,
        reason: StateReason,
    ) {
        let reason = {
            let mut rec = guard.data();
            if rec.suppresses(state) {
                debug!("{conn}: {state} suppressed after local close");
                return;
            }
            let reason = rec.effective_reason(reason);
            rec.state = state;
            reason
        };
        tracing::debug!(%conn, %state, %reason, "state changed");
        if state == ConnectionState::Closed {
            let unsent = {
                let mut pool = self.pool();
                pool.queues
                    .get_mut(conn.slot())
                    .map(|queue| {
                        let owners = queue.unsent_owners();
                        queue.clear();
                        owners
                    })
                    .unwrap_or_default()
            };
            for (owner, send) in unsent {
                self.queue_status(
                    guard,
                    conn,
                    ConnectionStatus::MsgNotSent,
                    StatusTarget::Owner(owner, Some(send)),
                );
            }
        }
        let event = TransportEvent::StateChanged {
            conn,
            state,
            reason,
        };
        if self.is_shutting_down() {
            self.notify_state(guard, conn, state, reason);
            return;
        }
        if let Err(err) = self.dispatcher.post(event) {
            error!("cannot queue state {state} of {conn}: {err}; disconnecting");
            self.disconnect_locked(guard, conn, StateReason::Error, DisconnectCause::QueueFailure);
        }
    }

    /// Socket closed: report `Closed`, then terminate.
    pub(crate) fn handle_socket_closed(&self, guard: &Guard<'_>, conn: ConnectionHandle) {
        let (state, timer) = {
            let mut rec = guard.data();
            (rec.state, rec.timer.take())
        };
        if let Some(timer) = timer {
            timer::cancel(conn, &timer);
        }
        if matches!(state, ConnectionState::Closed | ConnectionState::Terminated | ConnectionState::Idle) {
            return;
        }
        self.change_state(guard, conn, ConnectionState::Closed, StateReason::Undefined);
        self.terminate_locked(guard, conn);
    }

    /// Mark `conn` terminated and schedule its release.
    ///
    /// Multi-server records, and every record during shutdown, are released
    /// synchronously. Others are released once the dispatcher reaches the
    /// queued termination, so callbacks already queued for the record run
    /// first.
    pub(crate) fn terminate_locked(&self, guard: &Guard<'_>, conn: ConnectionHandle) {
        let (role, timer) = {
            let mut rec = guard.data();
            if rec.state == ConnectionState::Terminated {
                return;
            }
            rec.state = ConnectionState::Terminated;
            (rec.role, rec.timer.take())
        };
        if let Some(timer) = timer {
            timer::cancel(conn, &timer);
        }
        {
            let mut pool = self.pool();
            pool.unhash(conn);
            pool.idle.remove(conn);
            if let Some(queue) = pool.queues.get_mut(conn.slot()) {
                queue.clear();
            }
        }
        debug!("{conn} terminated");
        if role == ConnectionRole::MultiServer || self.is_shutting_down() {
            self.release_terminated(guard, conn);
            return;
        }
        if let Err(err) = self.dispatcher.post(TransportEvent::Terminated { conn }) {
            error!("cannot queue termination of {conn}: {err}; releasing now");
            self.release_terminated(guard, conn);
        }
    }

    /// Tell the owners about termination and return the record to the pool.
    pub(crate) fn release_terminated(&self, guard: &Guard<'_>, conn: ConnectionHandle) {
        self.notify_state(guard, conn, ConnectionState::Terminated, StateReason::Undefined);
        if self.slot(conn).map(|slot| slot.id()).ok() != Some(conn.id()) {
            return;
        }
        guard.retire();
        *guard.data() = ConnectionRecord::vacant(self.vacant_framer());
        self.owners.remove_connection(conn);
        self.pool().release(conn);
        info!("recycled {conn}");
    }

    /// Terminate every live connection and stop the dispatcher consumers.
    ///
    /// Owners receive `Terminated` synchronously; sockets are closed.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        for (index, slot) in self.slots.iter().enumerate() {
            let id = slot.id();
            let Ok(index) = u32::try_from(index) else {
                break;
            };
            if id == 0 {
                continue;
            }
            let conn = ConnectionHandle::new(index, id);
            let Ok(guard) = slot.lock_api(id) else {
                continue;
            };
            let socket = guard.data().socket.take();
            if let Some(socket) = socket {
                if let Err(err) = self.socket.close(socket) {
                    warn!("closing {socket} of {conn} at shutdown failed: {err}");
                }
            }
            self.terminate_locked(&guard, conn);
        }
        self.dispatcher.broadcast_shutdown();
        info!("connection registry shut down");
    }
}
