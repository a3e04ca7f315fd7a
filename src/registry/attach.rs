//! Owners, usage counting and the outbound queue.

use std::sync::{Arc, atomic::Ordering};

use bytes::Bytes;
use log::{debug, warn};

use super::{ConnectionRegistry, ViaSentBy, key::HashKey, timer};
use crate::{
    connection::{
        ConnectionHandle,
        ConnectionOwner,
        ConnectionRecord,
        ConnectionRole,
        ConnectionState,
        Locked,
        NoOwnerAction,
        OwnerId,
        PendingSend,
        SendId,
        StateReason,
        record::ArmedTimer,
    },
    error::{Result, TransportError},
    metrics::DisconnectCause,
};

type Guard<'a> = Locked<'a, ConnectionRecord>;

impl ConnectionRegistry {
    /// Attach `owner` to `conn`.
    ///
    /// Cancels a pending disconnection timer and takes the connection off the
    /// idle list. Attaching an owner twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`TransportError::ConnectionError`] while a network error is pending,
    /// [`TransportError::InvalidState`] once the connection is closing or for
    /// a multi-server endpoint.
    pub fn attach_owner(
        &self,
        conn: ConnectionHandle,
        owner: OwnerId,
        callbacks: Arc<dyn ConnectionOwner>,
    ) -> Result<()> {
        let guard = self.lock_api(conn)?;
        self.attach_locked(&guard, conn, owner, callbacks)
    }

    pub(crate) fn attach_locked(
        &self,
        guard: &Guard<'_>,
        conn: ConnectionHandle,
        owner: OwnerId,
        callbacks: Arc<dyn ConnectionOwner>,
    ) -> Result<()> {
        let (timer, owners) = {
            let mut rec = guard.data();
            rec.accepts_owner()?;
            if rec.role == ConnectionRole::MultiServer {
                return Err(TransportError::InvalidState { state: rec.state });
            }
            if self.owners.contains(conn, owner) {
                return Ok(());
            }
            let seq = rec.owners.insert(owner);
            self.owners.insert(conn, owner, seq, callbacks);
            (rec.timer.take(), rec.owners.len())
        };
        self.keep_alive(conn, timer.as_ref());
        tracing::debug!(%conn, %owner, owners, "owner attached");
        Ok(())
    }

    fn keep_alive(&self, conn: ConnectionHandle, timer: Option<&ArmedTimer>) {
        if let Some(timer) = timer {
            timer::cancel(conn, timer);
        }
        if self.pool().idle.remove(conn) {
            debug!("{conn} left the idle list");
        }
    }

    /// Detach `owner` from `conn` and apply the no-owner policy.
    ///
    /// Unstarted sends of the owner are dropped; partially written ones (and
    /// those queued with `dont_remove`) complete without an owner. With
    /// `force`, an owner-less server connection is closed at once regardless
    /// of its idle timeout.
    ///
    /// # Errors
    ///
    /// [`TransportError::OwnerNotFound`] when `owner` is not attached.
    pub fn detach_owner(&self, conn: ConnectionHandle, owner: OwnerId, force: bool) -> Result<()> {
        let guard = self.lock_api(conn)?;
        let seq = self
            .owners
            .remove(conn, owner)
            .ok_or(TransportError::OwnerNotFound(owner.as_u64()))?;
        let remaining = {
            let mut rec = guard.data();
            rec.owners.remove(seq);
            rec.owners.len()
        };
        let dropped = self
            .pool()
            .queues
            .get_mut(conn.slot())
            .map_or(0, |queue| queue.detach(owner));
        tracing::debug!(%conn, %owner, remaining, dropped, "owner detached");
        self.apply_no_owner_policy(&guard, conn, force);
        Ok(())
    }

    /// Decide what happens to `conn` now that an owner left.
    pub(crate) fn apply_no_owner_policy(&self, guard: &Guard<'_>, conn: ConnectionHandle, force: bool) {
        let (action, role, transport) = {
            let rec = guard.data();
            if rec.state.is_closing() || rec.state == ConnectionState::Idle {
                return;
            }
            (rec.no_owner_action(&self.config, force), rec.role, rec.transport)
        };
        if action != NoOwnerAction::Keep {
            tracing::debug!(
                %conn,
                %role,
                %transport,
                timeout = ?self.config.server_idle_timeout,
                ?action,
                "no owners left"
            );
        }
        match action {
            NoOwnerAction::Keep => {}
            NoOwnerAction::Disconnect => {
                self.disconnect_locked(guard, conn, StateReason::Undefined, DisconnectCause::NoOwners);
            }
            NoOwnerAction::ArmTimer(after) => match self.timers.arm(conn, after) {
                Ok(armed) => {
                    let previous = guard.data().timer.replace(armed);
                    if let Some(previous) = previous {
                        timer::cancel(conn, &previous);
                    }
                }
                Err(err) => {
                    warn!("cannot arm idle timer for {conn}: {err}; disconnecting");
                    self.disconnect_locked(guard, conn, StateReason::Undefined, DisconnectCause::NoOwners);
                }
            },
            NoOwnerAction::Park => {
                let parked = self.pool().idle.push(conn);
                if let Err(err) = parked {
                    warn!("cannot park {conn}: {err}; disconnecting");
                    self.disconnect_locked(guard, conn, StateReason::Undefined, DisconnectCause::NoOwners);
                }
            }
        }
    }

    /// Install `owner` as the security owner of `conn`, replacing any
    /// previous one. It keeps the connection alive like a regular owner and is
    /// notified before them.
    ///
    /// # Errors
    ///
    /// As for [`attach_owner`](Self::attach_owner).
    pub fn set_security_owner(
        &self,
        conn: ConnectionHandle,
        owner: OwnerId,
        callbacks: Arc<dyn ConnectionOwner>,
    ) -> Result<()> {
        let guard = self.lock_api(conn)?;
        let timer = {
            let mut rec = guard.data();
            rec.accepts_owner()?;
            rec.security_owner = Some((owner, callbacks));
            rec.timer.take()
        };
        self.keep_alive(conn, timer.as_ref());
        debug!("{owner} is the security owner of {conn}");
        Ok(())
    }

    /// Remove the security owner of `conn` and apply the no-owner policy.
    ///
    /// # Errors
    ///
    /// [`TransportError::Destructed`] for a stale handle.
    pub fn clear_security_owner(&self, conn: ConnectionHandle) -> Result<()> {
        let guard = self.lock_api(conn)?;
        let previous = guard.data().security_owner.take();
        if previous.is_some() {
            self.apply_no_owner_policy(&guard, conn, false);
        }
        Ok(())
    }

    /// Raise the usage counter of `conn`, deferring local closes.
    ///
    /// # Errors
    ///
    /// [`TransportError::Deleted`] once a close has been deferred.
    pub fn inc_usage(&self, conn: ConnectionHandle) -> Result<u32> {
        let guard = self.lock_api(conn)?;
        let mut rec = guard.data();
        if rec.deleted {
            return Err(TransportError::Deleted);
        }
        rec.usage += 1;
        Ok(rec.usage)
    }

    /// Lower the usage counter of `conn`; a deferred close runs when it
    /// reaches zero.
    ///
    /// # Errors
    ///
    /// [`TransportError::Destructed`] for a stale handle.
    pub fn dec_usage(&self, conn: ConnectionHandle) -> Result<u32> {
        let guard = self.lock_api(conn)?;
        let (usage, close) = {
            let mut rec = guard.data();
            rec.usage = rec.usage.saturating_sub(1);
            let close = rec.usage == 0 && rec.deleted;
            if close {
                rec.deleted = false;
            }
            (rec.usage, close.then_some(rec.net_error))
        };
        // A pending network error outranks the requested close.
        match close {
            Some(true) => {
                self.disconnect_locked(&guard, conn, StateReason::Undefined, DisconnectCause::NetworkError);
            }
            Some(false) => {
                self.disconnect_locked(&guard, conn, StateReason::Disconnected, DisconnectCause::Requested);
            }
            None => {}
        }
        Ok(usage)
    }

    /// Queue `buffer` for sending on `conn` on behalf of `owner`.
    ///
    /// With `dont_remove`, the message is still sent if the owner detaches
    /// before it started.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidState`] once the connection is closing.
    pub fn enqueue_send(
        &self,
        conn: ConnectionHandle,
        owner: OwnerId,
        buffer: Bytes,
        dont_remove: bool,
    ) -> Result<SendId> {
        let guard = self.lock_api(conn)?;
        let state = guard.data().state;
        if state.is_closing() {
            return Err(TransportError::InvalidState { state });
        }
        let id = SendId::new(self.next_send.fetch_add(1, Ordering::Relaxed));
        let mut pool = self.pool();
        let queue = pool
            .queues
            .get_mut(conn.slot())
            .ok_or(TransportError::Destructed)?;
        queue.push(PendingSend {
            id,
            owner: Some(owner),
            buffer,
            sent: 0,
            dont_remove,
        });
        Ok(id)
    }

    /// Unwritten bytes of the message at the head of the outbound queue.
    ///
    /// # Errors
    ///
    /// [`TransportError::Destructed`] for a stale handle.
    pub fn next_send(&self, conn: ConnectionHandle) -> Result<Option<Bytes>> {
        let _guard = self.lock_api(conn)?;
        let pool = self.pool();
        Ok(pool
            .queues
            .get(conn.slot())
            .and_then(|queue| queue.head())
            .map(|send| send.buffer.slice(send.sent..)))
    }

    /// Number of messages queued on `conn`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Destructed`] for a stale handle.
    pub fn queued_sends(&self, conn: ConnectionHandle) -> Result<usize> {
        let _guard = self.lock_api(conn)?;
        Ok(self
            .pool()
            .queues
            .get(conn.slot())
            .map_or(0, crate::connection::SendQueue::len))
    }

    /// Handle the `alias` parameter of the top Via of a request received on
    /// server connection `conn`.
    ///
    /// The alias is remembered and offered to the `on_server_reuse` hook;
    /// it takes part in reuse only once the application calls
    /// [`authorize_alias`](Self::authorize_alias). Returns whether the hook
    /// was offered an alias.
    ///
    /// # Errors
    ///
    /// [`TransportError::Destructed`] for a stale handle or a connection
    /// recycled while the hook ran.
    pub fn apply_server_reuse(&self, conn: ConnectionHandle, via: &ViaSentBy) -> Result<bool> {
        let guard = self.lock_api(conn)?;
        let alias = {
            let mut rec = guard.data();
            if rec.role != ConnectionRole::Server || rec.state.is_closing() {
                return Ok(false);
            }
            let Some(alias) = via.alias_for(rec.transport) else {
                return Ok(false);
            };
            rec.pending_alias = Some(alias.clone());
            alias
        };
        if self.pool().is_alias_hashed(conn) {
            debug!("{conn} already reusable as {alias}");
            return Ok(false);
        }
        guard.released(|| self.hooks.on_server_reuse(conn, &alias))?;
        Ok(true)
    }

    /// Make server connection `conn` reusable for requests towards the alias
    /// its peer offered.
    ///
    /// # Errors
    ///
    /// [`TransportError::InvalidState`] when no alias is pending or the
    /// connection is closing.
    pub fn authorize_alias(&self, conn: ConnectionHandle) -> Result<()> {
        let guard = self.lock_api(conn)?;
        let (key, alias) = {
            let mut rec = guard.data();
            let target = rec.local.zip(rec.pending_alias.take());
            let Some((local, alias)) = target.filter(|_| !rec.state.is_closing()) else {
                return Err(TransportError::InvalidState { state: rec.state });
            };
            rec.alias = Some(alias.clone());
            (HashKey::with_alias(rec.transport, local, &alias), alias)
        };
        self.pool().insert_alias(key, conn);
        tracing::info!(%conn, %alias, "server connection reusable through alias");
        Ok(())
    }
}
