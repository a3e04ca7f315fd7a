//! Fan-out of state changes and statuses to owners.
//!
//! Callbacks run with the connection lock released. An owner may detach, or
//! another attach, while one is being notified; the owner list's rounds make
//! sure each owner present at some point during the fan-out hears the event
//! once. A record recycled by a callback ends the fan-out.

use log::{debug, error};

use super::ConnectionRegistry;
use crate::{
    connection::{
        ConnectionHandle,
        ConnectionRecord,
        ConnectionState,
        ConnectionStatus,
        Locked,
        SendId,
        StateReason,
    },
    dispatch::{StatusTarget, TransportEvent},
    error::Result,
    metrics::DisconnectCause,
};

type Guard<'a> = Locked<'a, ConnectionRecord>;

impl ConnectionRegistry {
    /// Tell the security owner, then every owner in list order, that `conn`
    /// moved to `state`; finally run the `on_state_changed` hook.
    pub(crate) fn notify_state(
        &self,
        guard: &Guard<'_>,
        conn: ConnectionHandle,
        state: ConnectionState,
        reason: StateReason,
    ) {
        if self.fan_out_state(guard, conn, state, reason).is_err() {
            debug!("{conn} recycled while notifying {state}");
            return;
        }
        if guard
            .released(|| self.hooks.on_state_changed(conn, state, reason))
            .is_err()
        {
            debug!("{conn} recycled by the state hook");
        }
    }

    fn fan_out_state(
        &self,
        guard: &Guard<'_>,
        conn: ConnectionHandle,
        state: ConnectionState,
        reason: StateReason,
    ) -> Result<()> {
        let security = guard
            .data()
            .security_owner
            .as_ref()
            .map(|(_, callbacks)| std::sync::Arc::clone(callbacks));
        if let Some(callbacks) = security {
            guard.released(|| callbacks.on_state_changed(conn, state, reason))?;
        }
        let round = guard.data().owners.begin_round();
        loop {
            let next = guard.data().owners.next_unnotified(round);
            let Some(owner) = next else {
                return Ok(());
            };
            let Some(callbacks) = self.owners.callbacks(conn, owner) else {
                continue;
            };
            guard.released(|| callbacks.on_state_changed(conn, state, reason))?;
        }
    }

    /// Queue `status` for delivery to `target`. Reporting
    /// [`ConnectionStatus::Error`] marks the connection as carrying a network
    /// error until the next state change reports it.
    ///
    /// A status that cannot be queued is not delivered; the connection is
    /// closed locally instead.
    pub(crate) fn queue_status(
        &self,
        guard: &Guard<'_>,
        conn: ConnectionHandle,
        status: ConnectionStatus,
        target: StatusTarget,
    ) {
        if status == ConnectionStatus::Error {
            guard.data().net_error = true;
        }
        if self.is_shutting_down() {
            self.notify_status(guard, conn, status, target);
            return;
        }
        if let Err(err) = self.dispatcher.post(TransportEvent::Status {
            conn,
            status,
            target,
        }) {
            error!("cannot queue {status} for {conn}: {err}; disconnecting");
            self.disconnect_locked(guard, conn, StateReason::Error, DisconnectCause::QueueFailure);
        }
    }

    /// Deliver `status` to `target` now.
    pub(crate) fn notify_status(
        &self,
        guard: &Guard<'_>,
        conn: ConnectionHandle,
        status: ConnectionStatus,
        target: StatusTarget,
    ) {
        let delivered = match target {
            StatusTarget::Owner(owner, send) => self.owners.callbacks(conn, owner).map_or(Ok(()), |callbacks| {
                guard.released(|| callbacks.on_status(conn, status, send))
            }),
            StatusTarget::All => self.fan_out_status(guard, conn, status, None),
        };
        if delivered.is_err() {
            debug!("{conn} recycled while notifying {status}");
        }
    }

    fn fan_out_status(
        &self,
        guard: &Guard<'_>,
        conn: ConnectionHandle,
        status: ConnectionStatus,
        send: Option<SendId>,
    ) -> Result<()> {
        let round = guard.data().owners.begin_round();
        loop {
            let next = guard.data().owners.next_unnotified(round);
            let Some(owner) = next else {
                return Ok(());
            };
            if let Some(callbacks) = self.owners.callbacks(conn, owner) {
                guard.released(|| callbacks.on_status(conn, status, send))?;
            }
        }
    }
}
