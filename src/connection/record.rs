//! The connection entity and the decisions taken from its fields.
//!
//! [`ConnectionRecord`] is plain data. Every mutation happens through a guard
//! from the record's [`super::TripleLock`]; the registry owns the pool of
//! records and drives their lifecycle. The pure functions here
//! ([`ConnectionRecord::no_owner_action`], [`ConnectionRecord::is_reusable`],
//! [`ConnectionRecord::accepts_owner`], [`ConnectionRecord::suppresses`]) hold
//! the policy so it can be tested without a registry.

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use super::{
    ConnectionOwner,
    ConnectionRole,
    ConnectionState,
    LocalAddress,
    OwnerId,
    OwnerList,
    SocketId,
    StateReason,
    TlsState,
    TransportKind,
    counter::ActiveConnection,
};
use crate::{
    codec::{MessageFramer, ReceiveAccumulator},
    config::{ServerIdleTimeout, TransportConfig},
    error::TransportError,
};

/// What to do with a connection whose last owner left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoOwnerAction {
    /// Leave it open.
    Keep,
    /// Close it now.
    Disconnect,
    /// Close it once the timer expires, unless an owner attaches first.
    ArmTimer(Duration),
    /// Leave it open on the idle list for reuse.
    Park,
}

/// A disconnection timer armed on a record.
#[derive(Clone, Debug)]
pub(crate) struct ArmedTimer {
    pub(crate) ticket: u64,
    pub(crate) cancel: CancellationToken,
}

/// Parameters of a freshly allocated record.
#[derive(Clone, Debug)]
pub(crate) struct RecordInit {
    pub(crate) transport: TransportKind,
    pub(crate) role: ConnectionRole,
    pub(crate) local: LocalAddress,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) alias: Option<String>,
    pub(crate) socket: Option<SocketId>,
}

/// One pooled connection.
pub struct ConnectionRecord {
    pub(crate) transport: TransportKind,
    pub(crate) role: ConnectionRole,
    pub(crate) state: ConnectionState,
    pub(crate) tls_state: TlsState,
    pub(crate) local: Option<LocalAddress>,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) alias: Option<String>,
    pub(crate) pending_alias: Option<String>,
    pub(crate) socket: Option<SocketId>,
    pub(crate) receive: ReceiveAccumulator,
    pub(crate) owners: OwnerList,
    pub(crate) security_owner: Option<(OwnerId, Arc<dyn ConnectionOwner>)>,
    pub(crate) usage: u32,
    pub(crate) deleted: bool,
    pub(crate) net_error: bool,
    pub(crate) closed_locally: bool,
    pub(crate) timer: Option<ArmedTimer>,
    pub(crate) active: Option<ActiveConnection>,
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("transport", &self.transport)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("tls_state", &self.tls_state)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("alias", &self.alias)
            .field("owners", &self.owners.len())
            .field("security_owner", &self.security_owner.as_ref().map(|(id, _)| *id))
            .field("usage", &self.usage)
            .field("deleted", &self.deleted)
            .field("net_error", &self.net_error)
            .field("timer", &self.timer.as_ref().map(|t| t.ticket))
            .finish_non_exhaustive()
    }
}

impl ConnectionRecord {
    /// An unused record with an empty receive buffer.
    #[must_use]
    pub fn vacant(framer: MessageFramer) -> Self {
        Self {
            transport: TransportKind::Tcp,
            role: ConnectionRole::Client,
            state: ConnectionState::Idle,
            tls_state: TlsState::Undefined,
            local: None,
            remote: None,
            alias: None,
            pending_alias: None,
            socket: None,
            receive: ReceiveAccumulator::from_framer(framer),
            owners: OwnerList::default(),
            security_owner: None,
            usage: 0,
            deleted: false,
            net_error: false,
            closed_locally: false,
            timer: None,
            active: None,
        }
    }

    pub(crate) fn init(&mut self, init: RecordInit, framer: MessageFramer) {
        *self = Self::vacant(framer);
        self.transport = init.transport;
        self.role = init.role;
        self.local = Some(init.local);
        self.remote = init.remote;
        self.alias = init.alias;
        self.socket = init.socket;
        self.active = Some(ActiveConnection::new());
    }

    /// Transport carrying the connection.
    #[must_use]
    pub fn transport(&self) -> TransportKind { self.transport }

    /// Client, server or listening endpoint.
    #[must_use]
    pub fn role(&self) -> ConnectionRole { self.role }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState { self.state }

    /// TLS sub-state.
    #[must_use]
    pub fn tls_state(&self) -> TlsState { self.tls_state }

    /// Remote socket address, when known.
    #[must_use]
    pub fn remote(&self) -> Option<SocketAddr> { self.remote }

    /// Local address.
    #[must_use]
    pub fn local(&self) -> Option<LocalAddress> { self.local }

    /// Alias the connection is reachable under.
    #[must_use]
    pub fn alias(&self) -> Option<&str> { self.alias.as_deref() }

    /// Number of regular owners.
    #[must_use]
    pub fn owner_count(&self) -> usize { self.owners.len() }

    /// Whether nobody, regular or security owner, holds the connection.
    #[must_use]
    pub fn is_unowned(&self) -> bool { self.owners.is_empty() && self.security_owner.is_none() }

    /// Whether a disconnection timer is armed.
    #[must_use]
    pub fn has_timer(&self) -> bool { self.timer.is_some() }

    /// Decide the fate of an owner-less connection.
    ///
    /// | Role | Condition | Action |
    /// |------|-----------|--------|
    /// | server | `force` | disconnect |
    /// | server | timeout `After(d)`, transport connected | timer `d` |
    /// | server | timeout `Immediate` | disconnect |
    /// | server | otherwise | keep |
    /// | client TCP/SCTP | capacity budget | park |
    /// | client TCP/SCTP | no budget | disconnect |
    /// | client TLS, TLS connected | capacity budget | park |
    /// | client TLS, TLS connected | no budget | TLS grace timer |
    /// | client TLS | not TLS connected | disconnect |
    /// | multi-server | any | keep |
    ///
    /// Owned connections are always kept.
    #[must_use]
    pub fn no_owner_action(&self, config: &TransportConfig, force: bool) -> NoOwnerAction {
        if !self.is_unowned() {
            return NoOwnerAction::Keep;
        }
        match self.role {
            ConnectionRole::MultiServer => NoOwnerAction::Keep,
            ConnectionRole::Server => {
                if force {
                    return NoOwnerAction::Disconnect;
                }
                match config.server_idle_timeout {
                    ServerIdleTimeout::After(timeout) if self.state.is_connected() => {
                        NoOwnerAction::ArmTimer(timeout)
                    }
                    ServerIdleTimeout::Immediate => NoOwnerAction::Disconnect,
                    ServerIdleTimeout::After(_) | ServerIdleTimeout::Never => NoOwnerAction::Keep,
                }
            }
            ConnectionRole::Client => match self.transport {
                TransportKind::Tcp | TransportKind::Sctp => {
                    if config.parks_idle_clients() {
                        NoOwnerAction::Park
                    } else {
                        NoOwnerAction::Disconnect
                    }
                }
                TransportKind::Tls if self.tls_state == TlsState::Connected => {
                    if config.parks_idle_clients() {
                        NoOwnerAction::Park
                    } else {
                        NoOwnerAction::ArmTimer(config.tls_client_idle_timeout)
                    }
                }
                TransportKind::Tls => NoOwnerAction::Disconnect,
            },
        }
    }

    /// Whether this record, looked up under incarnation `expected`, may carry
    /// a new request.
    #[must_use]
    pub fn is_reusable(&self, current_id: u64, expected: u64) -> bool {
        if current_id != expected || self.net_error || self.timer.is_some() || self.deleted {
            return false;
        }
        if !matches!(
            self.state,
            ConnectionState::Connecting
                | ConnectionState::TcpConnected
                | ConnectionState::SctpConnected
                | ConnectionState::Ready
        ) {
            return false;
        }
        self.transport != TransportKind::Tls || self.tls_state.is_reusable()
    }

    /// Whether a new owner may attach.
    ///
    /// # Errors
    ///
    /// [`TransportError::ConnectionError`] while a network error is pending,
    /// [`TransportError::InvalidState`] once the connection is closing.
    pub fn accepts_owner(&self) -> Result<(), TransportError> {
        if self.net_error {
            return Err(TransportError::ConnectionError);
        }
        if self.state.is_closing() {
            return Err(TransportError::InvalidState { state: self.state });
        }
        Ok(())
    }

    /// Whether a requested transition to `next` must be ignored.
    ///
    /// A locally closed connection is never brought back to an opening state.
    #[must_use]
    pub fn suppresses(&self, next: ConnectionState) -> bool {
        self.closed_locally && next.is_opening()
    }

    /// Reason to report for a transition, folding in a pending network error.
    ///
    /// An undefined reason on a connection with a pending network error is
    /// reported as [`StateReason::Error`] and the error is cleared.
    pub fn effective_reason(&mut self, reason: StateReason) -> StateReason {
        if reason == StateReason::Undefined && self.net_error {
            self.net_error = false;
            StateReason::Error
        } else {
            reason
        }
    }
}

#[cfg(test)]
mod tests;
