//! Connection classification and lifecycle enums.

use std::fmt;

use crate::codec::TransportReliability;

/// Connection-oriented transport carrying SIP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Plain TCP.
    Tcp,
    /// TCP wrapped in TLS.
    Tls,
    /// SCTP association.
    Sctp,
}

impl TransportKind {
    /// Port assumed when a sent-by host carries none.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Tls => 5061,
            Self::Tcp | Self::Sctp => 5060,
        }
    }

    /// Lower-case transport token.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Sctp => "sctp",
        }
    }

    /// Delivery classification handed to the decompressor.
    #[must_use]
    pub fn reliability(self) -> TransportReliability {
        match self {
            Self::Tcp | Self::Tls => TransportReliability::Stream,
            Self::Sctp => TransportReliability::Message,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Which side opened the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Opened locally towards a peer.
    Client,
    /// Accepted from a peer.
    Server,
    /// Listening endpoint; never visible to owners.
    MultiServer,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::MultiServer => "multi-server",
        })
    }
}

/// Connection lifecycle.
///
/// A client starts `Ready` once initialised, moves to `Connecting` when the
/// socket is opened and to `TcpConnected`/`SctpConnected` once the transport
/// is up. Accepted connections start connected. Every connection ends
/// `Closing` → `Closed` → `Terminated`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Slot not in use.
    #[default]
    Idle,
    /// Socket opened, connect in progress.
    Connecting,
    /// TCP (or TLS transport) established.
    TcpConnected,
    /// SCTP association established.
    SctpConnected,
    /// Initialised and able to carry requests.
    Ready,
    /// Local or remote close in progress.
    Closing,
    /// Socket closed.
    Closed,
    /// Final; the record is about to be recycled.
    Terminated,
}

impl ConnectionState {
    /// Whether the transport is up.
    #[must_use]
    pub fn is_connected(self) -> bool { matches!(self, Self::TcpConnected | Self::SctpConnected) }

    /// Whether the connection is on its way out.
    #[must_use]
    pub fn is_closing(self) -> bool { matches!(self, Self::Closing | Self::Closed | Self::Terminated) }

    /// States a closed connection may never return to.
    #[must_use]
    pub fn is_opening(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Ready | Self::TcpConnected | Self::SctpConnected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::TcpConnected => "TcpConnected",
            Self::SctpConnected => "SctpConnected",
            Self::Ready => "Ready",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Terminated => "Terminated",
        })
    }
}

/// TLS sub-state, tracked alongside [`ConnectionState`] for TLS connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TlsState {
    /// No handshake yet, or not a TLS connection.
    #[default]
    Undefined,
    /// Handshake under way.
    HandshakeStarted,
    /// Handshake may proceed.
    HandshakeReady,
    /// Handshake finished, post-connection checks pending.
    HandshakeCompleted,
    /// Ready for SIP traffic.
    Connected,
    /// Close-notify exchange under way.
    CloseSequenceStarted,
    /// TLS session gone.
    Terminated,
}

impl TlsState {
    /// States in which a TLS connection may be handed to a new request.
    #[must_use]
    pub fn is_reusable(self) -> bool {
        matches!(
            self,
            Self::HandshakeStarted | Self::HandshakeReady | Self::HandshakeCompleted | Self::Connected
        )
    }
}

impl fmt::Display for TlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{self:?}") }
}

/// Why a state change happened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StateReason {
    /// No particular reason.
    #[default]
    Undefined,
    /// A network or framing error.
    Error,
    /// Outgoing connect completed.
    ClientConnected,
    /// Incoming connection accepted.
    ServerConnected,
    /// Closed on request.
    Disconnected,
    /// TLS post-connection assertion rejected the peer.
    TlsPostConnectionAssertionFailed,
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{self:?}") }
}

/// Status notifications that do not change the state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// A network error was detected.
    Error,
    /// An outbound message was fully written.
    MsgSent,
    /// Outbound messages were discarded unsent.
    MsgNotSent,
    /// The SCTP primary peer address changed.
    SctpPeerAddrChanged,
    /// The SCTP peer reported an error.
    SctpRemoteError,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{self:?}") }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(TransportKind::Tcp, 5060, TransportReliability::Stream)]
    #[case(TransportKind::Tls, 5061, TransportReliability::Stream)]
    #[case(TransportKind::Sctp, 5060, TransportReliability::Message)]
    fn transport_properties(
        #[case] kind: TransportKind,
        #[case] port: u16,
        #[case] reliability: TransportReliability,
    ) {
        assert_eq!(kind.default_port(), port);
        assert_eq!(kind.reliability(), reliability);
    }

    #[test]
    fn closing_states_never_reopen() {
        for state in [
            ConnectionState::Closing,
            ConnectionState::Closed,
            ConnectionState::Terminated,
        ] {
            assert!(state.is_closing());
            assert!(!state.is_opening());
        }
    }
}
