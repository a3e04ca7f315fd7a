//! Metric helpers for `sipwire`.
//!
//! This module defines metric names and helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` feature the
//! helpers are no-ops.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

use crate::connection::TransportKind;

/// Name of the gauge tracking live connection records.
pub const CONNECTIONS_ACTIVE: &str = "sipwire_connections_active";
/// Name of the counter tracking complete inbound messages.
pub const MESSAGES_FRAMED: &str = "sipwire_messages_framed_total";
/// Name of the counter tracking framing failures.
pub const FRAMING_ERRORS: &str = "sipwire_framing_errors_total";
/// Name of the counter tracking local disconnects.
pub const DISCONNECTS: &str = "sipwire_disconnects_total";

/// Why a connection was closed locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The last owner detached.
    NoOwners,
    /// An idle timer expired.
    IdleTimer,
    /// Pool usage crossed the capacity threshold.
    Capacity,
    /// The inbound stream was malformed.
    Framing,
    /// The socket reported an error.
    NetworkError,
    /// The peer closed its side of the stream.
    PeerClosed,
    /// The TLS session ended.
    Tls,
    /// An event could not be queued.
    QueueFailure,
    /// The application asked for it.
    Requested,
}

impl DisconnectCause {
    fn as_str(self) -> &'static str {
        match self {
            Self::NoOwners => "no_owners",
            Self::IdleTimer => "idle_timer",
            Self::Capacity => "capacity",
            Self::Framing => "framing",
            Self::NetworkError => "network_error",
            Self::PeerClosed => "peer_closed",
            Self::Tls => "tls",
            Self::QueueFailure => "queue_failure",
            Self::Requested => "requested",
        }
    }
}

/// Increment the live connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the live connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a complete inbound message.
pub fn inc_messages(transport: TransportKind) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_FRAMED, "transport" => transport.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = transport;
}

/// Record a framing failure.
pub fn inc_framing_errors() {
    #[cfg(feature = "metrics")]
    counter!(FRAMING_ERRORS).increment(1);
}

/// Record a local disconnect.
pub fn inc_disconnects(cause: DisconnectCause) {
    #[cfg(feature = "metrics")]
    counter!(DISCONNECTS, "cause" => cause.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = cause.as_str();
}
