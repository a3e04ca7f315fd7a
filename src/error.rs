//! Crate-level error type.
//!
//! [`TransportError`] is returned by every fallible registry operation.
//! Framing failures are wrapped from [`crate::codec::CodecError`] so callers
//! can distinguish a malformed stream from a stale handle.

use std::io;

use thiserror::Error;

use crate::{codec::CodecError, config::ConfigError, connection::ConnectionState};

/// Errors surfaced by the transport layer.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TransportError {
    /// The handle refers to a pooled record that has since been recycled.
    ///
    /// Callers must stop using the handle instead of retrying.
    #[error("connection destructed")]
    Destructed,

    /// The connection is in a state that does not permit the operation.
    #[error("operation not permitted in state {state}")]
    InvalidState {
        /// State observed when the operation was attempted.
        state: ConnectionState,
    },

    /// The connection carries an unreported network error.
    #[error("connection has a pending network error")]
    ConnectionError,

    /// The owner is not attached to the connection.
    #[error("owner {0} is not attached")]
    OwnerNotFound(u64),

    /// Every pooled record is in use.
    #[error("connection pool exhausted ({capacity} records)")]
    PoolExhausted {
        /// Configured pool size.
        capacity: usize,
    },

    /// The idle list cannot take another connection.
    #[error("idle list full")]
    IdleListFull,

    /// The event dispatcher could not queue an event.
    #[error("event queue full")]
    QueueFull,

    /// The event dispatcher has shut down.
    #[error("event queue closed")]
    QueueClosed,

    /// An idle timer could not be armed.
    #[error("no timer runtime available")]
    Timer,

    /// The usage counter cannot be raised on a connection marked deleted.
    #[error("connection marked deleted")]
    Deleted,

    /// The socket collaborator rejected a request.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// Inbound bytes could not be framed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The registry configuration was rejected.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type used throughout the crate.
pub type Result<T, E = TransportError> = std::result::Result<T, E>;
