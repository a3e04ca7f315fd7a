#![doc(html_root_url = "https://docs.rs/sipwire/latest")]
//! Public API for the `sipwire` library.
//!
//! This crate provides the connection layer beneath a SIP stack running over
//! connection-oriented transports (TCP, TLS, SCTP): stream framing, pooled
//! connection records with owner tracking and reuse, a triple-lock discipline
//! serialising application calls with network events, and an event
//! dispatcher that decouples socket indications from their processing.

pub mod codec;
pub mod config;
pub mod connection;
#[cfg(not(loom))]
pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod message;
pub mod metrics;
#[cfg(not(loom))]
pub mod registry;
pub mod socket;
mod sync;

pub use codec::{CodecError, EofError, FramingError, SipFrame, SipStreamCodec};
pub use config::{ServerIdleTimeout, TransportConfig};
pub use connection::{ConnectionHandle, ConnectionOwner, ConnectionState, OwnerId, live_connection_count};
#[cfg(not(loom))]
pub use dispatch::{EventDispatcher, EventQueues, TransportEvent};
pub use error::{Result, TransportError};
pub use hooks::{TransportHooks, TransportObserver};
pub use metrics::{CONNECTIONS_ACTIVE, DISCONNECTS, FRAMING_ERRORS, MESSAGES_FRAMED};
#[cfg(not(loom))]
pub use registry::ConnectionRegistry;
