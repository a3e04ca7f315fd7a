//! Test doubles and fixtures for driving a
//! [`ConnectionRegistry`](sipwire::ConnectionRegistry) without sockets.
//!
//! The registry is built with a [`RecordingSocketDriver`] and a
//! [`CollectingSink`]; events are pumped on the test thread with
//! [`Harness::drain`], so every callback has run by the time an assertion is
//! made.
//!
//! ```rust
//! use sipwire::connection::ConnectionState;
//! use sipwire_testing::{Harness, RecordingOwner, tcp_key};
//!
//! let mut harness = Harness::new(sipwire::TransportConfig::default());
//! let owner = RecordingOwner::new();
//! let conn = harness.open_client(tcp_key(5060), 1, &owner);
//! assert_eq!(harness.registry.state(conn).unwrap(), ConnectionState::TcpConnected);
//! ```

#![cfg(not(loom))]

pub mod harness;
pub mod logging;
pub mod metrics;
pub mod owner;
pub mod sink;
pub mod socket;

pub use harness::{Harness, local, remote, tcp_key, tls_key};
pub use logging::{LoggerHandle, logger};
pub use owner::{Notification, RecordingOwner};
pub use sink::CollectingSink;
pub use socket::{RecordingSocketDriver, SocketCall};
