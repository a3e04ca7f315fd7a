//! A registry wired to recording doubles, pumped on the test thread.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use sipwire::{
    TransportConfig,
    connection::{
        ConnectionHandle,
        ConnectionRole,
        LocalAddress,
        OwnerId,
        SocketId,
        TransportKind,
    },
    dispatch::EventQueues,
    registry::{Accepted, ConnectRequest, ConnectionKey, ConnectionRegistry, ConnectionRegistryBuilder},
};

use crate::{CollectingSink, RecordingOwner, RecordingSocketDriver};

/// The local address every harness connection uses.
#[must_use]
pub fn local() -> LocalAddress { LocalAddress::new(1, SocketAddr::from((Ipv4Addr::LOCALHOST, 5060))) }

/// A documentation-range peer on `port`.
#[must_use]
pub fn remote(port: u16) -> SocketAddr { SocketAddr::from((Ipv4Addr::new(192, 0, 2, 10), port)) }

/// TCP key towards [`remote`]`(port)`.
#[must_use]
pub fn tcp_key(port: u16) -> ConnectionKey { ConnectionKey::new(TransportKind::Tcp, local(), remote(port)) }

/// TLS key towards [`remote`]`(port)`.
#[must_use]
pub fn tls_key(port: u16) -> ConnectionKey { ConnectionKey::new(TransportKind::Tls, local(), remote(port)) }

/// Registry plus the doubles it was built with.
pub struct Harness {
    /// The registry under test.
    pub registry: Arc<ConnectionRegistry>,
    /// Consumer side of its dispatcher.
    pub queues: EventQueues,
    /// Socket requests made by the registry.
    pub sockets: Arc<RecordingSocketDriver>,
    /// Frames delivered by the registry.
    pub sink: Arc<CollectingSink>,
}

impl Harness {
    /// Build a registry for `config`.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is rejected.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self { Self::with_builder(config, |builder| builder) }

    /// Build a registry for `config`, letting `customise` adjust the builder
    /// after the doubles are installed.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is rejected.
    #[must_use]
    pub fn with_builder(
        config: TransportConfig,
        customise: impl FnOnce(ConnectionRegistryBuilder) -> ConnectionRegistryBuilder,
    ) -> Self {
        let sockets = Arc::new(RecordingSocketDriver::default());
        let sink = Arc::new(CollectingSink::default());
        let builder = ConnectionRegistry::builder(config)
            .socket_driver(sockets.clone())
            .frame_sink(sink.clone());
        let (registry, queues) = customise(builder).build().expect("valid configuration");
        Self {
            registry,
            queues,
            sockets,
            sink,
        }
    }

    /// Handle every queued event.
    pub fn drain(&mut self) -> usize { self.queues.drain(&*self.registry) }

    /// Acquire a client connection for `key` on behalf of `owner`, open it and
    /// complete the connect.
    ///
    /// # Panics
    ///
    /// Panics if any step fails.
    pub fn open_client(&mut self, key: ConnectionKey, owner: u64, callbacks: &Arc<RecordingOwner>) -> ConnectionHandle {
        let acquired = self
            .registry
            .find_or_create(ConnectRequest::new(key), OwnerId::new(owner), callbacks.clone())
            .expect("connection acquired");
        if !acquired.reused {
            self.registry.connect(acquired.handle).expect("connect started");
            self.registry.on_connected(acquired.handle);
        }
        self.drain();
        acquired.handle
    }

    /// Register a server connection accepted from [`remote`]`(port)`.
    ///
    /// # Panics
    ///
    /// Panics if the pool is exhausted.
    pub fn accept_server(&mut self, transport: TransportKind, port: u16) -> ConnectionHandle {
        let conn = self
            .registry
            .accept(Accepted {
                transport,
                role: ConnectionRole::Server,
                local: local(),
                remote: Some(remote(port)),
                socket: SocketId(u64::from(port) + 10_000),
            })
            .expect("connection accepted");
        self.drain();
        conn
    }
}
