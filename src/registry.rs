//! Pooled connection registry.
//!
//! [`ConnectionRegistry`] owns a fixed pool of [`ConnectionRecord`]s, the
//! primary and alias hashes used to find reusable connections, the idle list
//! of parked clients and the per-connection outbound queues. Application calls
//! take a connection's lock on the API path; everything raised by the network
//! thread or a timer is posted to the [`EventDispatcher`] and processed on the
//! event path by [`EventHandler::handle`].
//!
//! ```
//! use std::{
//!     net::{Ipv4Addr, SocketAddr},
//!     sync::Arc,
//! };
//!
//! use sipwire::{
//!     config::TransportConfig,
//!     connection::{ConnectionOwner, LocalAddress, OwnerId, TransportKind},
//!     registry::{ConnectRequest, ConnectionKey, ConnectionRegistry},
//! };
//!
//! struct Transaction;
//! impl ConnectionOwner for Transaction {}
//!
//! let (registry, mut queues) = ConnectionRegistry::builder(TransportConfig::default())
//!     .build()
//!     .expect("valid configuration");
//! let local = LocalAddress::new(1, SocketAddr::from((Ipv4Addr::LOCALHOST, 5060)));
//! let key = ConnectionKey::new(
//!     TransportKind::Tcp,
//!     local,
//!     SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 5060)),
//! );
//! let first = registry
//!     .find_or_create(ConnectRequest::new(key.clone()), OwnerId::new(1), Arc::new(Transaction))
//!     .expect("allocated");
//! let second = registry
//!     .find_or_create(ConnectRequest::new(key), OwnerId::new(2), Arc::new(Transaction))
//!     .expect("reused");
//! assert!(second.reused);
//! assert_eq!(first.handle, second.handle);
//! queues.drain(&*registry);
//! ```

use std::{
    fmt,
    num::NonZeroUsize,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use tokio::runtime::Handle;

use crate::{
    codec::{Decompressor, MessageFramer, clamp_message_size},
    config::{ConfigError, TransportConfig},
    connection::{
        ApiGuard,
        ConnectionHandle,
        ConnectionRecord,
        ConnectionState,
        EventGuard,
        OwnerRegistry,
        TlsState,
        TransportKind,
        TripleLock,
    },
    dispatch::{EventDispatcher, EventQueues},
    error::{Result, TransportError},
    hooks::TransportHooks,
    message::{DiscardFrames, FrameSink},
    socket::{DetachedSockets, SocketDriver},
    sync,
};

mod attach;
mod idle;
mod inbound;
pub mod key;
mod lifecycle;
mod notify;
mod pool;
mod timer;

pub use key::{ConnectionKey, RemoteAddress, ViaSentBy};
pub use lifecycle::{Accepted, Acquired, ConnectRequest};
use pool::Pool;
use timer::IdleTimers;

/// Pooled connections and everything needed to drive their lifecycle.
pub struct ConnectionRegistry {
    config: TransportConfig,
    slots: Box<[TripleLock<ConnectionRecord>]>,
    pool: Mutex<Pool>,
    owners: OwnerRegistry,
    dispatcher: EventDispatcher,
    timers: IdleTimers,
    socket: Arc<dyn SocketDriver>,
    sink: Arc<dyn FrameSink>,
    decompressor: Option<Arc<dyn Decompressor>>,
    hooks: TransportHooks,
    next_id: AtomicU64,
    next_send: AtomicU64,
    shutting_down: AtomicBool,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("capacity", &self.slots.len())
            .field("used", &self.live_connections())
            .field("owners", &self.owners)
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Builder for [`ConnectionRegistry`].
pub struct ConnectionRegistryBuilder {
    config: TransportConfig,
    socket: Arc<dyn SocketDriver>,
    sink: Arc<dyn FrameSink>,
    decompressor: Option<Arc<dyn Decompressor>>,
    hooks: TransportHooks,
    runtime: Option<Handle>,
}

impl fmt::Debug for ConnectionRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistryBuilder")
            .field("config", &self.config)
            .field("decompressor", &self.decompressor.is_some())
            .field("hooks", &self.hooks)
            .field("runtime", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistryBuilder {
    /// Use `driver` for socket operations.
    #[must_use]
    pub fn socket_driver(mut self, driver: Arc<dyn SocketDriver>) -> Self {
        self.socket = driver;
        self
    }

    /// Deliver complete inbound messages to `sink`.
    #[must_use]
    pub fn frame_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Expand compressed messages with `decompressor`.
    #[must_use]
    pub fn decompressor(mut self, decompressor: Arc<dyn Decompressor>) -> Self {
        self.decompressor = Some(decompressor);
        self
    }

    /// Install application hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: TransportHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Run idle timers on `runtime`. Defaults to the runtime the builder is
    /// built on, if any; without one, timers cannot be armed and connections
    /// that would get one are disconnected instead.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Create the registry and the consumer side of its dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] when the configuration is invalid.
    pub fn build(self) -> Result<(Arc<ConnectionRegistry>, EventQueues)> {
        if self.config.connection_capacity_percent > 100 {
            return Err(ConfigError::InvalidCapacityPercent(
                self.config.connection_capacity_percent,
            )
            .into());
        }
        let config = self.config.normalized();
        let capacity = u32::try_from(config.max_connections.get()).unwrap_or(u32::MAX);
        let (dispatcher, queues) = EventDispatcher::new(
            config.dispatcher_capacity.get(),
            config.dispatcher_shards,
        );
        let max = clamp_message_size(config.max_message_size);
        let slots = (0..capacity)
            .map(|_| TripleLock::new(0, ConnectionRecord::vacant(MessageFramer::new(max))))
            .collect();
        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        let registry = ConnectionRegistry {
            slots,
            pool: Mutex::new(Pool::new(capacity)),
            owners: OwnerRegistry::default(),
            timers: IdleTimers::new(runtime, dispatcher.clone()),
            dispatcher,
            socket: self.socket,
            sink: self.sink,
            decompressor: self.decompressor,
            hooks: self.hooks,
            next_id: AtomicU64::new(1),
            next_send: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            config,
        };
        log::info!(
            "connection registry ready: {} records, {} dispatcher shards",
            capacity,
            registry.dispatcher.shard_count()
        );
        Ok((Arc::new(registry), queues))
    }
}

impl ConnectionRegistry {
    /// Start building a registry for `config`.
    #[must_use]
    pub fn builder(config: TransportConfig) -> ConnectionRegistryBuilder {
        ConnectionRegistryBuilder {
            config,
            socket: Arc::new(DetachedSockets::default()),
            sink: Arc::new(DiscardFrames),
            decompressor: None,
            hooks: TransportHooks::default(),
            runtime: None,
        }
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &TransportConfig { &self.config }

    /// Producer side of the dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &EventDispatcher { &self.dispatcher }

    /// Pool capacity.
    #[must_use]
    pub fn capacity(&self) -> usize { self.slots.len() }

    /// Records currently allocated.
    #[must_use]
    pub fn live_connections(&self) -> usize { self.pool().used() }

    /// Current state of `conn`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Destructed`] for a stale handle.
    pub fn state(&self, conn: ConnectionHandle) -> Result<ConnectionState> {
        self.inspect(conn, ConnectionRecord::state)
    }

    /// Current TLS state of `conn`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Destructed`] for a stale handle.
    pub fn tls_state(&self, conn: ConnectionHandle) -> Result<TlsState> {
        self.inspect(conn, ConnectionRecord::tls_state)
    }

    /// Number of regular owners of `conn`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Destructed`] for a stale handle.
    pub fn owner_count(&self, conn: ConnectionHandle) -> Result<usize> {
        self.inspect(conn, ConnectionRecord::owner_count)
    }

    /// Whether `conn` has a disconnection timer armed.
    ///
    /// # Errors
    ///
    /// [`TransportError::Destructed`] for a stale handle.
    pub fn has_timer(&self, conn: ConnectionHandle) -> Result<bool> {
        self.inspect(conn, ConnectionRecord::has_timer)
    }

    /// Run `f` against the record of `conn` under its API lock.
    ///
    /// # Errors
    ///
    /// [`TransportError::Destructed`] for a stale handle.
    pub fn inspect<R>(&self, conn: ConnectionHandle, f: impl FnOnce(&ConnectionRecord) -> R) -> Result<R> {
        let guard = self.lock_api(conn)?;
        let rec = guard.data();
        Ok(f(&rec))
    }

    /// Whether `conn` is parked on the idle list.
    #[must_use]
    pub fn is_idle_listed(&self, conn: ConnectionHandle) -> bool { self.pool().idle.contains(conn) }

    /// Whether `conn` can be found through either hash.
    #[must_use]
    pub fn is_hashed(&self, conn: ConnectionHandle) -> bool { self.pool().is_hashed(conn) }

    fn pool(&self) -> sync::MutexGuard<'_, Pool> { sync::lock(&self.pool) }

    fn slot(&self, conn: ConnectionHandle) -> Result<&TripleLock<ConnectionRecord>> {
        self.slots.get(conn.slot()).ok_or(TransportError::Destructed)
    }

    fn lock_api(&self, conn: ConnectionHandle) -> Result<ApiGuard<'_, ConnectionRecord>> {
        self.slot(conn)?.lock_api(conn.id())
    }

    fn lock_event(&self, conn: ConnectionHandle) -> Result<EventGuard<'_, ConnectionRecord>> {
        self.slot(conn)?.lock_event(conn.id())
    }

    fn framer(&self, transport: TransportKind) -> MessageFramer {
        let framer = MessageFramer::new(clamp_message_size(self.config.max_message_size));
        match &self.decompressor {
            Some(codec) => framer.with_decompressor(Arc::clone(codec), transport.reliability()),
            None => framer,
        }
    }

    fn vacant_framer(&self) -> MessageFramer {
        MessageFramer::new(clamp_message_size(self.config.max_message_size))
    }

    fn is_shutting_down(&self) -> bool { self.shutting_down.load(Ordering::Acquire) }

    /// Largest accepted inbound message.
    #[must_use]
    pub fn max_message_size(&self) -> NonZeroUsize { clamp_message_size(self.config.max_message_size) }
}
