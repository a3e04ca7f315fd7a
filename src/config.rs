//! Transport configuration.
//!
//! [`TransportConfig`] carries the pool size, idle policies and framing limits
//! used by [`crate::registry::ConnectionRegistry`]. Construct it through
//! [`TransportConfig::builder`] or start from [`Default::default`] and adjust
//! the public fields directly.

use std::{num::NonZeroUsize, time::Duration};

use thiserror::Error;

/// Smallest accepted inbound message limit.
pub const MIN_MESSAGE_SIZE: usize = 256;
/// Largest accepted inbound message limit (16 MiB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const DEFAULT_MAX_CONNECTIONS: usize = 64;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
const DEFAULT_DISPATCHER_CAPACITY: usize = 1024;
const DEFAULT_TLS_CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(32);

/// What happens to a server connection once its last owner leaves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerIdleTimeout {
    /// Disconnect at once.
    #[default]
    Immediate,
    /// Keep the connection open for the given period, then disconnect.
    After(Duration),
    /// Never disconnect because of missing owners.
    Never,
}

impl ServerIdleTimeout {
    /// Map the classic millisecond setting (`> 0`, `0`, `< 0`) onto the enum.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use sipwire::config::ServerIdleTimeout;
    ///
    /// assert_eq!(ServerIdleTimeout::from_millis(-1), ServerIdleTimeout::Never);
    /// assert_eq!(ServerIdleTimeout::from_millis(0), ServerIdleTimeout::Immediate);
    /// assert_eq!(
    ///     ServerIdleTimeout::from_millis(2000),
    ///     ServerIdleTimeout::After(Duration::from_secs(2))
    /// );
    /// ```
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        match u64::try_from(millis) {
            Ok(0) => Self::Immediate,
            Ok(ms) => Self::After(Duration::from_millis(ms)),
            Err(_) => Self::Never,
        }
    }
}

/// Errors reported by [`TransportConfigBuilder::build`].
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `connection_capacity_percent` must lie in `0..=100`.
    #[error("invalid connection capacity percent {0}; must be between 0 and 100")]
    InvalidCapacityPercent(u8),
    /// At least one dispatcher shard is required.
    #[error("dispatcher needs at least one worker shard")]
    NoDispatcherShards,
}

/// Runtime settings for the transport layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Number of pooled connection records.
    pub max_connections: NonZeroUsize,
    /// Policy for server connections without owners.
    pub server_idle_timeout: ServerIdleTimeout,
    /// Pool usage threshold above which parked client connections are evicted.
    ///
    /// Zero disables parking entirely: owner-less clients disconnect.
    pub connection_capacity_percent: u8,
    /// Grace period before an owner-less connected TLS client is closed.
    pub tls_client_idle_timeout: Duration,
    /// Largest inbound message, header and body together.
    pub max_message_size: NonZeroUsize,
    /// Capacity of each dispatcher shard.
    pub dispatcher_capacity: NonZeroUsize,
    /// Number of dispatcher shards, one worker thread each.
    pub dispatcher_shards: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections: NonZeroUsize::new(DEFAULT_MAX_CONNECTIONS)
                .unwrap_or(NonZeroUsize::MIN),
            server_idle_timeout: ServerIdleTimeout::default(),
            connection_capacity_percent: 0,
            tls_client_idle_timeout: DEFAULT_TLS_CLIENT_IDLE_TIMEOUT,
            max_message_size: NonZeroUsize::new(DEFAULT_MAX_MESSAGE_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
            dispatcher_capacity: NonZeroUsize::new(DEFAULT_DISPATCHER_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            dispatcher_shards: 1,
        }
    }
}

impl TransportConfig {
    /// Start a builder seeded with the defaults.
    #[must_use]
    pub fn builder() -> TransportConfigBuilder { TransportConfigBuilder::default() }

    /// Clamp values into their supported ranges.
    ///
    /// ```
    /// use std::num::NonZeroUsize;
    ///
    /// use sipwire::config::{MIN_MESSAGE_SIZE, TransportConfig};
    ///
    /// let cfg = TransportConfig {
    ///     connection_capacity_percent: 250,
    ///     max_message_size: NonZeroUsize::new(10).expect("non-zero"),
    ///     dispatcher_shards: 0,
    ///     ..TransportConfig::default()
    /// }
    /// .normalized();
    ///
    /// assert_eq!(cfg.connection_capacity_percent, 100);
    /// assert_eq!(cfg.max_message_size.get(), MIN_MESSAGE_SIZE);
    /// assert_eq!(cfg.dispatcher_shards, 1);
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.connection_capacity_percent = self.connection_capacity_percent.min(100);
        let size = self
            .max_message_size
            .get()
            .clamp(MIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE);
        self.max_message_size = NonZeroUsize::new(size).unwrap_or(self.max_message_size);
        self.dispatcher_shards = self.dispatcher_shards.max(1);
        self
    }

    /// Whether owner-less client connections are parked rather than closed.
    #[must_use]
    pub fn parks_idle_clients(&self) -> bool { self.connection_capacity_percent > 0 }
}

/// Builder for [`TransportConfig`].
///
/// ```
/// use std::{num::NonZeroUsize, time::Duration};
///
/// use sipwire::config::{ServerIdleTimeout, TransportConfig};
///
/// let cfg = TransportConfig::builder()
///     .max_connections(NonZeroUsize::new(8).expect("non-zero"))
///     .server_idle_timeout(ServerIdleTimeout::After(Duration::from_secs(2)))
///     .connection_capacity_percent(80)
///     .build()
///     .expect("valid configuration");
/// assert_eq!(cfg.max_connections.get(), 8);
/// ```
#[derive(Debug, Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Set the connection pool size.
    #[must_use]
    pub fn max_connections(mut self, value: NonZeroUsize) -> Self {
        self.config.max_connections = value;
        self
    }

    /// Set the owner-less server connection policy.
    #[must_use]
    pub fn server_idle_timeout(mut self, value: ServerIdleTimeout) -> Self {
        self.config.server_idle_timeout = value;
        self
    }

    /// Enable idle-list parking with the given eviction threshold.
    #[must_use]
    pub fn connection_capacity_percent(mut self, value: u8) -> Self {
        self.config.connection_capacity_percent = value;
        self
    }

    /// Set the grace timer for owner-less TLS clients.
    #[must_use]
    pub fn tls_client_idle_timeout(mut self, value: Duration) -> Self {
        self.config.tls_client_idle_timeout = value;
        self
    }

    /// Set the inbound message size limit.
    #[must_use]
    pub fn max_message_size(mut self, value: NonZeroUsize) -> Self {
        self.config.max_message_size = value;
        self
    }

    /// Set the per-shard dispatcher queue capacity.
    #[must_use]
    pub fn dispatcher_capacity(mut self, value: NonZeroUsize) -> Self {
        self.config.dispatcher_capacity = value;
        self
    }

    /// Set the number of dispatcher shards.
    #[must_use]
    pub fn dispatcher_shards(mut self, value: usize) -> Self {
        self.config.dispatcher_shards = value;
        self
    }

    /// Validate and return the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidCapacityPercent`] when the percentage
    /// exceeds 100 and [`ConfigError::NoDispatcherShards`] when zero shards
    /// were requested.
    pub fn build(self) -> Result<TransportConfig, ConfigError> {
        let cfg = self.config;
        if cfg.connection_capacity_percent > 100 {
            return Err(ConfigError::InvalidCapacityPercent(
                cfg.connection_capacity_percent,
            ));
        }
        if cfg.dispatcher_shards == 0 {
            return Err(ConfigError::NoDispatcherShards);
        }
        Ok(cfg.normalized())
    }
}
