//! Lookup keys for the primary and alias hashes.
//!
//! Both hashes are keyed by a [`HashKey`]: transport, local address id and the
//! remote end rendered as text. A socket address renders as `ip:port`
//! (`[ip]:port` for IPv6), so an address-keyed request and an alias-keyed
//! entry compare equal exactly when the alias spells the same `ip:port`.
//!
//! SCTP sockets accept both address families on one listening socket. For
//! SCTP, an IPv4-mapped IPv6 remote address is rendered in its IPv4 form
//! before comparison.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use crate::connection::{LocalAddress, TransportKind};

/// Where a connection leads.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RemoteAddress {
    /// A resolved socket address.
    Socket(SocketAddr),
    /// A `host[:port]` alias learnt from a peer's Via header.
    Alias(String),
}

impl From<SocketAddr> for RemoteAddress {
    fn from(value: SocketAddr) -> Self { Self::Socket(value) }
}

/// What a request needs from a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Transport to use.
    pub transport: TransportKind,
    /// Local address to send from.
    pub local: LocalAddress,
    /// Destination.
    pub remote: RemoteAddress,
}

impl ConnectionKey {
    /// Key for `transport` from `local` towards `remote`.
    pub fn new(transport: TransportKind, local: LocalAddress, remote: impl Into<RemoteAddress>) -> Self {
        Self {
            transport,
            local,
            remote: remote.into(),
        }
    }

    /// Resolved destination, if the key carries one.
    #[must_use]
    pub fn remote_socket(&self) -> Option<SocketAddr> {
        match self.remote {
            RemoteAddress::Socket(addr) => Some(addr),
            RemoteAddress::Alias(_) => None,
        }
    }

    pub(crate) fn hash_key(&self) -> HashKey {
        let remote = match &self.remote {
            RemoteAddress::Socket(addr) => render_socket(self.transport, *addr),
            RemoteAddress::Alias(alias) => alias.to_ascii_lowercase(),
        };
        HashKey {
            transport: self.transport,
            local: self.local.id,
            remote,
        }
    }
}

/// Normalised hash key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct HashKey {
    transport: TransportKind,
    local: u32,
    remote: String,
}

impl HashKey {
    pub(crate) fn with_alias(transport: TransportKind, local: LocalAddress, alias: &str) -> Self {
        Self {
            transport,
            local: local.id,
            remote: alias.to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}->{}", self.transport, self.local, self.remote)
    }
}

fn render_socket(transport: TransportKind, addr: SocketAddr) -> String {
    let ip = match addr.ip() {
        IpAddr::V6(v6) if transport == TransportKind::Sctp => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V6(v6), IpAddr::V4),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port()).to_string()
}

/// The `sent-by` of a received message's top Via.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViaSentBy {
    /// Host name or IP literal; IPv6 literals may keep their brackets.
    pub host: String,
    /// Explicit port.
    pub port: Option<u16>,
    /// Whether the Via carries the `alias` parameter.
    pub alias: bool,
}

impl ViaSentBy {
    /// Alias this sent-by stands for on `transport`, if the peer asked for
    /// connection reuse.
    ///
    /// An IP literal without a port gets the transport's default port; a
    /// host name without a port is used as is.
    ///
    /// ```
    /// use sipwire::{connection::TransportKind, registry::ViaSentBy};
    ///
    /// let via = ViaSentBy {
    ///     host: "192.0.2.7".into(),
    ///     port: None,
    ///     alias: true,
    /// };
    /// assert_eq!(via.alias_for(TransportKind::Tls).as_deref(), Some("192.0.2.7:5061"));
    /// ```
    #[must_use]
    pub fn alias_for(&self, transport: TransportKind) -> Option<String> {
        if !self.alias || self.host.is_empty() {
            return None;
        }
        let bare = self
            .host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host);
        let alias = match bare.parse::<IpAddr>() {
            Ok(ip) => {
                let port = self.port.unwrap_or_else(|| transport.default_port());
                render_socket(transport, SocketAddr::new(ip, port))
            }
            Err(_) => match self.port {
                Some(port) => format!("{bare}:{port}"),
                None => bare.to_string(),
            },
        };
        Some(alias.to_ascii_lowercase())
    }
}
