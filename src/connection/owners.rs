//! Connection owners and their callbacks.
//!
//! Each record keeps an [`OwnerList`] that fixes notification order and
//! remembers which owners have already seen the event being fanned out. The
//! callbacks themselves live in the registry-wide [`OwnerRegistry`], keyed by
//! `(connection, owner)`, so attach and detach never scan a list.

use std::{collections::BTreeMap, fmt, sync::Arc};

use dashmap::DashMap;

use super::{ConnectionHandle, ConnectionState, ConnectionStatus, SendId, StateReason};

/// Opaque identifier of a connection owner, such as a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl From<u64> for OwnerId {
    fn from(value: u64) -> Self { Self(value) }
}

impl OwnerId {
    /// Create an owner id.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "OwnerId({})", self.0) }
}

/// Callbacks an owner receives about a connection.
///
/// Callbacks run on a dispatcher worker with no connection lock held, so they
/// may call straight back into the registry.
pub trait ConnectionOwner: Send + Sync + 'static {
    /// The connection changed state.
    fn on_state_changed(
        &self,
        _conn: ConnectionHandle,
        _state: ConnectionState,
        _reason: StateReason,
    ) {
    }

    /// A status worth knowing about, optionally about one queued send.
    fn on_status(&self, _conn: ConnectionHandle, _status: ConnectionStatus, _send: Option<SendId>) {}
}

#[derive(Clone, Copy, Debug)]
struct OwnerLink {
    owner: OwnerId,
    notified_round: u64,
}

/// Ordered owners of one connection.
#[derive(Debug, Default)]
pub struct OwnerList {
    links: BTreeMap<u64, OwnerLink>,
    next_seq: u64,
    round: u64,
}

impl OwnerList {
    /// Append `owner`, returning its position key.
    pub fn insert(&mut self, owner: OwnerId) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.links.insert(
            seq,
            OwnerLink {
                owner,
                notified_round: 0,
            },
        );
        seq
    }

    /// Remove the owner stored under `seq`.
    pub fn remove(&mut self, seq: u64) -> Option<OwnerId> {
        self.links.remove(&seq).map(|link| link.owner)
    }

    /// Start notifying a new event and return its round number.
    pub fn begin_round(&mut self) -> u64 {
        self.round += 1;
        self.round
    }

    /// Claim the first owner in list order not yet notified in `round`.
    ///
    /// Owners attached mid-round are picked up too; owners detached mid-round
    /// are simply gone.
    pub fn next_unnotified(&mut self, round: u64) -> Option<OwnerId> {
        let link = self
            .links
            .values_mut()
            .find(|link| link.notified_round < round)?;
        link.notified_round = round;
        Some(link.owner)
    }

    /// Owners in notification order.
    pub fn iter(&self) -> impl Iterator<Item = OwnerId> + '_ {
        self.links.values().map(|link| link.owner)
    }

    /// Number of attached owners.
    #[must_use]
    pub fn len(&self) -> usize { self.links.len() }

    /// Whether no owner is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.links.is_empty() }

    /// Forget all owners.
    pub fn clear(&mut self) { self.links.clear(); }
}

#[derive(Clone)]
struct OwnerEntry {
    seq: u64,
    callbacks: Arc<dyn ConnectionOwner>,
}

/// Registry-wide map from `(connection, owner)` to callbacks.
#[derive(Default)]
pub struct OwnerRegistry(DashMap<(ConnectionHandle, OwnerId), OwnerEntry>);

impl fmt::Debug for OwnerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerRegistry")
            .field("entries", &self.0.len())
            .finish()
    }
}

impl OwnerRegistry {
    /// Whether `owner` is attached to `conn`.
    #[must_use]
    pub fn contains(&self, conn: ConnectionHandle, owner: OwnerId) -> bool {
        self.0.contains_key(&(conn, owner))
    }

    /// Record callbacks for `owner`; `seq` is its position in the record's
    /// [`OwnerList`].
    pub fn insert(
        &self,
        conn: ConnectionHandle,
        owner: OwnerId,
        seq: u64,
        callbacks: Arc<dyn ConnectionOwner>,
    ) {
        self.0.insert((conn, owner), OwnerEntry { seq, callbacks });
    }

    /// Forget `owner`, returning its list position.
    pub fn remove(&self, conn: ConnectionHandle, owner: OwnerId) -> Option<u64> {
        self.0.remove(&(conn, owner)).map(|(_, entry)| entry.seq)
    }

    /// Callbacks registered for `owner`.
    #[must_use]
    pub fn callbacks(
        &self,
        conn: ConnectionHandle,
        owner: OwnerId,
    ) -> Option<Arc<dyn ConnectionOwner>> {
        self.0
            .get(&(conn, owner))
            .map(|entry| Arc::clone(&entry.callbacks))
    }

    /// Forget every owner of `conn`.
    pub fn remove_connection(&self, conn: ConnectionHandle) {
        self.0.retain(|(c, _), _| *c != conn);
    }

    /// Total registered `(connection, owner)` pairs.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}
