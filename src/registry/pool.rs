//! Pool bookkeeping shared by every connection of a registry.
//!
//! Everything here sits behind the registry's single pool mutex: the free
//! list, both hashes, the idle list and the outbound queues. The mutex is
//! taken after a connection's triple lock, never before.

use std::collections::{HashMap, VecDeque};

use super::{idle::IdleList, key::HashKey};
use crate::connection::{ConnectionHandle, SendQueue};

#[derive(Clone, Debug, Default)]
struct SlotKeys {
    primary: Option<HashKey>,
    alias: Option<HashKey>,
}

#[derive(Debug)]
pub(crate) struct Pool {
    free: VecDeque<u32>,
    primary: HashMap<HashKey, ConnectionHandle>,
    alias: HashMap<HashKey, ConnectionHandle>,
    keys: Vec<SlotKeys>,
    pub(crate) idle: IdleList,
    pub(crate) queues: Vec<SendQueue>,
    used: usize,
}

impl Pool {
    pub(crate) fn new(capacity: u32) -> Self {
        let slots = capacity as usize;
        Self {
            free: (0..capacity).collect(),
            primary: HashMap::with_capacity(slots),
            alias: HashMap::new(),
            keys: vec![SlotKeys::default(); slots],
            idle: IdleList::new(slots),
            queues: (0..slots).map(|_| SendQueue::default()).collect(),
            used: 0,
        }
    }

    pub(crate) fn take_free(&mut self) -> Option<u32> {
        let index = self.free.pop_front()?;
        self.used += 1;
        Some(index)
    }

    /// Return slot `index` to the free list with empty bookkeeping.
    pub(crate) fn release(&mut self, conn: ConnectionHandle) {
        self.unhash(conn);
        self.idle.remove(conn);
        if let Some(queue) = self.queues.get_mut(conn.slot()) {
            queue.clear();
        }
        self.free.push_back(conn.index());
        self.used = self.used.saturating_sub(1);
    }

    /// Records in use, as a percentage of `capacity`.
    pub(crate) fn usage_percent(&self) -> usize {
        self.used * 100 / self.keys.len().max(1)
    }

    pub(crate) fn used(&self) -> usize { self.used }

    /// Candidate for `key`: the primary hash first, then the alias hash.
    pub(crate) fn lookup(&self, key: &HashKey) -> Option<ConnectionHandle> {
        self.primary
            .get(key)
            .or_else(|| self.alias.get(key))
            .copied()
    }

    pub(crate) fn insert_primary(&mut self, key: HashKey, conn: ConnectionHandle) {
        self.primary.insert(key.clone(), conn);
        if let Some(keys) = self.keys.get_mut(conn.slot()) {
            keys.primary = Some(key);
        }
    }

    pub(crate) fn insert_alias(&mut self, key: HashKey, conn: ConnectionHandle) {
        self.alias.insert(key.clone(), conn);
        if let Some(keys) = self.keys.get_mut(conn.slot()) {
            keys.alias = Some(key);
        }
    }

    pub(crate) fn is_alias_hashed(&self, conn: ConnectionHandle) -> bool {
        self.keys
            .get(conn.slot())
            .and_then(|keys| keys.alias.as_ref())
            .is_some_and(|key| self.alias.get(key) == Some(&conn))
    }

    pub(crate) fn is_hashed(&self, conn: ConnectionHandle) -> bool {
        self.keys
            .get(conn.slot())
            .and_then(|keys| keys.primary.as_ref())
            .is_some_and(|key| self.primary.get(key) == Some(&conn))
            || self.is_alias_hashed(conn)
    }

    /// Remove `conn` from both hashes. Entries that were since taken over by
    /// another connection are left alone.
    pub(crate) fn unhash(&mut self, conn: ConnectionHandle) {
        let Some(keys) = self.keys.get_mut(conn.slot()) else {
            return;
        };
        let SlotKeys { primary, alias } = std::mem::take(keys);
        if let Some(key) = primary {
            if self.primary.get(&key) == Some(&conn) {
                self.primary.remove(&key);
            }
        }
        if let Some(key) = alias {
            if self.alias.get(&key) == Some(&conn) {
                self.alias.remove(&key);
            }
        }
    }
}
