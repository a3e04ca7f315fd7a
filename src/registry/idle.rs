//! Connected client connections parked without owners.

use std::collections::VecDeque;

use crate::{
    connection::ConnectionHandle,
    error::{Result, TransportError},
};

/// Bounded FIFO of parked connections, oldest first.
#[derive(Debug)]
pub(crate) struct IdleList {
    parked: VecDeque<ConnectionHandle>,
    capacity: usize,
}

impl IdleList {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            parked: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Park `conn`. Parking an already parked connection is a no-op.
    pub(crate) fn push(&mut self, conn: ConnectionHandle) -> Result<()> {
        if self.contains(conn) {
            return Ok(());
        }
        if self.parked.len() >= self.capacity {
            return Err(TransportError::IdleListFull);
        }
        self.parked.push_back(conn);
        Ok(())
    }

    /// Unpark `conn`, reporting whether it was parked.
    pub(crate) fn remove(&mut self, conn: ConnectionHandle) -> bool {
        match self.parked.iter().position(|c| *c == conn) {
            Some(pos) => {
                self.parked.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Take the connection parked longest.
    pub(crate) fn pop_oldest(&mut self) -> Option<ConnectionHandle> { self.parked.pop_front() }

    pub(crate) fn contains(&self, conn: ConnectionHandle) -> bool { self.parked.contains(&conn) }

    pub(crate) fn len(&self) -> usize { self.parked.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_connection_leaves_first() {
        let mut idle = IdleList::new(2);
        let a = ConnectionHandle::new(0, 1);
        let b = ConnectionHandle::new(1, 2);
        idle.push(a).expect("room");
        idle.push(b).expect("room");
        idle.push(a).expect("already parked");
        assert!(matches!(
            idle.push(ConnectionHandle::new(2, 3)),
            Err(TransportError::IdleListFull)
        ));
        assert_eq!(idle.pop_oldest(), Some(a));
        assert!(idle.remove(b));
        assert!(!idle.remove(b));
        assert_eq!(idle.len(), 0);
    }
}
