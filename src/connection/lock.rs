//! Per-connection triple lock.
//!
//! A [`TripleLock`] combines three primitives over one record:
//!
//! - the *data* lock, held by whoever is currently mutating the record;
//! - the *API* slot, a binary semaphore claimed by application calls for the
//!   whole duration of the call;
//! - the *process* lock, which serialises event-path entrants among
//!   themselves.
//!
//! Application calls use [`TripleLock::lock_api`]: they wait for the data lock,
//! then try the API slot, and never wait for the slot while holding the data
//! lock. Worker threads use [`TripleLock::lock_event`]: they take the process
//! lock, then wait until both the data lock and the API slot are free.
//!
//! Both paths validate the unique id the caller expects. Pooled records are
//! recycled under a new id, so a handle that outlived its record gets
//! [`TransportError::Destructed`] instead of touching the new occupant.
//!
//! Re-entry is tracked per thread. A thread already holding a connection's
//! lock (on either path) gets a nested guard from both acquisition functions
//! and the lock is released when the outermost guard drops.

use std::{cell::RefCell, fmt, marker::PhantomData, ops::Deref, ptr};

use crate::{
    error::TransportError,
    sync::{self, Condvar, Mutex, MutexGuard},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Path {
    Api,
    Event,
}

#[derive(Clone, Copy, Debug)]
struct Held {
    lock: usize,
    depth: usize,
    path: Path,
}

sync::thread_local! {
    static HELD: RefCell<Vec<Held>> = RefCell::new(Vec::new());
}

fn enter_nested(lock: usize) -> bool {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        match held.iter_mut().find(|h| h.lock == lock) {
            Some(entry) => {
                entry.depth += 1;
                true
            }
            None => false,
        }
    })
}

fn mark(entry: Held) { HELD.with(|held| held.borrow_mut().push(entry)); }

fn take_mark(lock: usize) -> Option<Held> {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        let pos = held.iter().position(|h| h.lock == lock)?;
        Some(held.swap_remove(pos))
    })
}

/// Drop one nesting level; returns the path to release once the outermost
/// level is gone.
fn leave(lock: usize) -> Option<Path> {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        let pos = held.iter().position(|h| h.lock == lock)?;
        held[pos].depth -= 1;
        (held[pos].depth == 0).then(|| held.swap_remove(pos).path)
    })
}

#[derive(Debug, Default)]
struct LockState {
    id: u64,
    data_held: bool,
    api_busy: bool,
    process_held: bool,
}

/// Data lock, API semaphore and process lock guarding one record.
pub struct TripleLock<T> {
    state: Mutex<LockState>,
    changed: Condvar,
    data: Mutex<T>,
}

impl<T> fmt::Debug for TripleLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = sync::lock(&self.state);
        f.debug_struct("TripleLock")
            .field("id", &state.id)
            .field("data_held", &state.data_held)
            .field("api_busy", &state.api_busy)
            .field("process_held", &state.process_held)
            .finish_non_exhaustive()
    }
}

impl<T> TripleLock<T> {
    /// Wrap `value`, valid for handles carrying `id`.
    pub fn new(id: u64, value: T) -> Self {
        Self {
            state: Mutex::new(LockState {
                id,
                ..LockState::default()
            }),
            changed: Condvar::new(),
            data: Mutex::new(value),
        }
    }

    /// Unique id currently assigned; zero while the slot is free.
    pub fn id(&self) -> u64 { sync::lock(&self.state).id }

    /// Give the slot a new identity. Outstanding handles become stale.
    pub(crate) fn assign(&self, id: u64) { sync::lock(&self.state).id = id; }

    fn addr(&self) -> usize { ptr::from_ref(self).addr() }

    /// Acquire on behalf of an application call.
    ///
    /// Blocks until the API slot is free. Re-entrant for the current thread.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Destructed`] when the lock no longer carries
    /// `expected`.
    pub fn lock_api(&self, expected: u64) -> Result<ApiGuard<'_, T>, TransportError> {
        let locked = self.enter(expected, Path::Api)?;
        Ok(ApiGuard { locked })
    }

    /// Acquire on behalf of an event handler.
    ///
    /// Waits until no application call holds the API slot. If the current
    /// thread already holds this lock the returned guard is nested and the
    /// lock state is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Destructed`] when the lock no longer carries
    /// `expected`.
    pub fn lock_event(&self, expected: u64) -> Result<EventGuard<'_, T>, TransportError> {
        let locked = self.enter(expected, Path::Event)?;
        Ok(EventGuard { locked })
    }

    fn enter(&self, expected: u64, path: Path) -> Result<Locked<'_, T>, TransportError> {
        let addr = self.addr();
        let nested = enter_nested(addr);
        if nested {
            let locked = Locked {
                lock: self,
                id: expected,
                nested,
                _not_send: PhantomData,
            };
            if self.id() != expected {
                // Dropping `locked` undoes the nesting level taken above.
                return Err(TransportError::Destructed);
            }
            return Ok(locked);
        }
        match path {
            Path::Api => self.acquire_api(Some(expected))?,
            Path::Event => self.acquire_event(Some(expected))?,
        }
        mark(Held {
            lock: addr,
            depth: 1,
            path,
        });
        Ok(Locked {
            lock: self,
            id: expected,
            nested,
            _not_send: PhantomData,
        })
    }

    fn acquire_api(&self, expected: Option<u64>) -> Result<(), TransportError> {
        let mut state = sync::lock(&self.state);
        loop {
            while state.data_held {
                state = sync::wait(&self.changed, state);
            }
            if expected.is_some_and(|id| id != state.id) {
                return Err(TransportError::Destructed);
            }
            if !state.api_busy {
                state.api_busy = true;
                state.data_held = true;
                return Ok(());
            }
            // Slot busy: give up the data lock and retry once it is posted.
            state = sync::wait(&self.changed, state);
        }
    }

    fn acquire_event(&self, expected: Option<u64>) -> Result<(), TransportError> {
        let mut state = sync::lock(&self.state);
        while state.process_held {
            state = sync::wait(&self.changed, state);
        }
        state.process_held = true;
        while state.data_held || state.api_busy {
            state = sync::wait(&self.changed, state);
        }
        if expected.is_some_and(|id| id != state.id) {
            state.process_held = false;
            drop(state);
            self.changed.notify_all();
            return Err(TransportError::Destructed);
        }
        state.data_held = true;
        Ok(())
    }

    fn release(&self, path: Path) {
        let mut state = sync::lock(&self.state);
        state.data_held = false;
        match path {
            Path::Api => state.api_busy = false,
            Path::Event => state.process_held = false,
        }
        drop(state);
        self.changed.notify_all();
    }
}

/// Access to a locked record, shared by [`ApiGuard`] and [`EventGuard`].
pub struct Locked<'a, T> {
    lock: &'a TripleLock<T>,
    id: u64,
    nested: bool,
    _not_send: PhantomData<*const ()>,
}

impl<T> Locked<'_, T> {
    /// Borrow the record.
    ///
    /// The borrow must end before calling back into anything that locks the
    /// same record.
    pub fn data(&self) -> MutexGuard<'_, T> { sync::lock(&self.lock.data) }

    /// Unique id this guard was acquired for.
    pub fn id(&self) -> u64 { self.id }

    /// Whether this guard re-entered a lock the thread already held.
    pub fn is_nested(&self) -> bool { self.nested }

    /// Run `f` with the lock fully released, then restore it exactly as it
    /// was, nesting depth included.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Destructed`] when the record was recycled
    /// while released. The lock is still re-held so guards unwind normally.
    pub fn released<R>(&self, f: impl FnOnce() -> R) -> Result<R, TransportError> {
        let Some(held) = take_mark(self.lock.addr()) else {
            return Ok(f());
        };
        self.lock.release(held.path);
        let out = f();
        let reacquired = match held.path {
            Path::Api => self.lock.acquire_api(None),
            Path::Event => self.lock.acquire_event(None),
        };
        debug_assert!(reacquired.is_ok(), "unchecked acquisition cannot fail");
        mark(held);
        if self.lock.id() == self.id {
            Ok(out)
        } else {
            Err(TransportError::Destructed)
        }
    }

    /// Mark the record free; later acquisitions with the old id fail.
    pub(crate) fn retire(&self) { self.lock.assign(0); }
}

impl<T> Drop for Locked<'_, T> {
    fn drop(&mut self) {
        if let Some(path) = leave(self.lock.addr()) {
            self.lock.release(path);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Locked<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locked")
            .field("id", &self.id)
            .field("nested", &self.nested)
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`TripleLock::lock_api`].
#[derive(Debug)]
pub struct ApiGuard<'a, T> {
    locked: Locked<'a, T>,
}

impl<'a, T> Deref for ApiGuard<'a, T> {
    type Target = Locked<'a, T>;

    fn deref(&self) -> &Self::Target { &self.locked }
}

/// Guard returned by [`TripleLock::lock_event`].
#[derive(Debug)]
pub struct EventGuard<'a, T> {
    locked: Locked<'a, T>,
}

impl<'a, T> Deref for EventGuard<'a, T> {
    type Target = Locked<'a, T>;

    fn deref(&self) -> &Self::Target { &self.locked }
}
