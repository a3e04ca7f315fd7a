//! Application hooks invoked by the connection registry.
//!
//! [`TransportHooks`] stores optional callbacks run on dispatcher workers,
//! while [`TransportObserver`] exposes the public interface applications
//! implement to configure those callbacks.

use std::{fmt, sync::Arc};

use crate::{
    codec::EofError,
    connection::{ConnectionHandle, ConnectionState, StateReason},
};

/// Trait encapsulating application reactions to transport events.
pub trait TransportObserver: Send + Sync + 'static {
    /// A peer asked, through the `alias` parameter of its top Via, that the
    /// server connection be reused for requests towards `alias`.
    ///
    /// The alias is not trusted until the application calls
    /// [`crate::registry::ConnectionRegistry::authorize_alias`], which it may
    /// do from inside this callback.
    fn on_server_reuse(&self, _conn: ConnectionHandle, _alias: &str) {}

    /// Observe every state change after the owners were notified.
    fn on_state_changed(&self, _conn: ConnectionHandle, _state: ConnectionState, _reason: StateReason) {}

    /// Called when the peer closes the stream.
    ///
    /// `partial_data` holds the bytes of an incomplete message; it is empty
    /// for a clean close.
    ///
    /// ```rust,ignore
    /// use sipwire::{EofError, TransportObserver, connection::ConnectionHandle};
    ///
    /// struct Diagnostics;
    ///
    /// impl TransportObserver for Diagnostics {
    ///     fn on_eof(&self, conn: ConnectionHandle, error: &EofError, partial: &[u8]) {
    ///         if !matches!(error, EofError::CleanClose) {
    ///             tracing::warn!(%conn, partial_bytes = partial.len(), "peer closed mid-message");
    ///         }
    ///     }
    /// }
    /// ```
    fn on_eof(&self, _conn: ConnectionHandle, _error: &EofError, _partial_data: &[u8]) {}
}

/// Type alias for the `on_server_reuse` callback.
type ServerReuseHook = Box<dyn Fn(ConnectionHandle, &str) + Send + Sync + 'static>;

/// Type alias for the `on_state_changed` callback.
type StateChangedHook =
    Box<dyn Fn(ConnectionHandle, ConnectionState, StateReason) + Send + Sync + 'static>;

/// Type alias for the `on_eof` callback.
type OnEofHook = Box<dyn Fn(ConnectionHandle, &EofError, &[u8]) + Send + Sync + 'static>;

/// Callbacks used by the registry.
#[derive(Default)]
pub struct TransportHooks {
    /// Invoked when a peer requests server connection reuse.
    pub on_server_reuse: Option<ServerReuseHook>,
    /// Invoked after a state change was fanned out.
    pub on_state_changed: Option<StateChangedHook>,
    /// Invoked when the peer closes the stream.
    pub on_eof: Option<OnEofHook>,
}

impl fmt::Debug for TransportHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHooks")
            .field("on_server_reuse", &self.on_server_reuse.is_some())
            .field("on_state_changed", &self.on_state_changed.is_some())
            .field("on_eof", &self.on_eof.is_some())
            .finish()
    }
}

impl TransportHooks {
    /// Run the `on_server_reuse` hook if registered.
    pub fn on_server_reuse(&self, conn: ConnectionHandle, alias: &str) {
        if let Some(hook) = &self.on_server_reuse {
            hook(conn, alias);
        }
    }

    /// Run the `on_state_changed` hook if registered.
    pub fn on_state_changed(&self, conn: ConnectionHandle, state: ConnectionState, reason: StateReason) {
        if let Some(hook) = &self.on_state_changed {
            hook(conn, state, reason);
        }
    }

    /// Run the `on_eof` hook if registered.
    pub fn on_eof(&self, conn: ConnectionHandle, error: &EofError, partial_data: &[u8]) {
        if let Some(hook) = &self.on_eof {
            hook(conn, error, partial_data);
        }
    }

    /// Construct hooks from a [`TransportObserver`] implementation.
    pub fn from_observer<O>(observer: &Arc<O>) -> Self
    where
        O: TransportObserver + ?Sized,
    {
        let observer_reuse = Arc::clone(observer);
        let reuse = Box::new(move |conn: ConnectionHandle, alias: &str| {
            observer_reuse.on_server_reuse(conn, alias);
        }) as ServerReuseHook;

        let observer_state = Arc::clone(observer);
        let state = Box::new(
            move |conn: ConnectionHandle, state: ConnectionState, reason: StateReason| {
                observer_state.on_state_changed(conn, state, reason);
            },
        ) as StateChangedHook;

        let observer_eof = Arc::clone(observer);
        let on_eof = Box::new(
            move |conn: ConnectionHandle, error: &EofError, partial_data: &[u8]| {
                observer_eof.on_eof(conn, error, partial_data);
            },
        ) as OnEofHook;

        Self {
            on_server_reuse: Some(reuse),
            on_state_changed: Some(state),
            on_eof: Some(on_eof),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl TransportObserver for Recorder {
        fn on_server_reuse(&self, conn: ConnectionHandle, alias: &str) {
            self.0
                .lock()
                .expect("recorder lock")
                .push(format!("reuse {conn} {alias}"));
        }

        fn on_eof(&self, conn: ConnectionHandle, error: &EofError, partial_data: &[u8]) {
            self.0
                .lock()
                .expect("recorder lock")
                .push(format!("eof {conn} {error:?} {}", partial_data.len()));
        }
    }

    #[test]
    fn observer_callbacks_are_forwarded() {
        let recorder = Arc::new(Recorder::default());
        let hooks = TransportHooks::from_observer(&recorder);
        let conn = ConnectionHandle::new(2, 9);
        hooks.on_server_reuse(conn, "10.0.0.1:5060");
        hooks.on_state_changed(conn, ConnectionState::Closed, StateReason::Undefined);
        hooks.on_eof(conn, &EofError::CleanClose, &[]);

        let seen = recorder.0.lock().expect("recorder lock").clone();
        assert_eq!(
            seen,
            vec![
                "reuse conn#2.9 10.0.0.1:5060".to_string(),
                "eof conn#2.9 CleanClose 0".to_string(),
            ]
        );
    }

    #[test]
    fn default_hooks_do_nothing() {
        let hooks = TransportHooks::default();
        hooks.on_server_reuse(ConnectionHandle::new(0, 1), "host:5060");
        assert!(format!("{hooks:?}").contains("on_eof: false"));
    }
}
