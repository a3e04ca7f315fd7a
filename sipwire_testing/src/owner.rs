//! Owner double recording every callback.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use sipwire::connection::{
    ConnectionHandle,
    ConnectionOwner,
    ConnectionState,
    ConnectionStatus,
    SendId,
    StateReason,
};

/// One callback received by a [`RecordingOwner`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification {
    /// `on_state_changed`.
    State(ConnectionState, StateReason),
    /// `on_status`.
    Status(ConnectionStatus, Option<SendId>),
}

type Reaction = Box<dyn Fn(ConnectionHandle, &Notification) + Send + Sync>;

/// Records the notifications it receives, optionally reacting to each one
/// while the connection lock is released.
#[derive(Default)]
pub struct RecordingOwner {
    seen: Mutex<Vec<(ConnectionHandle, Notification)>>,
    reaction: Option<Reaction>,
}

impl fmt::Debug for RecordingOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingOwner")
            .field("seen", &self.notifications())
            .field("reaction", &self.reaction.is_some())
            .finish()
    }
}

impl RecordingOwner {
    /// A passive recorder.
    #[must_use]
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    /// A recorder that runs `reaction` after recording each notification.
    #[must_use]
    pub fn reacting(
        reaction: impl Fn(ConnectionHandle, &Notification) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::default(),
            reaction: Some(Box::new(reaction)),
        })
    }

    /// Every notification so far, in arrival order.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.lock().iter().map(|(_, n)| *n).collect()
    }

    /// The states reported so far.
    #[must_use]
    pub fn states(&self) -> Vec<ConnectionState> {
        self.lock()
            .iter()
            .filter_map(|(_, n)| match n {
                Notification::State(state, _) => Some(*state),
                Notification::Status(..) => None,
            })
            .collect()
    }

    /// The reason reported with `state`, if it was reported.
    #[must_use]
    pub fn reason_for(&self, state: ConnectionState) -> Option<StateReason> {
        self.lock().iter().find_map(|(_, n)| match n {
            Notification::State(s, reason) if *s == state => Some(*reason),
            _ => None,
        })
    }

    /// The statuses reported so far.
    #[must_use]
    pub fn statuses(&self) -> Vec<(ConnectionStatus, Option<SendId>)> {
        self.lock()
            .iter()
            .filter_map(|(_, n)| match n {
                Notification::Status(status, send) => Some((*status, *send)),
                Notification::State(..) => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ConnectionHandle, Notification)>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, conn: ConnectionHandle, notification: Notification) {
        self.lock().push((conn, notification));
        if let Some(reaction) = &self.reaction {
            reaction(conn, &notification);
        }
    }
}

impl ConnectionOwner for RecordingOwner {
    fn on_state_changed(&self, conn: ConnectionHandle, state: ConnectionState, reason: StateReason) {
        self.record(conn, Notification::State(state, reason));
    }

    fn on_status(&self, conn: ConnectionHandle, status: ConnectionStatus, send: Option<SendId>) {
        self.record(conn, Notification::Status(status, send));
    }
}
