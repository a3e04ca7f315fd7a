//! Event dispatcher decoupling indications from their processing.
//!
//! Socket indications, state changes, timer expiries and termination are
//! posted as [`TransportEvent`]s onto bounded `tokio::sync::mpsc` queues. The
//! queues are sharded by pool slot, so all events of one connection are
//! handled in the order they were posted, by one consumer at a time.
//!
//! Events are consumed either by worker threads started with
//! [`EventQueues::spawn_workers`] or, in tests and single-threaded hosts, by
//! pumping [`EventQueues::drain`].

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::{
    connection::{
        ConnectionHandle,
        ConnectionState,
        ConnectionStatus,
        OwnerId,
        SendId,
        StateReason,
        TlsState,
    },
    error::{Result, TransportError},
};

/// Who receives a status notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusTarget {
    /// Every owner, in list order.
    All,
    /// One owner, optionally about one of its queued sends.
    Owner(OwnerId, Option<SendId>),
}

/// Work item processed by the registry on a dispatcher consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// Tell the owners about a state change.
    StateChanged {
        /// Connection concerned.
        conn: ConnectionHandle,
        /// New state.
        state: ConnectionState,
        /// Why it changed.
        reason: StateReason,
    },
    /// Tell owners about a status.
    Status {
        /// Connection concerned.
        conn: ConnectionHandle,
        /// Status to report.
        status: ConnectionStatus,
        /// Recipients.
        target: StatusTarget,
    },
    /// Bytes read from the socket.
    Received {
        /// Connection concerned.
        conn: ConnectionHandle,
        /// Raw window.
        bytes: Bytes,
    },
    /// Outgoing connect completed.
    Connected {
        /// Connection concerned.
        conn: ConnectionHandle,
    },
    /// The peer closed its side of the stream.
    PeerClosed {
        /// Connection concerned.
        conn: ConnectionHandle,
    },
    /// The socket is closed.
    SocketClosed {
        /// Connection concerned.
        conn: ConnectionHandle,
    },
    /// The TLS layer moved on.
    TlsStateChanged {
        /// Connection concerned.
        conn: ConnectionHandle,
        /// New TLS state.
        state: TlsState,
    },
    /// The socket wrote `written` bytes of the outbound queue.
    BytesSent {
        /// Connection concerned.
        conn: ConnectionHandle,
        /// Bytes written.
        written: usize,
    },
    /// The socket reported an error.
    NetworkError {
        /// Connection concerned.
        conn: ConnectionHandle,
    },
    /// An idle timer fired.
    IdleTimerExpired {
        /// Connection concerned.
        conn: ConnectionHandle,
        /// Ticket the timer was armed with.
        ticket: u64,
    },
    /// Free the record once everything queued before this event ran.
    Terminated {
        /// Connection concerned.
        conn: ConnectionHandle,
    },
    /// Stop the consumer that receives it.
    Shutdown,
}

impl TransportEvent {
    /// Connection the event is about, if any.
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionHandle> {
        match self {
            Self::StateChanged { conn, .. }
            | Self::Status { conn, .. }
            | Self::Received { conn, .. }
            | Self::Connected { conn }
            | Self::PeerClosed { conn }
            | Self::SocketClosed { conn }
            | Self::TlsStateChanged { conn, .. }
            | Self::BytesSent { conn, .. }
            | Self::NetworkError { conn }
            | Self::IdleTimerExpired { conn, .. }
            | Self::Terminated { conn } => Some(*conn),
            Self::Shutdown => None,
        }
    }
}

/// Consumer of dispatched events.
pub trait EventHandler: Send + Sync + 'static {
    /// Process one event.
    fn handle(&self, event: TransportEvent);
}

/// Producer side of the dispatcher. Cheap to clone.
#[derive(Clone, Debug)]
pub struct EventDispatcher {
    shards: Arc<[mpsc::Sender<TransportEvent>]>,
}

/// Consumer side of the dispatcher.
#[derive(Debug)]
pub struct EventQueues {
    receivers: Vec<mpsc::Receiver<TransportEvent>>,
}

impl EventDispatcher {
    /// Create `shards` queues of `capacity` events each.
    ///
    /// At least one shard is always created.
    #[must_use]
    pub fn new(capacity: usize, shards: usize) -> (Self, EventQueues) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..shards.max(1))
            .map(|_| mpsc::channel(capacity.max(1)))
            .unzip();
        (
            Self {
                shards: senders.into(),
            },
            EventQueues { receivers },
        )
    }

    fn shard(&self, conn: ConnectionHandle) -> &mpsc::Sender<TransportEvent> {
        &self.shards[conn.slot() % self.shards.len()]
    }

    /// Queue `event` without blocking.
    ///
    /// # Errors
    ///
    /// [`TransportError::QueueFull`] when the shard is at capacity and
    /// [`TransportError::QueueClosed`] once its consumer has gone.
    pub fn post(&self, event: TransportEvent) -> Result<()> {
        let Some(conn) = event.connection() else {
            self.broadcast_shutdown();
            return Ok(());
        };
        self.shard(conn).try_send(event).map_err(|err| match err {
            TrySendError::Full(event) => {
                warn!(?event, "event queue full");
                TransportError::QueueFull
            }
            TrySendError::Closed(_) => TransportError::QueueClosed,
        })
    }

    /// Queue `event`, waiting for room.
    ///
    /// # Errors
    ///
    /// [`TransportError::QueueClosed`] once the shard's consumer has gone.
    pub async fn post_async(&self, event: TransportEvent) -> Result<()> {
        let Some(conn) = event.connection() else {
            self.broadcast_shutdown();
            return Ok(());
        };
        self.shard(conn)
            .send(event)
            .await
            .map_err(|_| TransportError::QueueClosed)
    }

    /// Ask every consumer to stop once it reaches this point of its queue.
    pub fn broadcast_shutdown(&self) {
        for shard in self.shards.iter() {
            if let Err(err) = shard.try_send(TransportEvent::Shutdown) {
                debug!(error = %err, "shutdown not queued");
            }
        }
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize { self.shards.len() }
}

impl EventQueues {
    /// Process every queued event on the calling thread until all shards are
    /// empty, including events queued by the handler itself.
    ///
    /// Returns the number of events handled. [`TransportEvent::Shutdown`] is
    /// consumed and ignored.
    pub fn drain<H: EventHandler + ?Sized>(&mut self, handler: &H) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = false;
            for rx in &mut self.receivers {
                while let Ok(event) = rx.try_recv() {
                    progressed = true;
                    if event != TransportEvent::Shutdown {
                        handler.handle(event);
                        handled += 1;
                    }
                }
            }
            if !progressed {
                return handled;
            }
        }
    }

    /// Hand each shard to its own worker thread.
    ///
    /// A worker stops on [`TransportEvent::Shutdown`] or once every
    /// [`EventDispatcher`] clone is dropped.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a thread cannot be spawned.
    pub fn spawn_workers<H: EventHandler>(self, handler: Arc<H>) -> std::io::Result<Workers> {
        let mut handles = Vec::with_capacity(self.receivers.len());
        for (index, mut rx) in self.receivers.into_iter().enumerate() {
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("sipwire-worker-{index}"))
                .spawn(move || {
                    while let Some(event) = rx.blocking_recv() {
                        if event == TransportEvent::Shutdown {
                            break;
                        }
                        handler.handle(event);
                    }
                    debug!(worker = index, "dispatcher worker stopped");
                })?;
            handles.push(handle);
        }
        Ok(Workers { handles })
    }
}

/// Running worker threads.
#[derive(Debug)]
pub struct Workers {
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Wait for every worker to stop.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("dispatcher worker panicked");
            }
        }
    }
}
