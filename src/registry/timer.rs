//! One-shot disconnection timers on the tokio runtime.
//!
//! Each armed timer gets a ticket stored in the record. Expiry is posted to
//! the dispatcher as [`TransportEvent::IdleTimerExpired`]; the handler acts
//! only when the record still carries the same ticket, so a firing that raced
//! with cancellation or re-arming is ignored.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{runtime::Handle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    connection::{ConnectionHandle, record::ArmedTimer},
    dispatch::{EventDispatcher, TransportEvent},
    error::{Result, TransportError},
};

#[derive(Debug)]
pub(crate) struct IdleTimers {
    runtime: Option<Handle>,
    dispatcher: EventDispatcher,
    next_ticket: AtomicU64,
}

impl IdleTimers {
    pub(crate) fn new(runtime: Option<Handle>, dispatcher: EventDispatcher) -> Self {
        Self {
            runtime,
            dispatcher,
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Arm a timer posting expiry for `conn` after `after`.
    pub(crate) fn arm(&self, conn: ConnectionHandle, after: Duration) -> Result<ArmedTimer> {
        let runtime = self.runtime.as_ref().ok_or(TransportError::Timer)?;
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let dispatcher = self.dispatcher.clone();
        let deadline = Instant::now() + after;
        runtime.spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => {
                    let event = TransportEvent::IdleTimerExpired { conn, ticket };
                    if let Err(err) = dispatcher.post_async(event).await {
                        warn!(%conn, error = %err, "idle timer expiry lost");
                    }
                }
            }
        });
        debug!(%conn, ticket, after_ms = after.as_millis(), "idle timer armed");
        Ok(ArmedTimer { ticket, cancel })
    }
}

/// Stop `timer` before it fires.
pub(crate) fn cancel(conn: ConnectionHandle, timer: &ArmedTimer) {
    timer.cancel.cancel();
    debug!(%conn, ticket = timer.ticket, "idle timer cancelled");
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::dispatch::EventHandler;

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[derive(Default)]
    struct Count(std::sync::Mutex<Vec<TransportEvent>>);

    impl EventHandler for Count {
        fn handle(&self, event: TransportEvent) { self.0.lock().expect("lock").push(event); }
    }

    #[test]
    fn arming_without_runtime_fails() {
        let (dispatcher, _queues) = EventDispatcher::new(4, 1);
        let timers = IdleTimers::new(None, dispatcher);
        assert!(matches!(
            timers.arm(ConnectionHandle::new(0, 1), Duration::from_secs(1)),
            Err(TransportError::Timer)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_posted_once_and_cancellation_wins() {
        let (dispatcher, mut queues) = EventDispatcher::new(4, 1);
        let timers = IdleTimers::new(Some(Handle::current()), dispatcher);
        let conn = ConnectionHandle::new(0, 1);
        let fired = timers.arm(conn, Duration::from_millis(100)).expect("arm");
        let cancelled = timers.arm(conn, Duration::from_millis(100)).expect("arm");
        cancel(conn, &cancelled);

        tokio::time::advance(Duration::from_millis(99)).await;
        settle().await;
        let count = Count::default();
        assert_eq!(queues.drain(&count), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(queues.drain(&count), 1);
        assert_eq!(
            count.0.lock().expect("lock").as_slice(),
            &[TransportEvent::IdleTimerExpired {
                conn,
                ticket: fired.ticket
            }]
        );
    }

    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn arming_and_cancelling_are_traced() {
        let (dispatcher, _queues) = EventDispatcher::new(4, 1);
        let timers = IdleTimers::new(Some(Handle::current()), dispatcher);
        let conn = ConnectionHandle::new(5, 6);
        let armed = timers.arm(conn, Duration::from_millis(250)).expect("arm");
        cancel(conn, &armed);

        assert!(logs_contain("idle timer armed"));
        assert!(logs_contain("after_ms=250"));
        assert!(logs_contain("idle timer cancelled"));
        assert!(logs_contain("conn#5.6"));
    }
}
