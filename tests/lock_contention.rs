#![cfg(not(loom))]
//! Application calls and dispatcher workers racing on the same connections.

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use common::{INVITE, TestResult, config};
use rstest::rstest;
use sipwire::{
    TransportConfig,
    TransportError,
    connection::{ConnectionHandle, ConnectionState, OwnerId},
};
use sipwire_testing::{Harness, RecordingOwner, tcp_key};

const ROUNDS: usize = 1000;

#[rstest]
fn api_calls_and_events_interleave_without_loss(config: TransportConfig) -> TestResult {
    let mut harness = Harness::new(config);
    let conn = harness.open_client(tcp_key(5060), 1, &RecordingOwner::new());
    let Harness {
        registry,
        queues,
        sink,
        ..
    } = harness;
    let workers = queues.spawn_workers(Arc::clone(&registry))?;
    let posted = Arc::new(AtomicUsize::new(0));

    thread::scope(|scope| {
        for caller in 0..4_u64 {
            let registry = &registry;
            scope.spawn(move || {
                let owner = OwnerId::new(100 + caller);
                for _ in 0..ROUNDS / 4 {
                    registry
                        .attach_owner(conn, owner, RecordingOwner::new())
                        .expect("attach");
                    registry.inc_usage(conn).expect("usage up");
                    registry.dec_usage(conn).expect("usage down");
                    registry.detach_owner(conn, owner, false).expect("detach");
                }
            });
        }
        let registry = &registry;
        let posted = &posted;
        scope.spawn(move || {
            let mut sent = 0;
            while sent < ROUNDS {
                if registry.receive(conn, Bytes::from_static(INVITE)).is_ok() {
                    sent += 1;
                } else {
                    thread::yield_now();
                }
            }
            posted.store(sent, Ordering::Release);
        });
    });

    let expected = posted.load(Ordering::Acquire);
    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.frames_for(conn).len() < expected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(sink.frames_for(conn).len(), expected);
    assert_eq!(registry.owner_count(conn)?, 1);

    registry.shutdown();
    workers.join();
    assert!(matches!(registry.state(conn), Err(TransportError::Destructed)));
    Ok(())
}

#[rstest]
fn stale_handles_fail_under_contention(config: TransportConfig) -> TestResult {
    let mut harness = Harness::new(config);
    let conn = harness.open_client(tcp_key(5060), 1, &RecordingOwner::new());
    let stale = ConnectionHandle::new(conn.index(), conn.id() + 1000);

    thread::scope(|scope| {
        for _ in 0..4 {
            let registry = &harness.registry;
            scope.spawn(move || {
                for _ in 0..ROUNDS / 4 {
                    assert!(matches!(registry.state(stale), Err(TransportError::Destructed)));
                    assert_eq!(registry.state(conn).expect("live"), ConnectionState::TcpConnected);
                }
            });
        }
    });
    Ok(())
}
