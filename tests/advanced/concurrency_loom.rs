#![cfg(all(feature = "advanced-tests", loom))]
//! Concurrency tests for the per-connection triple lock using loom.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test --features advanced-tests
//! --test concurrency_loom`. `loom` explores the interleavings of an
//! application call and an event handler contending for the same record.

use loom::{model, sync::Arc, thread};
use sipwire::{TransportError, connection::TripleLock};

#[derive(Debug, Default)]
struct Record {
    inside: bool,
    entries: u32,
}

fn enter(record: &mut Record) {
    assert!(!record.inside, "two holders inside one record");
    record.inside = true;
    record.entries += 1;
}

fn leave(record: &mut Record) { record.inside = false; }

#[test]
fn api_and_event_paths_exclude_each_other() {
    model(|| {
        let lock = Arc::new(TripleLock::new(7, Record::default()));

        let api = Arc::clone(&lock);
        let caller = thread::spawn(move || {
            let guard = api.lock_api(7).expect("api path");
            enter(&mut guard.data());
            leave(&mut guard.data());
        });

        let event = Arc::clone(&lock);
        let worker = thread::spawn(move || {
            let guard = event.lock_event(7).expect("event path");
            enter(&mut guard.data());
            leave(&mut guard.data());
        });

        caller.join().expect("api thread panicked");
        worker.join().expect("event thread panicked");

        let guard = lock.lock_api(7).expect("final check");
        assert_eq!(guard.data().entries, 2);
    });
}

#[test]
fn released_guard_admits_the_other_path() {
    model(|| {
        let lock = Arc::new(TripleLock::new(3, Record::default()));

        let event = Arc::clone(&lock);
        let worker = thread::spawn(move || {
            let guard = event.lock_event(3).expect("event path");
            enter(&mut guard.data());
            leave(&mut guard.data());
        });

        {
            let guard = lock.lock_api(3).expect("api path");
            enter(&mut guard.data());
            leave(&mut guard.data());
            guard
                .released(|| ())
                .expect("record keeps its identity");
            enter(&mut guard.data());
            leave(&mut guard.data());
        }

        worker.join().expect("event thread panicked");
        let guard = lock.lock_api(3).expect("final check");
        assert_eq!(guard.data().entries, 3);
    });
}

#[test]
fn stale_id_is_rejected_on_both_paths() {
    model(|| {
        let lock = Arc::new(TripleLock::new(9, Record::default()));
        let other = Arc::clone(&lock);
        let worker = thread::spawn(move || matches!(other.lock_event(8), Err(TransportError::Destructed)));

        assert!(matches!(lock.lock_api(8), Err(TransportError::Destructed)));
        assert!(worker.join().expect("event thread panicked"));
    });
}
