#![cfg(not(loom))]
//! Finding reusable connections through the primary and alias hashes.

mod common;

use std::sync::{Arc, Mutex};

use common::{TestResult, config, parking};
use rstest::rstest;
use sipwire::{
    TransportConfig,
    TransportHooks,
    connection::{ConnectionHandle, ConnectionState, OwnerId, TlsState, TransportKind},
    registry::{Acquired, ConnectRequest, ConnectionKey, RemoteAddress, ViaSentBy},
};
use sipwire_testing::{Harness, RecordingOwner, local, remote, tcp_key, tls_key};

fn acquire(harness: &Harness, request: ConnectRequest, owner: u64) -> TestResult<Acquired> {
    Ok(harness
        .registry
        .find_or_create(request, OwnerId::new(owner), RecordingOwner::new())?)
}

#[rstest]
fn matching_request_reuses_the_connection(config: TransportConfig) -> TestResult {
    let mut harness = Harness::new(config);
    let conn = harness.open_client(tcp_key(5060), 1, &RecordingOwner::new());

    let again = acquire(&harness, ConnectRequest::new(tcp_key(5060)), 2)?;
    assert!(again.reused);
    assert_eq!(again.handle, conn);
    assert_eq!(harness.registry.owner_count(conn)?, 2);

    let other = acquire(&harness, ConnectRequest::new(tcp_key(5070)), 3)?;
    assert!(!other.reused);
    assert_ne!(other.handle, conn);
    Ok(())
}

#[rstest]
fn forced_creation_bypasses_the_hash(config: TransportConfig) -> TestResult {
    let mut harness = Harness::new(config);
    let conn = harness.open_client(tcp_key(5060), 1, &RecordingOwner::new());

    let forced = acquire(&harness, ConnectRequest::forced(tcp_key(5060)), 2)?;
    assert!(!forced.reused);
    assert_ne!(forced.handle, conn);
    assert!(!harness.registry.is_hashed(forced.handle));
    assert!(harness.registry.is_hashed(conn));

    let again = acquire(&harness, ConnectRequest::new(tcp_key(5060)), 3)?;
    assert_eq!(again.handle, conn);
    Ok(())
}

#[rstest]
fn sctp_always_reuses(config: TransportConfig) -> TestResult {
    let mut harness = Harness::new(config);
    let key = ConnectionKey::new(TransportKind::Sctp, local(), remote(5060));
    let conn = harness.open_client(key.clone(), 1, &RecordingOwner::new());
    assert_eq!(harness.registry.state(conn)?, ConnectionState::SctpConnected);

    let forced = acquire(&harness, ConnectRequest::forced(key), 2)?;
    assert!(forced.reused);
    assert_eq!(forced.handle, conn);
    Ok(())
}

#[rstest]
fn closing_candidate_is_never_reused(config: TransportConfig) -> TestResult {
    let mut harness = Harness::new(config);
    let conn = harness.open_client(tcp_key(5060), 1, &RecordingOwner::new());
    harness.registry.disconnect(conn)?;

    let fresh = acquire(&harness, ConnectRequest::new(tcp_key(5060)), 2)?;
    assert!(!fresh.reused);
    assert_ne!(fresh.handle, conn);

    harness.drain();
    assert!(harness.registry.state(conn).is_err());
    assert!(harness.registry.is_hashed(fresh.handle));
    Ok(())
}

#[rstest]
fn errored_candidate_is_never_reused(config: TransportConfig) -> TestResult {
    let mut harness = Harness::new(config);
    let conn = harness.open_client(tcp_key(5060), 1, &RecordingOwner::new());
    harness.registry.inc_usage(conn)?;
    harness.registry.on_network_error(conn);
    harness.drain();
    assert_eq!(harness.registry.state(conn)?, ConnectionState::TcpConnected);

    let fresh = acquire(&harness, ConnectRequest::new(tcp_key(5060)), 2)?;
    assert!(!fresh.reused);
    assert_ne!(fresh.handle, conn);
    Ok(())
}

#[rstest]
fn tls_candidate_needs_a_reusable_tls_state(config: TransportConfig) -> TestResult {
    let mut harness = Harness::new(config);
    let conn = harness.open_client(tls_key(5061), 1, &RecordingOwner::new());
    assert_eq!(harness.registry.tls_state(conn)?, TlsState::Undefined);

    harness.registry.on_tls_state(conn, TlsState::HandshakeStarted);
    harness.drain();
    let reused = acquire(&harness, ConnectRequest::new(tls_key(5061)), 3)?;
    assert!(reused.reused);
    assert_eq!(reused.handle, conn);
    Ok(())
}

#[rstest]
fn tls_candidate_in_undefined_state_is_replaced(config: TransportConfig) -> TestResult {
    let mut harness = Harness::new(config);
    let conn = harness.open_client(tls_key(5061), 1, &RecordingOwner::new());

    let fresh = acquire(&harness, ConnectRequest::new(tls_key(5061)), 2)?;
    assert!(!fresh.reused);
    assert_ne!(fresh.handle, conn);
    Ok(())
}

#[rstest]
fn tls_close_sequence_disconnects(config: TransportConfig) -> TestResult {
    let mut harness = Harness::new(config);
    let owner = RecordingOwner::new();
    let conn = harness.open_client(tls_key(5061), 1, &owner);
    harness.registry.on_tls_state(conn, TlsState::Connected);
    harness.registry.on_tls_state(conn, TlsState::CloseSequenceStarted);
    harness.drain();

    assert!(harness.registry.state(conn).is_err());
    assert_eq!(owner.states().last(), Some(&ConnectionState::Terminated));
    Ok(())
}

#[rstest]
fn pool_exhaustion_is_reported() -> TestResult {
    let mut harness = Harness::new(TransportConfig {
        max_connections: std::num::NonZeroUsize::MIN,
        ..parking(0)
    });
    harness.open_client(tcp_key(5060), 1, &RecordingOwner::new());
    let err = harness
        .registry
        .find_or_create(ConnectRequest::new(tcp_key(5070)), OwnerId::new(2), RecordingOwner::new())
        .expect_err("pool is full");
    assert!(matches!(err, sipwire::TransportError::PoolExhausted { capacity: 1 }));
    Ok(())
}

#[rstest]
fn authorised_alias_lets_clients_reuse_a_server_connection(config: TransportConfig) -> TestResult {
    let offered = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&offered);
    let mut harness = Harness::with_builder(config, move |builder| {
        builder.hooks(TransportHooks {
            on_server_reuse: Some(Box::new(move |conn: ConnectionHandle, alias: &str| {
                seen.lock().expect("offers").push((conn, alias.to_owned()));
            })),
            ..TransportHooks::default()
        })
    });
    let server = harness.accept_server(TransportKind::Tcp, 5070);
    let via = ViaSentBy {
        host: "192.0.2.10".into(),
        port: Some(5070),
        alias: true,
    };

    assert!(harness.registry.apply_server_reuse(server, &via)?);
    assert_eq!(
        *offered.lock().expect("offers"),
        vec![(server, "192.0.2.10:5070".to_owned())]
    );
    assert!(!harness.registry.is_hashed(server));

    harness.registry.authorize_alias(server)?;
    assert!(harness.registry.is_hashed(server));
    assert!(!harness.registry.apply_server_reuse(server, &via)?);

    let by_address = acquire(&harness, ConnectRequest::new(tcp_key(5070)), 1)?;
    assert!(by_address.reused);
    assert_eq!(by_address.handle, server);

    let by_alias = acquire(
        &harness,
        ConnectRequest::new(ConnectionKey::new(
            TransportKind::Tcp,
            local(),
            RemoteAddress::Alias("192.0.2.10:5070".into()),
        )),
        2,
    )?;
    assert_eq!(by_alias.handle, server);
    Ok(())
}

#[rstest]
fn via_without_alias_parameter_is_ignored(config: TransportConfig) -> TestResult {
    let mut harness = Harness::new(config);
    let server = harness.accept_server(TransportKind::Tcp, 5070);
    let via = ViaSentBy {
        host: "192.0.2.10".into(),
        port: Some(5070),
        alias: false,
    };
    assert!(!harness.registry.apply_server_reuse(server, &via)?);
    assert!(harness.registry.authorize_alias(server).is_err());
    Ok(())
}
