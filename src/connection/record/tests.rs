use std::{
    net::{Ipv4Addr, SocketAddr},
    num::NonZeroUsize,
    time::Duration,
};

use rstest::{fixture, rstest};

use super::*;
use crate::connection::OwnerId;

struct Silent;

impl ConnectionOwner for Silent {}

fn framer() -> MessageFramer {
    MessageFramer::new(NonZeroUsize::new(4096).expect("non-zero"))
}

fn record(role: ConnectionRole, transport: TransportKind, state: ConnectionState) -> ConnectionRecord {
    let mut rec = ConnectionRecord::vacant(framer());
    rec.init(
        RecordInit {
            transport,
            role,
            local: LocalAddress::new(1, SocketAddr::from((Ipv4Addr::LOCALHOST, 5060))),
            remote: Some(SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 5060))),
            alias: None,
            socket: None,
        },
        framer(),
    );
    rec.state = state;
    rec
}

fn with_timeout(timeout: ServerIdleTimeout) -> TransportConfig {
    TransportConfig {
        server_idle_timeout: timeout,
        ..TransportConfig::default()
    }
}

fn parking() -> TransportConfig {
    TransportConfig {
        connection_capacity_percent: 80,
        ..TransportConfig::default()
    }
}

#[allow(unused_braces)]
#[fixture]
fn server() -> ConnectionRecord {
    record(ConnectionRole::Server, TransportKind::Tcp, ConnectionState::TcpConnected)
}

#[rstest]
#[case(ServerIdleTimeout::Immediate, false, NoOwnerAction::Disconnect)]
#[case(
    ServerIdleTimeout::After(Duration::from_secs(2)),
    false,
    NoOwnerAction::ArmTimer(Duration::from_secs(2))
)]
#[case(ServerIdleTimeout::Never, false, NoOwnerAction::Keep)]
#[case(ServerIdleTimeout::Never, true, NoOwnerAction::Disconnect)]
#[case(ServerIdleTimeout::After(Duration::from_secs(2)), true, NoOwnerAction::Disconnect)]
fn server_policy(
    server: ConnectionRecord,
    #[case] timeout: ServerIdleTimeout,
    #[case] force: bool,
    #[case] expected: NoOwnerAction,
) {
    assert_eq!(server.no_owner_action(&with_timeout(timeout), force), expected);
}

#[rstest]
fn server_timer_needs_connected_transport(mut server: ConnectionRecord) {
    server.state = ConnectionState::Ready;
    let cfg = with_timeout(ServerIdleTimeout::After(Duration::from_secs(2)));
    assert_eq!(server.no_owner_action(&cfg, false), NoOwnerAction::Keep);
}

#[rstest]
fn owned_connections_are_kept(mut server: ConnectionRecord) {
    server.owners.insert(OwnerId::new(1));
    let cfg = with_timeout(ServerIdleTimeout::Immediate);
    assert_eq!(server.no_owner_action(&cfg, true), NoOwnerAction::Keep);
}

#[rstest]
fn security_owner_counts_as_owner(mut server: ConnectionRecord) {
    server.security_owner = Some((OwnerId::new(9), Arc::new(Silent)));
    let cfg = with_timeout(ServerIdleTimeout::Immediate);
    assert_eq!(server.no_owner_action(&cfg, false), NoOwnerAction::Keep);
}

#[rstest]
#[case(TransportKind::Tcp)]
#[case(TransportKind::Sctp)]
fn plain_clients_park_only_with_budget(#[case] transport: TransportKind) {
    let rec = record(ConnectionRole::Client, transport, ConnectionState::TcpConnected);
    assert_eq!(
        rec.no_owner_action(&TransportConfig::default(), false),
        NoOwnerAction::Disconnect
    );
    assert_eq!(rec.no_owner_action(&parking(), false), NoOwnerAction::Park);
}

#[test]
fn connected_tls_client_gets_grace_timer() {
    let mut rec = record(ConnectionRole::Client, TransportKind::Tls, ConnectionState::TcpConnected);
    rec.tls_state = TlsState::Connected;
    let cfg = TransportConfig {
        tls_client_idle_timeout: Duration::from_secs(32),
        ..TransportConfig::default()
    };
    assert_eq!(
        rec.no_owner_action(&cfg, false),
        NoOwnerAction::ArmTimer(Duration::from_secs(32))
    );
    assert_eq!(rec.no_owner_action(&parking(), false), NoOwnerAction::Park);
}

#[test]
fn handshaking_tls_client_disconnects() {
    let mut rec = record(ConnectionRole::Client, TransportKind::Tls, ConnectionState::TcpConnected);
    rec.tls_state = TlsState::HandshakeStarted;
    assert_eq!(rec.no_owner_action(&parking(), false), NoOwnerAction::Disconnect);
}

#[test]
fn multi_server_is_never_closed_for_lack_of_owners() {
    let rec = record(ConnectionRole::MultiServer, TransportKind::Tcp, ConnectionState::TcpConnected);
    assert_eq!(
        rec.no_owner_action(&with_timeout(ServerIdleTimeout::Immediate), true),
        NoOwnerAction::Keep
    );
}

#[rstest]
#[case(ConnectionState::Connecting, true)]
#[case(ConnectionState::TcpConnected, true)]
#[case(ConnectionState::SctpConnected, true)]
#[case(ConnectionState::Ready, true)]
#[case(ConnectionState::Closing, false)]
#[case(ConnectionState::Closed, false)]
#[case(ConnectionState::Idle, false)]
fn reuse_follows_state(#[case] state: ConnectionState, #[case] reusable: bool) {
    let rec = record(ConnectionRole::Client, TransportKind::Tcp, state);
    assert_eq!(rec.is_reusable(5, 5), reusable);
}

#[test]
fn reuse_rejects_stale_and_troubled_records() {
    let mut rec = record(ConnectionRole::Client, TransportKind::Tcp, ConnectionState::Ready);
    assert!(!rec.is_reusable(6, 5));
    rec.net_error = true;
    assert!(!rec.is_reusable(5, 5));
    rec.net_error = false;
    rec.timer = Some(ArmedTimer {
        ticket: 1,
        cancel: CancellationToken::new(),
    });
    assert!(!rec.is_reusable(5, 5));
}

#[rstest]
#[case(TlsState::Undefined, false)]
#[case(TlsState::HandshakeStarted, true)]
#[case(TlsState::Connected, true)]
#[case(TlsState::CloseSequenceStarted, false)]
fn tls_reuse_follows_tls_state(#[case] tls: TlsState, #[case] reusable: bool) {
    let mut rec = record(ConnectionRole::Client, TransportKind::Tls, ConnectionState::TcpConnected);
    rec.tls_state = tls;
    assert_eq!(rec.is_reusable(1, 1), reusable);
}

#[rstest]
fn attach_refused_on_error_or_close(mut server: ConnectionRecord) {
    assert!(server.accepts_owner().is_ok());
    server.net_error = true;
    assert!(matches!(
        server.accepts_owner(),
        Err(TransportError::ConnectionError)
    ));
    server.net_error = false;
    server.state = ConnectionState::Closing;
    assert!(matches!(
        server.accepts_owner(),
        Err(TransportError::InvalidState {
            state: ConnectionState::Closing
        })
    ));
}

#[rstest]
fn local_close_suppresses_reopening(mut server: ConnectionRecord) {
    assert!(!server.suppresses(ConnectionState::Ready));
    server.closed_locally = true;
    assert!(server.suppresses(ConnectionState::Ready));
    assert!(server.suppresses(ConnectionState::TcpConnected));
    assert!(!server.suppresses(ConnectionState::Closed));
}

#[rstest]
fn pending_error_colours_undefined_reason_once(mut server: ConnectionRecord) {
    server.net_error = true;
    assert_eq!(
        server.effective_reason(StateReason::Disconnected),
        StateReason::Disconnected
    );
    assert_eq!(server.effective_reason(StateReason::Undefined), StateReason::Error);
    assert!(!server.net_error);
    assert_eq!(
        server.effective_reason(StateReason::Undefined),
        StateReason::Undefined
    );
}
