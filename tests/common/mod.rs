//! Shared utilities for integration tests.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{num::NonZeroUsize, time::Duration};

use rstest::fixture;
use sipwire::{ServerIdleTimeout, TransportConfig};

/// Result type for fallible tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A complete request with a five byte body.
pub const INVITE: &[u8] = b"INVITE sip:bob@example.com SIP/2.0\r\nVia: SIP/2.0/TCP a.example.com\r\nContent-Length: 5\r\n\r\nHELLO";

/// Small pool, no parking, immediate server disconnect.
#[allow(unused_braces)]
#[fixture]
pub fn config() -> TransportConfig {
    TransportConfig {
        max_connections: NonZeroUsize::new(4).expect("non-zero"),
        ..TransportConfig::default()
    }
}

/// `config` with owner-less clients parked up to `percent` pool usage.
pub fn parking(percent: u8) -> TransportConfig {
    TransportConfig {
        connection_capacity_percent: percent,
        ..config()
    }
}

/// `config` with a server idle timeout of `millis`.
pub fn server_idle(millis: u64) -> TransportConfig {
    TransportConfig {
        server_idle_timeout: ServerIdleTimeout::After(Duration::from_millis(millis)),
        ..config()
    }
}

/// Yield enough times for spawned timer tasks to post their events.
pub async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}
