//! Live connection record counting.

use std::sync::atomic::{AtomicU64, Ordering};

/// Records currently allocated from any registry pool.
static LIVE_RECORDS: AtomicU64 = AtomicU64::new(0);

/// Counts one allocated record for as long as it lives.
///
/// Stored inside the record on allocation and dropped when the record returns
/// to the free list, keeping the gauge and [`live_connection_count`] in step.
#[derive(Debug)]
pub(crate) struct ActiveConnection;

impl ActiveConnection {
    pub(crate) fn new() -> Self {
        LIVE_RECORDS.fetch_add(1, Ordering::Relaxed);
        crate::metrics::inc_connections();
        Self
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        LIVE_RECORDS.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::dec_connections();
    }
}

/// Number of connection records currently allocated, across all registries.
#[must_use]
pub fn live_connection_count() -> u64 { LIVE_RECORDS.load(Ordering::Relaxed) }
