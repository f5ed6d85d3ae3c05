//! Forwarder counters. Plain atomics, so counting never takes a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

pub struct ForwarderStats {
    pub servers_admitted: AtomicU64,
    pub clients_admitted: AtomicU64,
    pub rejected: AtomicU64,
    pub bytes_to_server: AtomicU64,
    pub bytes_to_client: AtomicU64,
    pub started: Instant,
}

impl ForwarderStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            servers_admitted: AtomicU64::new(0),
            clients_admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            bytes_to_server: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

impl Default for ForwarderStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the forwarder, combining counters with table sizes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub servers: usize,
    pub clients: usize,
    pub servers_admitted: u64,
    pub clients_admitted: u64,
    pub rejected: u64,
    pub bytes_to_server: u64,
    pub bytes_to_client: u64,
    pub uptime_secs: u64,
}

impl StatsSnapshot {
    pub(crate) fn capture(stats: &ForwarderStats, servers: usize, clients: usize) -> Self {
        Self {
            servers,
            clients,
            servers_admitted: stats.servers_admitted.load(Ordering::Relaxed),
            clients_admitted: stats.clients_admitted.load(Ordering::Relaxed),
            rejected: stats.rejected.load(Ordering::Relaxed),
            bytes_to_server: stats.bytes_to_server.load(Ordering::Relaxed),
            bytes_to_client: stats.bytes_to_client.load(Ordering::Relaxed),
            uptime_secs: stats.started.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_reads_counters() {
        let stats = ForwarderStats::new();
        ForwarderStats::add(&stats.bytes_to_server, 10);
        ForwarderStats::add(&stats.bytes_to_server, 5);
        ForwarderStats::add(&stats.rejected, 1);
        let snap = StatsSnapshot::capture(&stats, 2, 3);
        assert_eq!(snap.servers, 2);
        assert_eq!(snap.clients, 3);
        assert_eq!(snap.bytes_to_server, 15);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.bytes_to_client, 0);
    }
}
