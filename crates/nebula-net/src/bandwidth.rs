//! Bandwidth accounting: wire vs stream bytes and operation counts per
//! measurement period.
//!
//! Connections report a [`Transferred`] for every read and write; the owner
//! feeds those into [`NetworkCounters`] and rolls them into [`NetworkStats`]
//! once per period.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::connection::Transferred;

// ---------------------------------------------------------------------------
// NetworkCounters
// ---------------------------------------------------------------------------

/// Live counters bumped from the I/O path.
///
/// Atomics let the connector workers and the owning thread share one set
/// without locking.
#[derive(Debug, Default)]
pub struct NetworkCounters {
    /// On-wire bytes sent (after compression).
    pub bytes_sent: AtomicU64,
    /// On-wire bytes received (before decompression).
    pub bytes_received: AtomicU64,
    /// Stream-level bytes handed to `write_all`.
    pub bytes_sent_stream: AtomicU64,
    /// Stream-level bytes returned from reads.
    pub bytes_received_stream: AtomicU64,
    /// Write operations that moved at least one byte.
    pub writes: AtomicU64,
    /// Read operations that moved at least one byte.
    pub reads: AtomicU64,
}

impl NetworkCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a write or flush.
    pub fn record_send(&self, transferred: Transferred) {
        if transferred.is_empty() {
            return;
        }
        self.bytes_sent
            .fetch_add(transferred.raw_bytes as u64, Ordering::Relaxed);
        self.bytes_sent_stream
            .fetch_add(transferred.bytes as u64, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a read.
    pub fn record_receive(&self, transferred: Transferred) {
        if transferred.is_empty() {
            return;
        }
        self.bytes_received
            .fetch_add(transferred.raw_bytes as u64, Ordering::Relaxed);
        self.bytes_received_stream
            .fetch_add(transferred.bytes as u64, Ordering::Relaxed);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the current values and zero every counter.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            bytes_received: self.bytes_received.swap(0, Ordering::Relaxed),
            bytes_sent_stream: self.bytes_sent_stream.swap(0, Ordering::Relaxed),
            bytes_received_stream: self.bytes_received_stream.swap(0, Ordering::Relaxed),
            writes: self.writes.swap(0, Ordering::Relaxed),
            reads: self.reads.swap(0, Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// StatsSnapshot
// ---------------------------------------------------------------------------

/// Counter values for one measurement period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent_stream: u64,
    pub bytes_received_stream: u64,
    pub writes: u64,
    pub reads: u64,
}

impl StatsSnapshot {
    /// Fraction of outgoing stream bytes saved by compression, in `0.0..=1.0`.
    ///
    /// Zero when nothing was sent or compression expanded the data.
    pub fn send_compression_ratio(&self) -> f64 {
        if self.bytes_sent_stream == 0 {
            return 0.0;
        }
        (1.0 - self.bytes_sent as f64 / self.bytes_sent_stream as f64).max(0.0)
    }

    /// Wire bytes in both directions.
    pub fn total_wire_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

// ---------------------------------------------------------------------------
// NetworkStats
// ---------------------------------------------------------------------------

/// Most recently completed measurement period.
///
/// Updated by [`update_network_stats`].
#[derive(Debug, Clone)]
pub struct NetworkStats {
    pub current: StatsSnapshot,
    /// Wire bytes per period above which a warning is logged. Default: 10 MB.
    pub warning_threshold: u64,
}

impl Default for NetworkStats {
    fn default() -> Self {
        Self {
            current: StatsSnapshot::default(),
            warning_threshold: 10 * 1024 * 1024,
        }
    }
}

/// Roll the live counters into `stats` and reset them.
///
/// Returns whether the period exceeded the warning threshold.
pub fn update_network_stats(counters: &NetworkCounters, stats: &mut NetworkStats) -> bool {
    stats.current = counters.snapshot_and_reset();

    let total = stats.current.total_wire_bytes();
    let exceeded = total > stats.warning_threshold;
    if exceeded {
        tracing::warn!(
            "Bandwidth threshold exceeded: {} bytes (threshold: {} bytes)",
            total,
            stats.warning_threshold
        );
    }

    tracing::debug!(
        "Network: sent={} bytes ({} writes), recv={} bytes ({} reads), compression saved {:.1}%",
        stats.current.bytes_sent,
        stats.current.writes,
        stats.current.bytes_received,
        stats.current.reads,
        stats.current.send_compression_ratio() * 100.0
    );
    exceeded
}
