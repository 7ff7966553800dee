//! Per-interface capture statistics

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Statistics snapshot of one registered interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceStats {
    /// Number of records received from the source
    pub received: u64,
    /// Number of records dropped (kernel drops plus merge queue overflow)
    pub dropped: u64,
    /// Total payload bytes handed to the merge queue
    pub bytes_received: u64,
    /// When this snapshot was taken
    pub last_update: SystemTime,
}

impl InterfaceStats {
    /// Create new empty statistics stamped with `now`
    pub fn new(now: SystemTime) -> Self {
        Self {
            received: 0,
            dropped: 0,
            bytes_received: 0,
            last_update: now,
        }
    }

    /// Calculate drop rate as percentage of all records seen
    pub fn drop_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (self.dropped as f64 / total as f64) * 100.0
    }

    /// Get total records (received + dropped)
    pub fn total(&self) -> u64 {
        self.received + self.dropped
    }
}

/// Counters reported by a packet source itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Records the source has seen
    pub received: u64,
    /// Records the source lost before they could be read
    pub dropped: u64,
}

/// Thread-safe statistics accumulator for one interface
///
/// Shared between the interface's read loop (writer side) and the flush
/// scheduler (snapshot side). Values are monotonically non-decreasing for
/// the lifetime of the accumulator, including across capture restarts.
#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    /// Totals carried over from earlier captures on this interface
    base_received: Arc<AtomicU64>,
    base_dropped: Arc<AtomicU64>,
    /// Counters of the currently active source
    source_received: Arc<AtomicU64>,
    source_dropped: Arc<AtomicU64>,
    /// Records delivered by the currently active source
    records: Arc<AtomicU64>,
    /// Records lost because the merge queue was full
    queue_dropped: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    /// Held for writing while source counters move into the base totals
    generation: Arc<RwLock<()>>,
}

impl StatsAccumulator {
    /// Create a new statistics accumulator
    pub fn new() -> Self {
        Self {
            base_received: Arc::new(AtomicU64::new(0)),
            base_dropped: Arc::new(AtomicU64::new(0)),
            source_received: Arc::new(AtomicU64::new(0)),
            source_dropped: Arc::new(AtomicU64::new(0)),
            records: Arc::new(AtomicU64::new(0)),
            queue_dropped: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            generation: Arc::new(RwLock::new(())),
        }
    }

    /// Record a record read from the source
    pub fn record_packet(&self, size: usize) {
        self.records.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record records lost before entering the merge queue
    pub fn record_drops(&self, count: u64) {
        self.queue_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Fold in the counters reported by the active source
    pub fn observe_source(&self, stats: SourceStats) {
        self.source_received
            .fetch_max(stats.received, Ordering::Relaxed);
        self.source_dropped
            .fetch_max(stats.dropped, Ordering::Relaxed);
    }

    /// Start counting for a new source on the same interface
    ///
    /// Must only be called while no read loop is feeding this accumulator.
    pub fn begin_generation(&self) {
        let _generation = self.generation.write();
        let received = self
            .source_received
            .swap(0, Ordering::Relaxed)
            .max(self.records.swap(0, Ordering::Relaxed));
        let dropped = self.source_dropped.swap(0, Ordering::Relaxed);
        self.base_received.fetch_add(received, Ordering::Relaxed);
        self.base_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    /// Get current statistics snapshot stamped with `now`
    pub fn snapshot(&self, now: SystemTime) -> InterfaceStats {
        let _generation = self.generation.read();
        InterfaceStats {
            received: self.received_total(),
            dropped: self.dropped_total(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            last_update: now,
        }
    }

    /// Get packets received count
    pub fn packets_received(&self) -> u64 {
        let _generation = self.generation.read();
        self.received_total()
    }

    /// Get packets dropped count
    pub fn packets_dropped(&self) -> u64 {
        let _generation = self.generation.read();
        self.dropped_total()
    }

    fn received_total(&self) -> u64 {
        let current = self
            .source_received
            .load(Ordering::Relaxed)
            .max(self.records.load(Ordering::Relaxed));
        self.base_received.load(Ordering::Relaxed) + current
    }

    fn dropped_total(&self) -> u64 {
        self.base_dropped.load(Ordering::Relaxed)
            + self.source_dropped.load(Ordering::Relaxed)
            + self.queue_dropped.load(Ordering::Relaxed)
    }

    /// Get records dropped because the merge queue was full
    pub fn queue_dropped(&self) -> u64 {
        self.queue_dropped.load(Ordering::Relaxed)
    }
}

impl Default for StatsAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
