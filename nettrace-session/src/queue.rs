//! Time-ordered merge queue
//!
//! Every read loop pushes into one [`MergeQueue`]; the flush scheduler pops
//! records back out oldest first. Records with equal timestamps come out in
//! push order.

use nettrace_core::CapturedRecord;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

/// Default bound on the number of queued records
pub const DEFAULT_MAX_QUEUED: usize = 1 << 20;

/// Heap entry; `seq` breaks timestamp ties deterministically
struct Queued {
    record: CapturedRecord,
    seq: u64,
}

impl Queued {
    fn key(&self) -> (SystemTime, u64) {
        (self.record.timestamp(), self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Reversed: BinaryHeap is a max-heap and the oldest record must be on top
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

struct Inner {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

/// Bounded min-heap of records keyed by capture timestamp
pub struct MergeQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    dropped: AtomicU64,
}

impl MergeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a record
    ///
    /// Returns `false` (and counts a drop) when the queue is full.
    pub fn push(&self, record: CapturedRecord) -> bool {
        let mut inner = self.inner.lock();
        if inner.heap.len() >= self.capacity {
            drop(inner);
            self.dropped.fetch_add(1, AtomicOrdering::Relaxed);
            return false;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Queued { record, seq });
        true
    }

    /// Remove the oldest record
    pub fn pop(&self) -> Option<CapturedRecord> {
        self.inner.lock().heap.pop().map(|q| q.record)
    }

    /// Remove the oldest record if it is at least `lag` older than `now`
    ///
    /// A record stamped in the future relative to `now` is never ready.
    pub fn pop_ready(&self, now: SystemTime, lag: Duration) -> Option<CapturedRecord> {
        let mut inner = self.inner.lock();
        let ready = inner.heap.peek().is_some_and(|oldest| {
            now.duration_since(oldest.record.timestamp())
                .is_ok_and(|age| age >= lag)
        });
        if ready {
            inner.heap.pop().map(|q| q.record)
        } else {
            None
        }
    }

    /// Timestamp of the oldest queued record
    pub fn peek_oldest_timestamp(&self) -> Option<SystemTime> {
        self.inner.lock().heap.peek().map(|q| q.record.timestamp())
    }

    /// Remove every record, oldest first
    pub fn drain(&self) -> Vec<CapturedRecord> {
        let heap = std::mem::take(&mut self.inner.lock().heap);
        heap.into_sorted_vec()
            .into_iter()
            .rev()
            .map(|q| q.record)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records rejected because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(AtomicOrdering::Relaxed)
    }
}

impl Default for MergeQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn record(secs: u64, interface: u32) -> CapturedRecord {
        CapturedRecord::new(at(secs), vec![secs as u8]).on_interface(interface)
    }

    #[test]
    fn test_pops_oldest_first() {
        let queue = MergeQueue::default();
        for secs in [4, 1, 2, 3] {
            assert!(queue.push(record(secs, 0)));
        }

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.pop().unwrap().timestamp(), at(1));
        assert_eq!(queue.pop().unwrap().timestamp(), at(2));
        assert_eq!(queue.peek_oldest_timestamp(), Some(at(3)));
        assert_eq!(queue.pop().unwrap().timestamp(), at(3));
        assert_eq!(queue.pop().unwrap().timestamp(), at(4));
        assert_eq!(queue.len(), 0);
        assert!(queue.pop().is_none());
        assert!(queue.peek_oldest_timestamp().is_none());
    }

    #[test]
    fn test_equal_timestamps_keep_push_order() {
        let queue = MergeQueue::default();
        queue.push(record(7, 2));
        queue.push(record(7, 0));
        queue.push(record(7, 1));

        let order: Vec<u32> = queue.drain().iter().map(|r| r.interface_index()).collect();
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn test_pop_ready_respects_lag() {
        let queue = MergeQueue::default();
        queue.push(record(10, 0));
        queue.push(record(12, 0));

        let lag = Duration::from_secs(1);
        assert!(queue.pop_ready(at(10), lag).is_none());
        assert_eq!(queue.pop_ready(at(11), lag).unwrap().timestamp(), at(10));
        assert!(queue.pop_ready(at(12), lag).is_none());
        // Records from the future are never ready
        assert!(queue.pop_ready(at(5), lag).is_none());
        assert_eq!(queue.pop_ready(at(13), lag).unwrap().timestamp(), at(12));
    }

    #[test]
    fn test_full_queue_drops_new_records() {
        let queue = MergeQueue::new(2);
        assert!(queue.push(record(3, 0)));
        assert!(queue.push(record(2, 0)));
        assert!(!queue.push(record(1, 0)));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().unwrap().timestamp(), at(2));
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(MergeQueue::default());
        let handles: Vec<_> = (0..4u64)
            .map(|producer| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..250u64 {
                        queue.push(record(i * 4 + producer, producer as u32));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = queue.drain();
        assert_eq!(drained.len(), 1000);
        assert!(drained
            .windows(2)
            .all(|pair| pair[0].timestamp() <= pair[1].timestamp()));
        assert!(queue.is_empty());
    }
}
