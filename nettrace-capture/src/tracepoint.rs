//! Adapter presenting a channel of trace events as a packet source
//!
//! Trace events become records with link type [`LinkType::TRACEPOINT`], so
//! they interleave with real packets in one time-ordered stream. Nothing
//! downstream of the source knows the difference.

use nettrace_core::{CapturedRecord, LinkType, Result, SourceStats};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, SystemTime};

use crate::source::{PacketSource, SourceEvent};

/// Default time a read waits for an event before reporting idle
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An event that can travel through a tracepoint source
///
/// The event type owns its serialization format.
pub trait TraceRecord: Send {
    /// When the event happened
    fn timestamp(&self) -> SystemTime;

    /// Serialized form stored as the record payload
    fn to_bytes(&self) -> Result<Vec<u8>>;
}

/// Packet source reading trace events from an in-process channel
pub struct TracepointSource<E> {
    receiver: Receiver<E>,
    poll_interval: Duration,
    received: u64,
    closed: bool,
}

impl<E: TraceRecord> TracepointSource<E> {
    /// Wrap a channel; the stream ends when every sender is dropped
    pub fn new(receiver: Receiver<E>) -> Self {
        Self {
            receiver,
            poll_interval: DEFAULT_POLL_INTERVAL,
            received: 0,
            closed: false,
        }
    }

    /// Set how long a read waits before reporting idle
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl<E: TraceRecord> PacketSource for TracepointSource<E> {
    fn link_type(&self) -> LinkType {
        LinkType::TRACEPOINT
    }

    fn snapshot_length(&self) -> u32 {
        // Events are never truncated
        0
    }

    fn read(&mut self) -> Result<SourceEvent> {
        if self.closed {
            return Ok(SourceEvent::EndOfStream);
        }

        match self.receiver.recv_timeout(self.poll_interval) {
            Ok(event) => {
                let payload = event.to_bytes()?;
                self.received += 1;
                Ok(SourceEvent::Record(CapturedRecord::new(event.timestamp(), payload)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(SourceEvent::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(SourceEvent::EndOfStream),
        }
    }

    fn stats(&mut self) -> Result<SourceStats> {
        // An in-process channel never loses events
        Ok(SourceStats {
            received: self.received,
            dropped: 0,
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
