//! Captured record type

use bytes::Bytes;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A timestamped record produced by a packet source
///
/// Records are immutable once created. The interface index is assigned by
/// the capture session when the record enters the merge queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRecord {
    timestamp: SystemTime,
    wire_length: u32,
    interface_index: u32,
    payload: Bytes,
}

impl CapturedRecord {
    /// Create a record whose wire length equals the payload length
    pub fn new(timestamp: SystemTime, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let wire_length = payload.len() as u32;
        Self {
            timestamp,
            wire_length,
            interface_index: 0,
            payload,
        }
    }

    /// Create a record from a possibly truncated capture
    ///
    /// `wire_length` is the length of the frame on the wire; it is never
    /// reported smaller than the captured payload.
    pub fn truncated(timestamp: SystemTime, payload: impl Into<Bytes>, wire_length: u32) -> Self {
        let payload = payload.into();
        let wire_length = wire_length.max(payload.len() as u32);
        Self {
            timestamp,
            wire_length,
            interface_index: 0,
            payload,
        }
    }

    /// Return the same record tagged with the interface it was captured on
    pub fn on_interface(mut self, index: u32) -> Self {
        self.interface_index = index;
        self
    }

    /// Capture timestamp
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Capture timestamp as an offset from the Unix epoch
    ///
    /// Timestamps before the epoch are clamped to zero.
    pub fn since_epoch(&self) -> Duration {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }

    /// Length of the frame on the wire
    pub fn wire_length(&self) -> u32 {
        self.wire_length
    }

    /// Number of bytes actually captured
    pub fn captured_length(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Index of the interface this record belongs to
    pub fn interface_index(&self) -> u32 {
        self.interface_index
    }

    /// Captured bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Check if the record carries no bytes
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
