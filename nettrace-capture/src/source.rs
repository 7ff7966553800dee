//! Packet source contract

use nettrace_core::{CapturedRecord, LinkType, Result, SourceStats};

/// Outcome of one blocking read on a packet source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A record was captured
    Record(CapturedRecord),
    /// The read timed out without data; the caller may check for cancellation
    Idle,
    /// The source will never produce another record
    EndOfStream,
}

/// Anything that yields timestamped byte records on demand
///
/// A source is driven by exactly one read loop. `read` must return within a
/// bounded time (yielding [`SourceEvent::Idle`] when nothing arrived) so the
/// loop can observe cancellation.
pub trait PacketSource: Send {
    /// Link-layer type of the records this source produces
    fn link_type(&self) -> LinkType;

    /// Maximum number of bytes captured per record
    fn snapshot_length(&self) -> u32;

    /// Block until the next record, a timeout, or end of stream
    fn read(&mut self) -> Result<SourceEvent>;

    /// Counters maintained by the source
    fn stats(&mut self) -> Result<SourceStats>;

    /// Release the underlying handle
    ///
    /// Reads after `close` return [`SourceEvent::EndOfStream`].
    fn close(&mut self);
}

impl<S: PacketSource + ?Sized> PacketSource for Box<S> {
    fn link_type(&self) -> LinkType {
        (**self).link_type()
    }

    fn snapshot_length(&self) -> u32 {
        (**self).snapshot_length()
    }

    fn read(&mut self) -> Result<SourceEvent> {
        (**self).read()
    }

    fn stats(&mut self) -> Result<SourceStats> {
        (**self).stats()
    }

    fn close(&mut self) {
        (**self).close()
    }
}
