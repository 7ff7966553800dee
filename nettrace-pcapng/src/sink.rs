//! Destinations for encoded pcapng blocks

use std::fmt;
use std::io::{self, Write};

/// Kind of an encoded block handed to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    SectionHeader,
    InterfaceDescription,
    EnhancedPacket,
    InterfaceStatistics,
    DecryptionSecrets,
}

impl BlockKind {
    /// Whether a reader joining mid-stream needs this block to decode later ones
    pub fn is_header(self) -> bool {
        matches!(
            self,
            BlockKind::SectionHeader
                | BlockKind::InterfaceDescription
                | BlockKind::DecryptionSecrets
        )
    }
}

/// Destination receiving every encoded block in release order
pub trait BlockSink: Send {
    /// Write one complete block
    fn write_block(&mut self, kind: BlockKind, bytes: &[u8]) -> io::Result<()>;

    /// Flush buffered data
    fn flush(&mut self) -> io::Result<()>;
}

/// Block sink over any byte writer (file, named pipe, socket, buffer)
pub struct WriterSink<W> {
    name: String,
    inner: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new<S: Into<String>>(name: S, inner: W) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> BlockSink for WriterSink<W> {
    fn write_block(&mut self, _kind: BlockKind, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W> fmt::Debug for WriterSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterSink").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_kinds() {
        assert!(BlockKind::SectionHeader.is_header());
        assert!(BlockKind::InterfaceDescription.is_header());
        assert!(BlockKind::DecryptionSecrets.is_header());
        assert!(!BlockKind::EnhancedPacket.is_header());
        assert!(!BlockKind::InterfaceStatistics.is_header());
    }

    #[test]
    fn test_writer_sink_appends() {
        let mut sink = WriterSink::new("buffer", Vec::new());
        sink.write_block(BlockKind::SectionHeader, b"abc").unwrap();
        sink.write_block(BlockKind::EnhancedPacket, b"def").unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.name(), "buffer");
        assert_eq!(sink.into_inner(), b"abcdef");
    }
}
