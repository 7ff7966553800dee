//! Trace container writer
//!
//! [`TraceWriter`] is the contract the flush scheduler drives. None of its
//! methods are safe for concurrent use; a session owns exactly one writer
//! and calls it from one task.

use nettrace_core::{CapturedRecord, Error, InterfaceDescriptor, InterfaceStats, Result};
use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketBlock;
use pcap_file::pcapng::blocks::interface_description::{
    InterfaceDescriptionBlock, InterfaceDescriptionOption,
};
use pcap_file::pcapng::blocks::interface_statistics::{
    InterfaceStatisticsBlock, InterfaceStatisticsOption,
};
use pcap_file::pcapng::blocks::section_header::{SectionHeaderBlock, SectionHeaderOption};
use pcap_file::pcapng::blocks::unknown::UnknownBlock;
use pcap_file::pcapng::{Block, PcapNgWriter as BlockEncoder};
use pcap_file::{DataLink, Endianness};
use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::secrets::{encode_secrets_body, SecretsKind};
use crate::sink::{BlockKind, BlockSink};

/// pcapng block type of decryption secrets blocks
pub const DECRYPTION_SECRETS_BLOCK_TYPE: u32 = 0x0000_000A;

/// `if_tsresol` of every interface: 10^-9 s, the unit pcap-file encodes
/// packet timestamps in
const NANOSECOND_RESOLUTION: u8 = 9;

/// Consumer of released records, in release order
pub trait TraceWriter: Send {
    /// Describe a new interface; returns the index the container assigned
    fn register_interface(&mut self, desc: &InterfaceDescriptor) -> Result<u32>;

    /// Append one packet record
    fn write_packet(&mut self, record: &CapturedRecord) -> Result<()>;

    /// Append a statistics snapshot of one interface
    fn write_interface_stats(&mut self, index: u32, stats: &InterfaceStats) -> Result<()>;

    /// Append session secrets needed to decrypt captured traffic
    fn write_secrets(&mut self, kind: SecretsKind, secrets: &[u8]) -> Result<()>;

    /// Flush everything written so far to the underlying sinks
    fn flush(&mut self) -> Result<()>;
}

/// Contents of the section header
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// Name of the application writing the trace
    pub application: String,
    /// Free-text comment
    pub comment: Option<String>,
    /// Operating system description
    pub os: Option<String>,
    /// Hardware description
    pub hardware: Option<String>,
}

impl SectionInfo {
    pub fn new<S: Into<String>>(application: S) -> Self {
        Self {
            application: application.into(),
            comment: None,
            os: Some(std::env::consts::OS.to_string()),
            hardware: None,
        }
    }

    pub fn with_comment<S: Into<String>>(mut self, comment: S) -> Self {
        self.comment = Some(comment.into());
        self
    }

    fn to_block(&self) -> SectionHeaderBlock<'static> {
        let mut options = vec![SectionHeaderOption::UserApplication(Cow::Owned(
            self.application.clone(),
        ))];
        if let Some(comment) = &self.comment {
            options.push(SectionHeaderOption::Comment(Cow::Owned(comment.clone())));
        }
        if let Some(os) = &self.os {
            options.push(SectionHeaderOption::OS(Cow::Owned(os.clone())));
        }
        if let Some(hardware) = &self.hardware {
            options.push(SectionHeaderOption::Hardware(Cow::Owned(hardware.clone())));
        }

        SectionHeaderBlock {
            endianness: Endianness::Little,
            options,
            ..Default::default()
        }
    }
}

/// [`TraceWriter`] producing a pcapng stream on a set of block sinks
///
/// Every block is encoded once and handed to all sinks. A failing sink does
/// not prevent the others from receiving the block.
pub struct PcapNgWriter {
    encoder: BlockEncoder<Vec<u8>>,
    sinks: Vec<Box<dyn BlockSink>>,
    interfaces: u32,
}

impl PcapNgWriter {
    /// Create a writer and emit the section header to every sink
    pub fn new(section: &SectionInfo, sinks: Vec<Box<dyn BlockSink>>) -> Result<Self> {
        let encoder = BlockEncoder::with_section_header(Vec::new(), section.to_block())
            .map_err(|e| Error::writer(format!("failed to encode section header: {}", e)))?;

        let mut writer = Self {
            encoder,
            sinks,
            interfaces: 0,
        };
        writer.emit(BlockKind::SectionHeader)?;

        debug!(
            application = %section.application,
            sinks = writer.sinks.len(),
            "pcapng writer created"
        );
        Ok(writer)
    }

    /// Add a sink; it only receives blocks written from now on
    pub fn add_sink(&mut self, sink: Box<dyn BlockSink>) {
        self.sinks.push(sink);
    }

    /// Number of interfaces described so far
    pub fn interface_count(&self) -> u32 {
        self.interfaces
    }

    fn write_block(&mut self, kind: BlockKind, block: &Block<'_>) -> Result<()> {
        self.encode(kind, block)?;
        self.emit(kind)
    }

    fn encode(&mut self, kind: BlockKind, block: &Block<'_>) -> Result<()> {
        self.encoder
            .write_block(block)
            .map(|_| ())
            .map_err(|e| Error::writer(format!("failed to encode {:?} block: {}", kind, e)))
    }

    /// Hand the freshly encoded bytes to every sink
    fn emit(&mut self, kind: BlockKind) -> Result<()> {
        let bytes = std::mem::take(self.encoder.get_mut());
        let mut first_error = None;

        for (i, sink) in self.sinks.iter_mut().enumerate() {
            if let Err(e) = sink.write_block(kind, &bytes) {
                warn!(sink = i, error = %e, "Failed to write block to sink");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(Error::writer(format!("sink write failed: {}", e))),
            None => Ok(()),
        }
    }
}

impl TraceWriter for PcapNgWriter {
    fn register_interface(&mut self, desc: &InterfaceDescriptor) -> Result<u32> {
        if desc.index != self.interfaces {
            return Err(Error::writer(format!(
                "interface '{}' registered with index {}, expected {}",
                desc.name, desc.index, self.interfaces
            )));
        }

        let block = InterfaceDescriptionBlock {
            linktype: DataLink::from(desc.link_type.value()),
            snaplen: desc.snapshot_length,
            options: vec![
                InterfaceDescriptionOption::IfName(Cow::Borrowed(desc.name.as_str())),
                InterfaceDescriptionOption::IfTsResol(NANOSECOND_RESOLUTION),
            ],
        };
        self.encode(
            BlockKind::InterfaceDescription,
            &Block::InterfaceDescription(block),
        )?;

        // The encoder knows the interface now, even if a sink fails below
        self.interfaces += 1;
        self.emit(BlockKind::InterfaceDescription)?;
        Ok(desc.index)
    }

    fn write_packet(&mut self, record: &CapturedRecord) -> Result<()> {
        let block = EnhancedPacketBlock {
            interface_id: record.interface_index(),
            timestamp: record.since_epoch(),
            original_len: record.wire_length(),
            data: Cow::Borrowed(record.payload().as_ref()),
            options: vec![],
        };
        self.write_block(BlockKind::EnhancedPacket, &Block::EnhancedPacket(block))
    }

    fn write_interface_stats(&mut self, index: u32, stats: &InterfaceStats) -> Result<()> {
        let timestamp = split_timestamp(stats.last_update);
        let block = InterfaceStatisticsBlock {
            interface_id: index,
            timestamp,
            options: vec![
                InterfaceStatisticsOption::IsbIfRecv(stats.received),
                InterfaceStatisticsOption::IsbIfDrop(stats.dropped),
                InterfaceStatisticsOption::IsbEndTime(timestamp),
            ],
        };
        self.write_block(
            BlockKind::InterfaceStatistics,
            &Block::InterfaceStatistics(block),
        )
    }

    fn write_secrets(&mut self, kind: SecretsKind, secrets: &[u8]) -> Result<()> {
        let body = encode_secrets_body(kind, secrets);
        let block = UnknownBlock {
            type_: DECRYPTION_SECRETS_BLOCK_TYPE,
            length: body.len() as u32 + 12,
            value: Cow::Owned(body),
        };
        self.write_block(BlockKind::DecryptionSecrets, &Block::Unknown(block))
    }

    fn flush(&mut self) -> Result<()> {
        let mut first_error = None;
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.flush() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(Error::writer(format!("flush failed: {}", e))),
            None => Ok(()),
        }
    }
}

/// Nanoseconds since the epoch, with the 32-bit halves swapped
///
/// pcapng stores statistics timestamps as the high word followed by the low
/// word, while pcap-file writes them as one u64 in section byte order. The
/// section is little-endian, so swapping the halves puts the high word first.
fn split_timestamp(time: SystemTime) -> u64 {
    let nanos = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos.rotate_left(32)
}
