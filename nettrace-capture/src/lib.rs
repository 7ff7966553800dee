//! Packet sources for nettrace
//!
//! This crate provides everything that produces records for a capture
//! session: live pcap captures on network interfaces and synthetic
//! tracepoint feeds carrying application trace events.
//!
//! ## Features
//!
//! - **Packet Sources**: One [`PacketSource`] contract for real and synthetic feeds
//! - **Filters**: libpcap expressions or pre-compiled classic BPF programs
//! - **Tracepoints**: Explicit [`Tracer`] handles whose events share the packet timeline
//!
//! ## Example
//!
//! ```no_run
//! use nettrace_capture::{CaptureConfig, FilterProgram, PacketSource, PcapSource, SourceEvent};
//! use nettrace_core::InterfaceRef;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CaptureConfig::default().with_filter(FilterProgram::expression("icmp"));
//! let mut source = PcapSource::open(&InterfaceRef::new("h1", "veth0"), &config)?;
//!
//! if let SourceEvent::Record(record) = source.read()? {
//!     println!("Got record: {} bytes", record.captured_length());
//! }
//!
//! source.close();
//! # Ok(())
//! # }
//! ```

pub mod filters;
pub mod interface;
pub mod pcap_source;
pub mod source;
pub mod tracepoint;
pub mod tracer;

// Re-export main types
pub use filters::{BpfInstruction, FilterProgram};
pub use interface::{capture_interface_names, get_interface, list_interfaces, InterfaceInfo};
pub use pcap_source::{CaptureConfig, PcapSource, DEFAULT_SNAPLEN};
pub use source::{PacketSource, SourceEvent};
pub use tracepoint::{TraceRecord, TracepointSource};
pub use tracer::{TraceEvent, TraceEventKind, Tracer};
