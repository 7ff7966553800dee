//! Packet source backed by a live pcap handle

use bytes::Bytes;
use nettrace_core::{CapturedRecord, Error, InterfaceRef, LinkType, Result, SourceStats};
use pcap::{Active, Capture, Device, Precision};
use std::os::fd::AsRawFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use crate::filters::{attach_instructions, FilterProgram};
use crate::interface::get_interface;
use crate::source::{PacketSource, SourceEvent};

/// Default snapshot length (maximum bytes per packet)
pub const DEFAULT_SNAPLEN: u32 = 1600;

/// Default read timeout in milliseconds
///
/// Bounds how long a read loop waits before it can observe cancellation.
pub const DEFAULT_TIMEOUT_MS: i32 = 100;

/// Configuration for one interface capture
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Maximum bytes to capture per packet
    pub snaplen: u32,
    /// Read timeout in milliseconds
    pub timeout_ms: i32,
    /// Enable promiscuous mode
    pub promiscuous: bool,
    /// Kernel buffer size (0 = default)
    pub buffer_size: i32,
    /// Deliver packets immediately instead of batching
    pub immediate_mode: bool,
    /// Filter installed when the capture starts
    pub filter: Option<FilterProgram>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            snaplen: DEFAULT_SNAPLEN,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            promiscuous: false,
            buffer_size: 0,
            immediate_mode: true,
            filter: None,
        }
    }
}

impl CaptureConfig {
    /// Set snapshot length
    pub fn with_snaplen(mut self, snaplen: u32) -> Self {
        self.snaplen = snaplen;
        self
    }

    /// Set promiscuous mode
    pub fn with_promiscuous(mut self, enable: bool) -> Self {
        self.promiscuous = enable;
        self
    }

    /// Set read timeout
    pub fn with_timeout(mut self, timeout_ms: i32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the filter program
    pub fn with_filter(mut self, filter: FilterProgram) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Live capture on one network interface
pub struct PcapSource {
    /// Interface being captured
    interface: InterfaceRef,
    /// Snapshot length the handle was opened with
    snaplen: u32,
    /// Link type reported by libpcap
    link_type: LinkType,
    /// Active pcap handle, `None` once closed
    capture: Option<Capture<Active>>,
}

impl PcapSource {
    /// Open a capture on `interface` in the current network namespace
    pub fn open(interface: &InterfaceRef, config: &CaptureConfig) -> Result<Self> {
        get_interface(&interface.name)?;

        debug!(interface = %interface, "Opening pcap capture");

        let device = Device::from(interface.name.as_str());
        let mut inactive = Capture::from_device(device)
            .map_err(|e| open_error(interface, e))?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen as i32)
            .timeout(config.timeout_ms)
            .immediate_mode(config.immediate_mode)
            .precision(Precision::Nano);

        if config.buffer_size > 0 {
            inactive = inactive.buffer_size(config.buffer_size);
        }

        let mut capture = inactive.open().map_err(|e| open_error(interface, e))?;

        if let Some(filter) = &config.filter {
            install_filter(&mut capture, filter)?;
            debug!(interface = %interface, filter = %filter, "Applied filter");
        }

        let link_type = LinkType(capture.get_datalink().0 as u32);

        info!(
            interface = %interface,
            link_type = %link_type,
            snaplen = config.snaplen,
            "Capture opened"
        );

        Ok(Self {
            interface: interface.clone(),
            snaplen: config.snaplen,
            link_type,
            capture: Some(capture),
        })
    }

    /// Interface being captured
    pub fn interface(&self) -> &InterfaceRef {
        &self.interface
    }
}

impl PacketSource for PcapSource {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn snapshot_length(&self) -> u32 {
        self.snaplen
    }

    fn read(&mut self) -> Result<SourceEvent> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(SourceEvent::EndOfStream);
        };

        match capture.next_packet() {
            Ok(packet) => {
                let timestamp =
                    timestamp_from_parts(packet.header.ts.tv_sec as i64, packet.header.ts.tv_usec as i64);
                Ok(SourceEvent::Record(CapturedRecord::truncated(
                    timestamp,
                    Bytes::copy_from_slice(packet.data),
                    packet.header.len,
                )))
            }
            // Timeout is normal, lets the read loop check for cancellation
            Err(pcap::Error::TimeoutExpired) => Ok(SourceEvent::Idle),
            Err(pcap::Error::NoMorePackets) => Ok(SourceEvent::EndOfStream),
            Err(e) => Err(Error::capture(format!("{}: {}", self.interface, e))),
        }
    }

    fn stats(&mut self) -> Result<SourceStats> {
        let Some(capture) = self.capture.as_mut() else {
            return Err(Error::capture(format!("{}: capture not active", self.interface)));
        };

        let stats = capture
            .stats()
            .map_err(|e| Error::capture(format!("{}: failed to get stats: {}", self.interface, e)))?;

        Ok(SourceStats {
            received: stats.received as u64,
            dropped: stats.dropped as u64 + stats.if_dropped as u64,
        })
    }

    fn close(&mut self) {
        if self.capture.take().is_some() {
            info!(interface = %self.interface, "Capture closed");
        }
    }
}

impl Drop for PcapSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Install a filter on an activated capture
fn install_filter(capture: &mut Capture<Active>, filter: &FilterProgram) -> Result<()> {
    filter.validate()?;

    match filter {
        FilterProgram::Expression(expr) => capture
            .filter(expr, true)
            .map_err(|e| Error::filter_compile(expr.as_str(), e.to_string())),
        FilterProgram::Instructions(instructions) => {
            attach_instructions(capture.as_raw_fd(), instructions)
                .map_err(|e| Error::filter_compile(filter.to_string(), e.to_string()))
        }
    }
}

/// Classify a libpcap open failure
fn open_error(interface: &InterfaceRef, err: pcap::Error) -> Error {
    let message = err.to_string();
    let lower = message.to_lowercase();

    if lower.contains("permission") || lower.contains("not permitted") {
        Error::PermissionDenied(format!("{}: {}", interface, message))
    } else if lower.contains("no such device") {
        Error::InterfaceNotFound(interface.to_string())
    } else {
        Error::OpenFailed(format!("{}: {}", interface, message))
    }
}

/// Convert a nanosecond-precision pcap timestamp into a `SystemTime`
fn timestamp_from_parts(secs: i64, nanos: i64) -> SystemTime {
    let secs = secs.max(0) as u64;
    let nanos = nanos.clamp(0, 999_999_999) as u32;
    UNIX_EPOCH + Duration::new(secs, nanos)
}
