//! Application trace events and the tracer handle that emits them
//!
//! A [`Tracer`] is an explicit handle owned by the component that wants to
//! emit events. Two independently instrumented components each start their
//! own tracer, so their events never share a feed by accident.

use chrono::{DateTime, Utc};
use nettrace_core::{Error, Result};
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

use crate::tracepoint::{TraceRecord, TracepointSource};

/// Kind of a trace event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventKind {
    /// Free-form log message
    Log,
    /// A breakpoint was hit
    Breakpoint,
    /// Application-defined event type
    Custom(String),
}

/// One application-level trace event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: TraceEventKind,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TraceEvent {
    /// Create an event of `kind` stamped with the current time and process
    pub fn new(kind: TraceEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            pid: std::process::id(),
            message: None,
            file: None,
            line: None,
            function: None,
            data: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach the source location that emitted the event
    pub fn with_location<F: Into<String>>(mut self, file: F, line: u32, function: Option<&str>) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self.function = function.map(str::to_string);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Decode an event previously produced by [`TraceRecord::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl TraceRecord for TraceEvent {
    fn timestamp(&self) -> SystemTime {
        self.timestamp.into()
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Handle used to emit trace events into one tracepoint feed
///
/// Clones share the feed. [`Tracer::stop`] ends the feed for every clone:
/// events already emitted are still delivered, later ones are rejected.
#[derive(Debug, Clone)]
pub struct Tracer {
    /// Taken on stop; the source ends once it has drained the channel
    sender: Arc<Mutex<Option<mpsc::Sender<TraceEvent>>>>,
}

impl Tracer {
    /// Start a tracer and return the source that reads its events
    pub fn start() -> (Tracer, TracepointSource<TraceEvent>) {
        let (sender, receiver) = mpsc::channel();
        let tracer = Tracer {
            sender: Arc::new(Mutex::new(Some(sender))),
        };
        (tracer, TracepointSource::new(receiver))
    }

    /// Emit an event
    ///
    /// An accepted event is always read by the source before its stream ends.
    pub fn emit(&self, event: TraceEvent) -> Result<()> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender
                .send(event)
                .map_err(|_| Error::capture("tracepoint source closed")),
            None => Err(Error::capture("tracer stopped")),
        }
    }

    /// Emit a log message
    pub fn log<S: Into<String>>(&self, message: S) -> Result<()> {
        self.emit(TraceEvent::new(TraceEventKind::Log).with_message(message))
    }

    /// Emit a breakpoint hit at the given location
    pub fn breakpoint(&self, file: &str, line: u32, function: Option<&str>) -> Result<()> {
        self.emit(TraceEvent::new(TraceEventKind::Breakpoint).with_location(file, line, function))
    }

    /// Whether [`Tracer::stop`] has been called on any clone
    pub fn is_stopped(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop the tracer
    pub fn stop(self) {
        self.sender.lock().take();
        debug!("Tracer stopped");
    }
}

/// Emit a log event annotated with the caller's source location
///
/// ```no_run
/// # let (tracer, _source) = nettrace_capture::Tracer::start();
/// nettrace_capture::tracepoint!(tracer, "connected to {}", "10.0.0.2");
/// ```
#[macro_export]
macro_rules! tracepoint {
    ($tracer:expr, $($arg:tt)+) => {
        $tracer.emit(
            $crate::TraceEvent::new($crate::TraceEventKind::Log)
                .with_message(format!($($arg)+))
                .with_location(file!(), line!(), Some(module_path!())),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{PacketSource, SourceEvent};

    #[test]
    fn test_event_round_trip() {
        let event = TraceEvent::new(TraceEventKind::Custom("handshake".into()))
            .with_message("client hello")
            .with_data(serde_json::json!({ "peer": "10.0.0.2" }));

        let bytes = event.to_bytes().unwrap();
        let decoded = TraceEvent::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let event = TraceEvent::new(TraceEventKind::Log);
        let json = String::from_utf8(event.to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"kind\":\"log\""));
        assert!(!json.contains("message"));
        assert!(!json.contains("data"));
    }

    #[test]
    fn test_tracer_feeds_source() {
        let (tracer, mut source) = Tracer::start();
        tracer.log("one").unwrap();
        tracer.breakpoint("main.rs", 42, Some("main")).unwrap();

        let mut events = Vec::new();
        while events.len() < 2 {
            if let SourceEvent::Record(record) = source.read().unwrap() {
                events.push(TraceEvent::from_bytes(record.payload()).unwrap());
            }
        }

        assert_eq!(events[0].message.as_deref(), Some("one"));
        assert_eq!(events[1].kind, TraceEventKind::Breakpoint);
        assert_eq!(events[1].line, Some(42));
    }

    #[test]
    fn test_stop_rejects_and_ends_stream() {
        let (tracer, mut source) = Tracer::start();
        let clone = tracer.clone();
        tracer.log("before stop").unwrap();
        tracer.stop();

        assert!(clone.is_stopped());
        assert!(clone.log("after stop").is_err());

        // Pending event is still delivered, then the feed ends
        assert!(matches!(source.read().unwrap(), SourceEvent::Record(_)));
        loop {
            match source.read().unwrap() {
                SourceEvent::EndOfStream => break,
                SourceEvent::Idle => continue,
                SourceEvent::Record(_) => panic!("unexpected record after stop"),
            }
        }
    }

    #[test]
    fn test_every_accepted_event_is_delivered() {
        for _ in 0..20 {
            let (tracer, mut source) = Tracer::start();
            let emitters: Vec<_> = (0..4)
                .map(|_| {
                    let tracer = tracer.clone();
                    std::thread::spawn(move || {
                        let mut accepted = 0usize;
                        while tracer.log("tick").is_ok() {
                            accepted += 1;
                        }
                        accepted
                    })
                })
                .collect();

            std::thread::sleep(std::time::Duration::from_millis(1));
            tracer.stop();
            let accepted: usize = emitters.into_iter().map(|e| e.join().unwrap()).sum();

            let mut delivered = 0usize;
            loop {
                match source.read().unwrap() {
                    SourceEvent::Record(_) => delivered += 1,
                    SourceEvent::Idle => continue,
                    SourceEvent::EndOfStream => break,
                }
            }
            assert_eq!(delivered, accepted);
        }
    }

    #[test]
    fn test_tracepoint_macro_records_location() {
        let (tracer, mut source) = Tracer::start();
        crate::tracepoint!(tracer, "value={}", 7).unwrap();

        let record = loop {
            if let SourceEvent::Record(record) = source.read().unwrap() {
                break record;
            }
        };
        let event = TraceEvent::from_bytes(record.payload()).unwrap();
        assert_eq!(event.message.as_deref(), Some("value=7"));
        assert!(event.file.unwrap().ends_with("tracer.rs"));
    }
}
