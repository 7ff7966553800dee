//! Capture session lifecycle
//!
//! A [`CaptureSession`] owns the merge queue, the interface registry, one
//! read loop per started source and the flush scheduler driving the writer.
//! Closing it stops every read loop, drains whatever is still queued and
//! flushes the writer before returning.

use dashmap::DashMap;
use nettrace_capture::{PacketSource, PcapSource, Tracer};
use nettrace_core::{Error, InterfaceDescriptor, InterfaceRef, InterfaceStats, Result};
use nettrace_listener::LiveListener;
use nettrace_pcapng::{PcapNgWriter, SecretsKind, SectionInfo, TraceWriter};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::CaptureHandle;
use crate::config::SessionConfig;
use crate::keylog::KeyLogPipe;
use crate::queue::MergeQueue;
use crate::registry::{InterfaceRegistry, RegisteredInterface};
use crate::scheduler::{Command, FlushScheduler, SchedulerCounters, SchedulerHandle};
use crate::sink::{OpenedSinks, RecordSink};

/// Point-in-time counters of a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Records waiting in the merge queue
    pub queued: usize,
    /// Records handed to the writer
    pub released: u64,
    /// Released records older than their predecessor
    pub reordered: u64,
    /// Records rejected by a full merge queue
    pub queue_drops: u64,
    /// Failed writer calls
    pub write_errors: u64,
}

/// Summary returned by [`CaptureSession::close`]
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: Uuid,
    pub started_at: SystemTime,
    pub stats: SessionStats,
    /// Final statistics of every interface, in index order
    pub interfaces: Vec<(InterfaceDescriptor, InterfaceStats)>,
}

/// Running capture session
pub struct CaptureSession {
    id: Uuid,
    config: SessionConfig,
    started_at: SystemTime,
    queue: Arc<MergeQueue>,
    registry: Arc<InterfaceRegistry>,
    captures: DashMap<u32, CaptureHandle>,
    commands: mpsc::UnboundedSender<Command>,
    scheduler: tokio::sync::Mutex<SchedulerHandle>,
    counters: Arc<SchedulerCounters>,
    listener: Option<Arc<LiveListener>>,
    /// Serializes source starts against each other and against close
    start_lock: Mutex<()>,
    closed: AtomicBool,
}

impl CaptureSession {
    /// Open a session writing pcapng to the outputs named in `config`
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(mut config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let sinks = OpenedSinks::open(&mut config.sinks, &config.scope).await?;
        let mut section = SectionInfo::new(config.application.clone());
        section.comment = config.comment.clone();
        let writer = PcapNgWriter::new(&section, sinks.blocks)?;

        Self::start(config, Box::new(writer), sinks.records, sinks.listener)
    }

    /// Open a session driving a caller-supplied writer
    ///
    /// Byte outputs in `config` are ignored; record outputs are honoured.
    /// Must be called from within a tokio runtime.
    pub fn with_writer(mut config: SessionConfig, writer: Box<dyn TraceWriter>) -> Result<Self> {
        config.validate()?;

        let mut records = Vec::new();
        if let Some(channel) = config.sinks.to_channel.take() {
            records.push(RecordSink::Channel(channel));
        }
        if let Some(callback) = config.sinks.to_callback.take() {
            records.push(RecordSink::Callback(callback));
        }

        Self::start(config, writer, records, None)
    }

    fn start(
        config: SessionConfig,
        writer: Box<dyn TraceWriter>,
        records: Vec<RecordSink>,
        listener: Option<Arc<LiveListener>>,
    ) -> Result<Self> {
        let id = Uuid::now_v7();
        let queue = Arc::new(MergeQueue::new(config.max_queued));
        let registry = Arc::new(InterfaceRegistry::new());
        let (commands, command_rx) = mpsc::unbounded_channel();

        let mut scheduler = FlushScheduler::new(
            config.scheduler(),
            queue.clone(),
            registry.clone(),
            writer,
            command_rx,
        );
        for sink in records {
            scheduler = scheduler.with_record_sink(sink);
        }
        let counters = scheduler.counters();
        let scheduler = scheduler.spawn();

        info!(
            id = %id,
            application = %config.application,
            lag_tolerance = ?config.lag_tolerance,
            "Capture session opened"
        );

        Ok(Self {
            id,
            config,
            started_at: SystemTime::now(),
            queue,
            registry,
            captures: DashMap::new(),
            commands,
            scheduler: tokio::sync::Mutex::new(scheduler),
            counters,
            listener,
            start_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    /// Start capturing on one interface of a node
    ///
    /// The interface is registered as `"<node>/<interface>"`.
    pub fn start_interface(&self, interface: &InterfaceRef) -> Result<u32> {
        self.ensure_open()?;
        let source = PcapSource::open(interface, &self.config.capture)?;
        self.start_source(&interface.qualified_name(), Box::new(source))
    }

    /// Start capturing on several interfaces of one node
    ///
    /// Stops at the first interface that cannot be opened; captures started
    /// before it keep running.
    pub fn start_interfaces<S: AsRef<str>>(&self, node: &str, names: &[S]) -> Result<Vec<u32>> {
        names
            .iter()
            .map(|name| self.start_interface(&InterfaceRef::new(node, name.as_ref())))
            .collect()
    }

    /// Start a read loop for an already opened source
    ///
    /// Returns the interface index. A name seen before in this session keeps
    /// its index, provided its previous capture has stopped.
    pub fn start_source(&self, name: &str, source: Box<dyn PacketSource>) -> Result<u32> {
        self.ensure_open()?;
        let _guard = self.start_lock.lock();
        // close may have won the lock while this call waited for it
        self.ensure_open()?;

        let registration = self.registry.register(
            name,
            source.link_type(),
            source.snapshot_length(),
            &self.commands,
        )?;
        let index = registration.interface.index();

        // A finished read loop may still sit in the map
        if let Some((_, previous)) = self.captures.remove(&index) {
            previous.stop();
        }

        let handle = CaptureHandle::spawn(source, &registration.interface, self.queue.clone())?;
        self.captures.insert(index, handle);

        if registration.reused {
            info!(id = %self.id, interface = %name, index = index, "Capture restarted");
        }
        Ok(index)
    }

    /// Start a tracer whose events join the merged stream under `name`
    pub fn start_tracer(&self, name: &str) -> Result<Tracer> {
        let (tracer, source) = Tracer::start();
        self.start_source(name, Box::new(source))?;
        Ok(tracer)
    }

    /// Stop the capture of interface `index` and wait for its read loop
    ///
    /// Records it already queued are still released.
    pub async fn stop_interface(&self, index: u32) -> Result<()> {
        let (_, handle) = self
            .captures
            .remove(&index)
            .ok_or_else(|| Error::NotFound(format!("no capture on interface {}", index)))?;

        tokio::task::spawn_blocking(move || handle.stop())
            .await
            .map_err(|e| Error::capture(format!("failed to stop capture {}: {}", index, e)))?;
        debug!(id = %self.id, index = index, "Capture stopped");
        Ok(())
    }

    /// Create a key-log pipe for a child process
    ///
    /// Requires `log_keys` in the sink configuration.
    pub fn key_log_pipe(&self, kind: SecretsKind) -> Result<KeyLogPipe> {
        self.ensure_open()?;
        if !self.config.sinks.log_keys {
            return Err(Error::invalid_config("log_keys", "key logging is disabled"));
        }
        KeyLogPipe::open(kind, self.commands.clone())
    }

    /// Registered interfaces in index order
    pub fn interfaces(&self) -> Vec<InterfaceDescriptor> {
        self.registry.descriptors()
    }

    /// Registration and statistics of one interface
    pub fn interface(&self, index: u32) -> Option<RegisteredInterface> {
        self.registry.get(index)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            queued: self.queue.len(),
            released: self.counters.released(),
            reordered: self.counters.reordered(),
            queue_drops: self.queue.dropped(),
            write_errors: self.counters.write_errors(),
        }
    }

    /// Live listener of this session, if one was configured
    pub fn listener(&self) -> Option<&Arc<LiveListener>> {
        self.listener.as_ref()
    }

    /// Stop every capture, drain the queue and flush the writer
    ///
    /// Returns only after the final flush; its failure is returned here.
    /// A second call returns [`Error::AlreadyClosed`].
    pub async fn close(&self) -> Result<SessionReport> {
        // Once closed is set under the start lock, no start can add a capture
        let handles: Vec<CaptureHandle> = {
            let _guard = self.start_lock.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(Error::AlreadyClosed);
            }

            info!(id = %self.id, captures = self.captures.len(), "Closing capture session");

            let indices: Vec<u32> = self.captures.iter().map(|entry| *entry.key()).collect();
            indices
                .into_iter()
                .filter_map(|index| self.captures.remove(&index).map(|(_, h)| h))
                .collect()
        };
        for handle in &handles {
            handle.signal_stop();
        }
        let joined =
            tokio::task::spawn_blocking(move || handles.into_iter().for_each(CaptureHandle::stop));
        if let Err(e) = joined.await {
            error!(id = %self.id, error = %e, "Failed to join capture threads");
        }

        let flushed = self.scheduler.lock().await.stop().await;

        if let Some(listener) = &self.listener {
            listener.close();
        }

        let now = SystemTime::now();
        let interfaces = self
            .registry
            .descriptors()
            .into_iter()
            .zip(self.registry.snapshot_all(now))
            .map(|(desc, (_, stats))| (desc, stats))
            .collect();
        let stats = self.stats();

        match &flushed {
            Ok(()) => info!(
                id = %self.id,
                released = stats.released,
                reordered = stats.reordered,
                queue_drops = stats.queue_drops,
                "Capture session closed"
            ),
            Err(e) => warn!(id = %self.id, error = %e, "Capture session closed with flush error"),
        }
        flushed?;

        Ok(SessionReport {
            id: self.id,
            started_at: self.started_at,
            stats,
            interfaces,
        })
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!(id = %self.id, "Capture session dropped without close");
            for entry in self.captures.iter() {
                entry.value().signal_stop();
            }
        }
    }
}
