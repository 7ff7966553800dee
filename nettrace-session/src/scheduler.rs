//! Flush scheduler
//!
//! The single owner of the trace writer. On every release tick it first
//! applies pending commands (interface registrations, secrets), then
//! releases queued records that are older than the lag tolerance. On every
//! statistics tick it writes one statistics block per interface. On stop it
//! drains the whole queue regardless of age, writes final statistics and
//! flushes.

use nettrace_core::{CapturedRecord, Error, InterfaceDescriptor, Result};
use nettrace_pcapng::{SecretsKind, TraceWriter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::queue::MergeQueue;
use crate::registry::InterfaceRegistry;
use crate::sink::RecordSink;

/// Default period of the release timer
pub const DEFAULT_RELEASE_INTERVAL: Duration = Duration::from_secs(1);

/// Default minimum age of a record before it is released
pub const DEFAULT_LAG_TOLERANCE: Duration = Duration::from_secs(1);

/// Default period of the statistics timer
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Work handed to the scheduler from other threads
#[derive(Debug)]
pub enum Command {
    /// Describe a new interface to the writer
    RegisterInterface(InterfaceDescriptor),
    /// Embed session secrets in the trace
    Secrets(SecretsKind, Vec<u8>),
}

/// Timing of the scheduler
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub release_interval: Duration,
    pub lag_tolerance: Duration,
    pub stats_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            release_interval: DEFAULT_RELEASE_INTERVAL,
            lag_tolerance: DEFAULT_LAG_TOLERANCE,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

/// Counters updated by the scheduler, readable from anywhere
#[derive(Debug, Default)]
pub struct SchedulerCounters {
    released: AtomicU64,
    reordered: AtomicU64,
    write_errors: AtomicU64,
}

impl SchedulerCounters {
    /// Records handed to the writer
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Released records older than the record released before them
    pub fn reordered(&self) -> u64 {
        self.reordered.load(Ordering::Relaxed)
    }

    /// Writer calls that failed
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

pub struct FlushScheduler {
    config: SchedulerConfig,
    queue: Arc<MergeQueue>,
    registry: Arc<InterfaceRegistry>,
    writer: Box<dyn TraceWriter>,
    record_sinks: Vec<RecordSink>,
    counters: Arc<SchedulerCounters>,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Interfaces whose registration has been handed to the writer
    described: u32,
    last_released: Option<SystemTime>,
}

impl FlushScheduler {
    pub fn new(
        config: SchedulerConfig,
        queue: Arc<MergeQueue>,
        registry: Arc<InterfaceRegistry>,
        writer: Box<dyn TraceWriter>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            config,
            queue,
            registry,
            writer,
            record_sinks: Vec::new(),
            counters: Arc::new(SchedulerCounters::default()),
            commands,
            described: 0,
            last_released: None,
        }
    }

    /// Also deliver every released record to `sink`
    pub fn with_record_sink(mut self, sink: RecordSink) -> Self {
        self.record_sinks.push(sink);
        self
    }

    pub fn counters(&self) -> Arc<SchedulerCounters> {
        self.counters.clone()
    }

    /// Run on the current tokio runtime until stopped
    pub fn spawn(self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let counters = self.counters.clone();
        let task = tokio::spawn(self.run(stop_rx));
        SchedulerHandle {
            stop: Some(stop_tx),
            task: Some(task),
            counters,
        }
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) -> Result<()> {
        let mut release = interval(self.config.release_interval);
        release.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = interval(self.config.stats_interval);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first statistics tick fires immediately; skip it
        stats.tick().await;

        debug!(
            release_interval = ?self.config.release_interval,
            lag_tolerance = ?self.config.lag_tolerance,
            stats_interval = ?self.config.stats_interval,
            "Flush scheduler started"
        );

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = release.tick() => {
                    self.apply_commands();
                    if self.release_ready(SystemTime::now()) > 0 {
                        self.flush_quietly();
                    }
                }
                _ = stats.tick() => {
                    self.apply_commands();
                    self.write_stats(SystemTime::now());
                    self.flush_quietly();
                }
            }
        }

        self.finish(SystemTime::now())
    }

    /// Apply every pending command
    pub(crate) fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }

    /// Apply pending commands if interface `index` is not described yet
    ///
    /// An interface can be registered between the start of a tick and the
    /// release of its first record; its announcement is already queued by
    /// then.
    fn ensure_described(&mut self, index: u32) {
        if index >= self.described {
            self.apply_commands();
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::RegisterInterface(desc) => {
                self.described = self.described.max(desc.index + 1);
                match self.writer.register_interface(&desc) {
                    Ok(index) => {
                        debug!(interface = %desc.name, index = index, "Interface described in trace")
                    }
                    Err(e) => {
                        self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                        error!(interface = %desc.name, error = %e, "Failed to register interface");
                    }
                }
            }
            Command::Secrets(kind, secrets) => {
                if let Err(e) = self.writer.write_secrets(kind, &secrets) {
                    self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                    error!(kind = %kind, error = %e, "Failed to write secrets");
                }
            }
        }
    }

    /// Release every record at least the lag tolerance older than `now`
    pub(crate) fn release_ready(&mut self, now: SystemTime) -> usize {
        let mut released = 0;
        while let Some(record) = self.queue.pop_ready(now, self.config.lag_tolerance) {
            self.deliver(record);
            released += 1;
        }
        released
    }

    /// Release everything regardless of age
    pub(crate) fn drain(&mut self) -> usize {
        let records = self.queue.drain();
        let count = records.len();
        for record in records {
            self.deliver(record);
        }
        count
    }

    fn deliver(&mut self, record: CapturedRecord) {
        let timestamp = record.timestamp();
        match self.last_released {
            Some(last) if timestamp < last => {
                self.counters.reordered.fetch_add(1, Ordering::Relaxed);
                warn!(
                    index = record.interface_index(),
                    behind = ?last.duration_since(timestamp).unwrap_or_default(),
                    "Record released out of order"
                );
            }
            _ => self.last_released = Some(timestamp),
        }

        self.ensure_described(record.interface_index());
        if let Err(e) = self.writer.write_packet(&record) {
            self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
            error!(index = record.interface_index(), error = %e, "Failed to write record");
        }
        self.counters.released.fetch_add(1, Ordering::Relaxed);

        for sink in &self.record_sinks {
            sink.deliver(&record);
        }
    }

    /// Write one statistics block per registered interface
    pub(crate) fn write_stats(&mut self, now: SystemTime) {
        for (index, stats) in self.registry.snapshot_all(now) {
            self.ensure_described(index);
            if let Err(e) = self.writer.write_interface_stats(index, &stats) {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                error!(index = index, error = %e, "Failed to write interface statistics");
            }
        }
    }

    fn flush_quietly(&mut self) {
        if let Err(e) = self.writer.flush() {
            self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "Failed to flush trace writer");
        }
    }

    /// Final drain; the flush result goes back to whoever closed the session
    pub(crate) fn finish(&mut self, now: SystemTime) -> Result<()> {
        self.commands.close();
        self.apply_commands();
        let drained = self.drain();
        self.write_stats(now);

        info!(
            drained = drained,
            released = self.counters.released(),
            reordered = self.counters.reordered(),
            write_errors = self.counters.write_errors(),
            "Flush scheduler stopped"
        );
        self.writer.flush()
    }
}

/// Control handle of a spawned [`FlushScheduler`]
pub struct SchedulerHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
    counters: Arc<SchedulerCounters>,
}

impl SchedulerHandle {
    pub fn counters(&self) -> &Arc<SchedulerCounters> {
        &self.counters
    }

    /// Stop the scheduler and wait for the final drain and flush
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            // The task may already be gone; joining reports why
            let _ = stop.send(());
        }

        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::writer(format!("flush scheduler failed: {}", e)))?,
            None => Err(Error::AlreadyClosed),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingWriter;
    use super::*;
    use nettrace_core::{LinkType, SourceStats};
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    struct Fixture {
        scheduler: FlushScheduler,
        writer: RecordingWriter,
        queue: Arc<MergeQueue>,
        registry: Arc<InterfaceRegistry>,
        commands: mpsc::UnboundedSender<Command>,
    }

    fn fixture(writer: RecordingWriter) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(MergeQueue::default());
        let registry = Arc::new(InterfaceRegistry::new());
        let scheduler = FlushScheduler::new(
            SchedulerConfig::default(),
            queue.clone(),
            registry.clone(),
            Box::new(writer.clone()),
            rx,
        );
        Fixture {
            scheduler,
            writer,
            queue,
            registry,
            commands: tx,
        }
    }

    fn push(queue: &MergeQueue, secs: u64, index: u32) {
        queue.push(CapturedRecord::new(at(secs), vec![0u8; 8]).on_interface(index));
    }

    #[test]
    fn test_release_waits_for_lag_tolerance() {
        let mut f = fixture(RecordingWriter::default());
        f.registry
            .register("h1/eth0", LinkType::ETHERNET, 1600, &f.commands)
            .unwrap();
        for secs in [100, 101, 102] {
            push(&f.queue, secs, 0);
        }

        f.scheduler.apply_commands();
        assert_eq!(f.scheduler.release_ready(at(101)), 1);
        assert_eq!(f.scheduler.release_ready(at(101)), 0);
        assert_eq!(f.scheduler.release_ready(at(103)), 2);

        assert_eq!(f.writer.packet_seconds(), vec![100, 101, 102]);
        assert_eq!(f.scheduler.counters().released(), 3);
    }

    #[test]
    fn test_registration_precedes_packets() {
        let mut f = fixture(RecordingWriter::default());
        f.registry
            .register("h1/eth0", LinkType::ETHERNET, 1600, &f.commands)
            .unwrap();
        push(&f.queue, 5, 0);

        f.scheduler.apply_commands();
        f.scheduler.release_ready(at(60));

        assert_eq!(f.writer.recorded.lock().interfaces.len(), 1);
        assert_eq!(f.scheduler.counters().write_errors(), 0);
    }

    #[test]
    fn test_interface_registered_mid_tick_is_described_first() {
        let mut f = fixture(RecordingWriter::default());

        // The tick has already looked for commands when the interface shows up
        f.scheduler.apply_commands();
        f.registry
            .register("h1/eth0", LinkType::ETHERNET, 1600, &f.commands)
            .unwrap();
        push(&f.queue, 5, 0);

        assert_eq!(f.scheduler.release_ready(at(60)), 1);
        assert_eq!(f.writer.packet_seconds(), vec![5]);
        assert_eq!(f.scheduler.counters().write_errors(), 0);

        f.registry
            .register("h2/eth0", LinkType::ETHERNET, 1600, &f.commands)
            .unwrap();
        f.scheduler.write_stats(at(60));

        let recorded = f.writer.recorded.lock();
        assert_eq!(recorded.interfaces.len(), 2);
        assert_eq!(recorded.stats.len(), 2);
        assert_eq!(f.scheduler.counters().write_errors(), 0);
    }

    #[test]
    fn test_late_record_counted_as_reordered() {
        let mut f = fixture(RecordingWriter::default());
        f.registry
            .register("h1/eth0", LinkType::ETHERNET, 1600, &f.commands)
            .unwrap();
        f.scheduler.apply_commands();

        push(&f.queue, 10, 0);
        f.scheduler.release_ready(at(20));
        push(&f.queue, 9, 0);
        f.scheduler.release_ready(at(20));

        assert_eq!(f.writer.packet_seconds(), vec![10, 9]);
        assert_eq!(f.scheduler.counters().reordered(), 1);
    }

    #[test]
    fn test_writer_errors_do_not_stop_release() {
        let mut f = fixture(RecordingWriter::failing_packets());
        f.registry
            .register("h1/eth0", LinkType::ETHERNET, 1600, &f.commands)
            .unwrap();
        f.scheduler.apply_commands();
        push(&f.queue, 1, 0);
        push(&f.queue, 2, 0);

        assert_eq!(f.scheduler.release_ready(at(60)), 2);
        assert_eq!(f.scheduler.counters().write_errors(), 2);
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_finish_drains_and_flushes() {
        let mut f = fixture(RecordingWriter::default());
        let registration = f
            .registry
            .register("h1/eth0", LinkType::ETHERNET, 1600, &f.commands)
            .unwrap();
        registration.interface.stats.observe_source(SourceStats {
            received: 2,
            dropped: 1,
        });
        f.commands
            .send(Command::Secrets(SecretsKind::TlsKeyLog, b"CLIENT_RANDOM x y\n".to_vec()))
            .unwrap();
        push(&f.queue, 50, 0);
        push(&f.queue, 49, 0);

        // Records newer than now are drained too
        f.scheduler.finish(at(0)).unwrap();

        let recorded = f.writer.recorded.lock();
        assert_eq!(recorded.packets.len(), 2);
        assert_eq!(recorded.secrets.len(), 1);
        assert_eq!(recorded.stats.len(), 1);
        assert_eq!(recorded.stats[0].1.received, 2);
        assert_eq!(recorded.stats[0].1.dropped, 1);
        assert_eq!(recorded.flushes, 1);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_scheduler_stops_with_final_drain() {
        let f = fixture(RecordingWriter::default());
        f.registry
            .register("h1/eth0", LinkType::ETHERNET, 1600, &f.commands)
            .unwrap();
        let now = SystemTime::now();
        f.queue
            .push(CapturedRecord::new(now, vec![1u8; 8]).on_interface(0));

        let mut handle = f.scheduler.spawn();
        handle.stop().await.unwrap();

        assert_eq!(f.writer.recorded.lock().packets.len(), 1);
        assert!(f.writer.recorded.lock().flushes >= 1);
        assert_eq!(handle.counters().released(), 1);
        assert!(matches!(handle.stop().await, Err(Error::AlreadyClosed)));
    }
}
