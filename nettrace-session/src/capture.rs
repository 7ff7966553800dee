//! Capture interface wrapper and its read loop
//!
//! Each started source gets a dedicated thread that blocks on
//! [`PacketSource::read`] and pushes every record, tagged with the
//! interface index, into the merge queue. A read error ends only that loop.

use nettrace_capture::{PacketSource, SourceEvent};
use nettrace_core::{Result, StatsAccumulator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

use crate::queue::MergeQueue;
use crate::registry::RegisteredInterface;

/// Records read between two polls of the source's own counters
const STATS_POLL_RECORDS: u64 = 1024;

/// Handle to one running read loop
pub struct CaptureHandle {
    index: u32,
    name: String,
    stop: Arc<AtomicBool>,
    active: Arc<AtomicBool>,
    started_at: SystemTime,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Start the read loop for `interface` on its own thread
    pub(crate) fn spawn(
        mut source: Box<dyn PacketSource>,
        interface: &RegisteredInterface,
        queue: Arc<MergeQueue>,
    ) -> Result<Self> {
        let index = interface.index();
        let name = interface.name().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let active = interface.active.clone();

        let read_loop = ReadLoop {
            index,
            name: name.clone(),
            stop: stop.clone(),
            stats: interface.stats.clone(),
            queue,
        };

        let thread_active = active.clone();
        let spawned = thread::Builder::new()
            .name(format!("capture-{}", index))
            .spawn(move || {
                read_loop.run(source.as_mut());
                source.close();
                thread_active.store(false, Ordering::Release);
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                active.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        info!(interface = %name, index = index, "Capture started");

        Ok(Self {
            index,
            name,
            stop,
            active,
            started_at: SystemTime::now(),
            thread: Some(thread),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Whether the read loop is still running
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Ask the read loop to stop after its current read returns
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop the read loop and wait for it to exit
    ///
    /// Blocks for at most one source read timeout.
    pub fn stop(mut self) {
        self.signal_stop();
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(interface = %self.name, index = self.index, "Capture thread panicked");
                self.active.store(false, Ordering::Release);
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            warn!(
                interface = %self.name,
                index = self.index,
                "Capture handle dropped while running, stopping"
            );
            self.signal_stop();
            self.join();
        }
    }
}

/// State owned by one read loop thread
struct ReadLoop {
    index: u32,
    name: String,
    stop: Arc<AtomicBool>,
    stats: StatsAccumulator,
    queue: Arc<MergeQueue>,
}

impl ReadLoop {
    fn run(&self, source: &mut dyn PacketSource) {
        let mut since_poll = 0u64;

        while !self.stop.load(Ordering::Acquire) {
            match source.read() {
                Ok(SourceEvent::Record(record)) => {
                    let record = record.on_interface(self.index);
                    self.stats.record_packet(record.captured_length() as usize);
                    if !self.queue.push(record) {
                        self.stats.record_drops(1);
                    }

                    since_poll += 1;
                    if since_poll >= STATS_POLL_RECORDS {
                        self.poll_stats(source);
                        since_poll = 0;
                    }
                }
                Ok(SourceEvent::Idle) => {
                    self.poll_stats(source);
                    since_poll = 0;
                }
                Ok(SourceEvent::EndOfStream) => {
                    debug!(interface = %self.name, index = self.index, "Source ended");
                    break;
                }
                Err(e) => {
                    error!(
                        interface = %self.name,
                        index = self.index,
                        error = %e,
                        "Read failed, stopping capture"
                    );
                    break;
                }
            }
        }

        self.poll_stats(source);
        info!(
            interface = %self.name,
            index = self.index,
            received = self.stats.packets_received(),
            dropped = self.stats.packets_dropped(),
            "Capture stopped"
        );
    }

    fn poll_stats(&self, source: &mut dyn PacketSource) {
        match source.stats() {
            Ok(stats) => self.stats.observe_source(stats),
            Err(e) => debug!(interface = %self.name, error = %e, "Failed to read source stats"),
        }
    }
}
