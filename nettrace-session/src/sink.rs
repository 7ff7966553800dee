//! Session outputs
//!
//! Byte outputs (files, named pipes, live listeners) receive the encoded
//! pcapng stream as [`BlockSink`]s. Record outputs (channels, callbacks)
//! receive the released records themselves.

use nettrace_core::{CapturedRecord, Error, Result};
use nettrace_listener::LiveListener;
use nettrace_pcapng::{BlockKind, BlockSink, WriterSink};
use nix::sys::stat::{self, Mode, SFlag};
use nix::unistd::mkfifo;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::config::{CaptureScope, RecordCallback, SinkConfig};

/// Consumer of released records
#[derive(Clone)]
pub enum RecordSink {
    Channel(UnboundedSender<CapturedRecord>),
    Callback(RecordCallback),
}

impl RecordSink {
    pub(crate) fn deliver(&self, record: &CapturedRecord) {
        match self {
            RecordSink::Channel(channel) => {
                if channel.send(record.clone()).is_err() {
                    debug!("Record channel closed, record not delivered");
                }
            }
            RecordSink::Callback(callback) => callback(record),
        }
    }
}

/// Live listener as a block sink
///
/// Header blocks are appended to the listener's preamble so connections
/// joining later can still decode the stream.
///
/// Writes are blocking and run on the flush scheduler's task. A stalled
/// consumer holds that task for at most the listener's write timeout
/// ([`SinkConfig::listener_write_timeout`]) per block, after which the
/// connection is dropped.
pub struct ListenerSink(pub Arc<LiveListener>);

impl BlockSink for ListenerSink {
    fn write_block(&mut self, kind: BlockKind, bytes: &[u8]) -> io::Result<()> {
        if kind.is_header() {
            self.0.append_preamble(bytes);
        } else {
            self.0.broadcast(bytes);
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Outputs opened from a [`SinkConfig`]
pub(crate) struct OpenedSinks {
    pub blocks: Vec<Box<dyn BlockSink>>,
    pub records: Vec<RecordSink>,
    pub listener: Option<Arc<LiveListener>>,
}

impl OpenedSinks {
    /// Open every configured output
    ///
    /// Consumes the open file handle, channel and callback of `config`.
    pub(crate) async fn open(config: &mut SinkConfig, scope: &CaptureScope) -> Result<Self> {
        let mut blocks: Vec<Box<dyn BlockSink>> = Vec::new();
        let mut records = Vec::new();

        if let Some(file) = config.to_file.take() {
            blocks.push(Box::new(WriterSink::new("file", file)));
        }

        if let Some(template) = &config.to_filename {
            let path = scope.render(template)?;
            let file = File::create(&path)
                .map_err(|e| Error::writer(format!("failed to create '{}': {}", path, e)))?;
            info!(path = %path, "Writing trace file");
            blocks.push(Box::new(WriterSink::new(path, BufWriter::new(file))));
        }

        if let Some(path) = config.to_pipe_name.clone() {
            let pipe = tokio::task::spawn_blocking(move || open_pipe(&path))
                .await
                .map_err(|e| Error::writer(format!("pipe open task failed: {}", e)))??;
            blocks.push(Box::new(pipe));
        }

        let listener = match config.listener_address()? {
            Some(address) => {
                let listener = Arc::new(
                    LiveListener::bind_address(address, config.listener_write_timeout).await?,
                );
                blocks.push(Box::new(ListenerSink(listener.clone())));
                Some(listener)
            }
            None => None,
        };

        if let Some(channel) = config.to_channel.take() {
            records.push(RecordSink::Channel(channel));
        }
        if let Some(callback) = config.to_callback.take() {
            records.push(RecordSink::Callback(callback));
        }

        Ok(Self {
            blocks,
            records,
            listener,
        })
    }
}

/// Open a named pipe for writing, creating it first if needed
///
/// Blocks until a reader opens the other end.
pub fn open_pipe(path: &Path) -> Result<WriterSink<File>> {
    match stat::stat(path) {
        Ok(st) => {
            if SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits()) != SFlag::S_IFIFO {
                return Err(Error::invalid_config(
                    "to_pipe_name",
                    format!("'{}' exists and is not a named pipe", path.display()),
                ));
            }
        }
        Err(nix::errno::Errno::ENOENT) => {
            mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
                Error::writer(format!("failed to create pipe '{}': {}", path.display(), e))
            })?;
            debug!(path = %path.display(), "Created named pipe");
        }
        Err(e) => {
            return Err(Error::writer(format!(
                "failed to inspect '{}': {}",
                path.display(),
                e
            )))
        }
    }

    info!(path = %path.display(), "Waiting for pipe reader");
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| Error::writer(format!("failed to open pipe '{}': {}", path.display(), e)))?;
    Ok(WriterSink::new(path.display().to_string(), file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, UNIX_EPOCH};
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    fn record() -> CapturedRecord {
        CapturedRecord::new(UNIX_EPOCH, vec![1, 2, 3])
    }

    #[test]
    fn test_record_sinks_deliver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        RecordSink::Channel(tx).deliver(&record());
        assert_eq!(rx.try_recv().unwrap().payload().as_ref(), &[1, 2, 3]);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sink = RecordSink::Callback(Arc::new(move |_: &CapturedRecord| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        sink.deliver(&record());
        sink.deliver(&record());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        RecordSink::Channel(tx).deliver(&record());
    }

    #[test]
    fn test_pipe_is_created_and_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.pipe");

        let reader_path = path.clone();
        let reader = thread::spawn(move || {
            while !reader_path.exists() {
                thread::sleep(Duration::from_millis(5));
            }
            let mut bytes = Vec::new();
            File::open(&reader_path)
                .unwrap()
                .read_to_end(&mut bytes)
                .unwrap();
            bytes
        });

        let mut sink = open_pipe(&path).unwrap();
        sink.write_block(BlockKind::SectionHeader, b"header").unwrap();
        sink.flush().unwrap();
        drop(sink);

        assert_eq!(reader.join().unwrap(), b"header");
    }

    #[test]
    fn test_regular_file_is_not_a_pipe() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            open_pipe(file.path()),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_filename_sink_uses_scope() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/{{{{Host}}}}.pcapng", dir.path().display());
        let mut config = SinkConfig::new().with_filename(template);

        let sinks = OpenedSinks::open(&mut config, &CaptureScope::host("h1"))
            .await
            .unwrap();
        assert_eq!(sinks.blocks.len(), 1);
        assert!(sinks.records.is_empty());
        assert!(sinks.listener.is_none());
        assert!(dir.path().join("h1.pcapng").exists());
    }

    #[tokio::test]
    async fn test_listener_sink_keeps_headers_for_late_joiners() {
        let listener = Arc::new(LiveListener::bind("tcp:127.0.0.1:0").await.unwrap());
        let mut sink = ListenerSink(listener.clone());
        sink.write_block(BlockKind::SectionHeader, b"S").unwrap();
        sink.write_block(BlockKind::EnhancedPacket, b"P").unwrap();

        let addr = match listener.local_addr() {
            nettrace_listener::ListenAddress::Tcp(addr) => addr.clone(),
            other => panic!("unexpected address {}", other),
        };
        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        while listener.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"S");
    }
}
