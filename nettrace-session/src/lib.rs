//! Capture sessions for nettrace
//!
//! A [`CaptureSession`] merges records from any number of packet sources
//! (live interface captures and tracepoint feeds) into one time-ordered
//! pcapng trace.
//!
//! ## How records flow
//!
//! 1. Every started source gets a read loop on its own thread that pushes
//!    records into a shared [`MergeQueue`].
//! 2. The [`FlushScheduler`] releases queued records once they are older
//!    than the lag tolerance, so a slightly older record arriving late from
//!    another interface can still overtake them.
//! 3. Released records go to the trace writer, which fans the encoded
//!    blocks out to files, named pipes and live listeners, and to any
//!    record channel or callback.
//! 4. [`CaptureSession::close`] stops the read loops, releases everything
//!    still queued and flushes.
//!
//! ## Example
//!
//! ```no_run
//! use nettrace_core::InterfaceRef;
//! use nettrace_session::{CaptureScope, CaptureSession, SessionConfig, SinkConfig};
//!
//! # async fn demo() -> nettrace_core::Result<()> {
//! let config = SessionConfig::default()
//!     .with_comment("ping test")
//!     .with_scope(CaptureScope::host("h1"))
//!     .with_sinks(
//!         SinkConfig::new()
//!             .with_filename("/tmp/{{Host}}.pcapng")
//!             .with_listener("tcp:127.0.0.1:5555"),
//!     );
//!
//! let session = CaptureSession::open(config).await?;
//! session.start_interface(&InterfaceRef::new("h1", "eth0"))?;
//! let tracer = session.start_tracer("h1/app")?;
//! tracer.log("starting ping")?;
//!
//! let report = session.close().await?;
//! println!("released {} records", report.stats.released);
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod keylog;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod sink;

pub use capture::CaptureHandle;
pub use config::{CaptureScope, RecordCallback, SessionConfig, SinkConfig, DEFAULT_APPLICATION};
pub use keylog::KeyLogPipe;
pub use queue::{MergeQueue, DEFAULT_MAX_QUEUED};
pub use registry::{InterfaceRegistry, RegisteredInterface, Registration};
pub use scheduler::{
    Command, FlushScheduler, SchedulerConfig, SchedulerCounters, SchedulerHandle,
    DEFAULT_LAG_TOLERANCE, DEFAULT_RELEASE_INTERVAL, DEFAULT_STATS_INTERVAL,
};
pub use session::{CaptureSession, SessionReport, SessionStats};
pub use sink::{open_pipe, ListenerSink, RecordSink};
