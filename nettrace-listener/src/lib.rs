//! Live listener fan-out for nettrace
//!
//! Consumers such as a live analysis tool connect to a [`LiveListener`] and
//! receive a real-time copy of the trace stream, independent of any durable
//! file output.
//!
//! # Example
//!
//! ```no_run
//! use nettrace_listener::LiveListener;
//!
//! # async fn demo() -> nettrace_core::Result<()> {
//! let listener = LiveListener::bind("tcp:127.0.0.1:5555").await?;
//! listener.append_preamble(b"stream header");
//! listener.broadcast(b"record");
//! listener.close();
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod listener;

pub use address::{ListenAddress, DEFAULT_NETWORK};
pub use listener::{LiveListener, DEFAULT_WRITE_TIMEOUT};
