//! pcapng output for nettrace
//!
//! A [`PcapNgWriter`] encodes the merged record stream once and fans the
//! encoded blocks out to any number of [`BlockSink`]s: files, named pipes or
//! a live listener.

pub mod secrets;
pub mod sink;
pub mod writer;

pub use secrets::SecretsKind;
pub use sink::{BlockKind, BlockSink, WriterSink};
pub use writer::{PcapNgWriter, SectionInfo, TraceWriter, DECRYPTION_SECRETS_BLOCK_TYPE};
